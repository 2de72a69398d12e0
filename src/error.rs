//! Error types for the image2doc library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`PipelineError`]: **Fatal**: the run cannot proceed at all (invalid
//!   region of interest, OCR engine missing, unreadable input directory).
//!   Returned as `Err(PipelineError)` from [`crate::organize::organize`].
//!
//! * [`PageError`]: **Non-fatal**: a single image could not be read, could
//!   not be numbered automatically, or its PDF could not be written. Stored in
//!   [`crate::output::ImageReport`] so one bad scan never costs the batch.
//!
//! Some page errors are *escalation reasons* rather than failures: an
//! unparseable or duplicate number routes the image to the manual-correction
//! gate, and only a declined correction ends in an error-marked PDF.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the image2doc library.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Configuration errors ─────────────────────────────────────────────
    /// Region-of-interest fractions are outside `[0, 1]` or describe an
    /// empty rectangle.
    #[error("Invalid region of interest {left}..{right} x {top}..{bottom}: {reason}")]
    InvalidRegion {
        left: f32,
        top: f32,
        right: f32,
        bottom: f32,
        reason: String,
    },

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Engine errors ────────────────────────────────────────────────────
    /// The OCR engine cannot be invoked; no image could be processed.
    #[error("OCR engine '{engine}' is unavailable: {detail}\nInstall it with: apt install tesseract-ocr tesseract-ocr-por")]
    OcrEngineUnavailable { engine: String, detail: String },

    // ── I/O errors ───────────────────────────────────────────────────────
    /// The input directory does not exist or is not a directory.
    #[error("Input directory not found: '{path}'")]
    InputDirNotFound { path: PathBuf },

    /// The input directory exists but could not be listed.
    #[error("Failed to read input directory '{path}': {source}")]
    InputDirUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The output directory could not be created.
    #[error("Failed to create output directory '{path}': {source}")]
    OutputDirFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Catch-all ────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for a single image.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
pub enum PageError {
    /// OCR produced no usable page number.
    #[error("{file}: no page number could be read from {text:?}")]
    UnparseableOcrResult { file: String, text: String },

    /// Another image already produced this output.
    #[error("{file}: '{output}' was already produced by {holder}")]
    DuplicatePageNumber {
        file: String,
        output: String,
        holder: String,
    },

    /// The number read lies outside `[1, max_pages]`.
    #[error("{file}: page {number} is outside 1..={max_pages}")]
    PageOutOfRange {
        file: String,
        number: u32,
        max_pages: u32,
    },

    /// The human reviewer (or cancellation) marked the image as an error.
    #[error("{file}: manual correction declined")]
    ManualCorrectionDeclined { file: String },

    /// The image file vanished or could not be read after listing.
    #[error("{file}: cannot read file: {detail}")]
    SourceUnreadable { file: String, detail: String },

    /// The image file could not be decoded.
    #[error("{file}: image could not be decoded: {detail}")]
    DecodeFailed { file: String, detail: String },

    /// The OCR engine failed on this image only.
    #[error("{file}: OCR failed: {detail}")]
    OcrFailed { file: String, detail: String },

    /// The PDF could not be written (disk full, permission).
    #[error("{file}: failed to write '{output}': {detail}")]
    WriteFailure {
        file: String,
        output: String,
        detail: String,
    },

    /// The PDF was written but the cache index could not be updated.
    #[error("{file}: cache update failed: {detail}")]
    CacheWriteFailed { file: String, detail: String },
}

impl PageError {
    /// Whether this error left the image without any output file.
    pub fn is_terminal_failure(&self) -> bool {
        matches!(
            self,
            PageError::SourceUnreadable { .. }
                | PageError::DecodeFailed { .. }
                | PageError::WriteFailure { .. }
        )
    }
}

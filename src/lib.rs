//! # image2doc
//!
//! Turn a pile of scanned book pages into one correctly named PDF per sheet.
//!
//! Registry books are scanned page by page, often out of order, sideways, or
//! twice. Every sheet carries a printed number ("FOLHA 7", "FL. 12") in a
//! fixed corner. This crate reads that number with OCR, decides what each
//! scan is (front, verso, opening or closing term, unreadable) and writes
//! `FL. 007.pdf`, `FL. 007-verso.pdf`, `TERMO DE ABERTURA.pdf`, ... into an
//! output directory. Scans it cannot number are handed to a human reviewer,
//! and a persistent cache makes reruns skip everything already done.
//!
//! ## Pipeline Overview
//!
//! ```text
//! input dir
//!  │
//!  ├─ 1. Source    list + sort + fingerprint images, skip cache hits
//!  ├─ 2. Region    rotate landscape scans, crop the number band (spawn_blocking)
//!  ├─ 3. Reader    OCR band and full page via Tesseract, parse the number
//!  ├─ 4. Classify  terms, regular pages, blank versos, duplicates (ledger)
//!  ├─ 5. Correct   ask a human over a channel when unresolved
//!  └─ 6. Assemble  single-page PDF (lopdf), atomic write, cache record
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use image2doc::{organize, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::builder().max_pages(200).build()?;
//!     let output = organize("scans/", "livro-3/", &config).await?;
//!     eprintln!(
//!         "{} pages, {} terms, {} errors",
//!         output.summary.regular, output.summary.special, output.summary.error_marked
//!     );
//!     Ok(())
//! }
//! ```
//!
//! ## Manual Correction
//!
//! ```rust,no_run
//! use image2doc::{correction_channel, organize, CorrectionResponse, PipelineConfig, Side};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let (tx, mut rx) = correction_channel(4);
//! tokio::spawn(async move {
//!     while let Some(request) = rx.recv().await {
//!         // Show request.path to a person; here we trust the suggestion.
//!         match request.suggestion {
//!             Some(number) => request.respond(CorrectionResponse::Page { number, side: Side::Front }),
//!             None => request.decline(),
//!         };
//!     }
//! });
//! let config = PipelineConfig::builder().corrections(tx).build()?;
//! organize("scans/", "out/", &config).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `image2doc` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! image2doc = { version = "0.3", default-features = false }
//! ```
//!
//! ## Requirements
//!
//! The default engine runs the `tesseract` binary with the configured language
//! pack (`por` unless changed). Any other engine can be plugged in through
//! [`OcrEngine`].

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod organize;
pub mod output;
pub mod pipeline;
pub mod progress;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    FingerprintMode, PipelineConfig, PipelineConfigBuilder, RegionOfInterest, SidePredicate, SideRule,
    TermMarkers,
};
pub use error::{PageError, PipelineError};
pub use organize::{inspect, organize, organize_sync};
pub use output::{ImageReport, ImageStatus, InspectEntry, PageDecision, RunOutput, RunSummary, Side};
pub use pipeline::cache::{CacheEntry, ProcessingCache};
pub use pipeline::correction::{
    correction_channel, CorrectionReceiver, CorrectionRequest, CorrectionResponse, CorrectionSender,
    GateState,
};
pub use pipeline::reader::{OcrEngine, OcrError, OcrOutcome, Recognition, RecognitionMode, TesseractEngine};
pub use progress::{NoopProgressCallback, PipelineProgressCallback, ProgressCallback};

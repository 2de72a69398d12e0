//! Page-number reading: run OCR on the region and turn its text into a candidate.
//!
//! The engine is behind the [`OcrEngine`] trait so the pipeline can be driven
//! by the Tesseract CLI in production and by a scripted engine in tests. All
//! engine calls are blocking and happen inside `spawn_blocking`.
//!
//! ## Parsing rules
//!
//! Applied in order to the region text, first match wins:
//!
//! 1. `FOLHA` / `FL` / `FLS` followed by digits → clean candidate
//! 2. the whole text is a number (optionally with a verso marker) → clean candidate
//! 3. the first run of digits anywhere → candidate, *not* clean
//!
//! No digits at all is not an error: the outcome simply has no candidate.
//! [`relaxed_candidate`] is a second, more permissive pass that maps common
//! OCR look-alikes (`O`→`0`, `l`→`1`, ...) before giving up.

use crate::config::PipelineConfig;
use crate::error::{PageError, PipelineError};
use crate::pipeline::region::{crop_region, orientation_candidates};
use image::{DynamicImage, ImageFormat};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use thiserror::Error;
use tracing::{debug, warn};

// ── Engine abstraction ───────────────────────────────────────────────────

/// Errors from an OCR engine.
#[derive(Debug, Error)]
pub enum OcrError {
    /// The engine cannot run at all (binary or language data missing).
    #[error("engine not available: {0}")]
    Unavailable(String),

    /// The engine ran but failed on this input.
    #[error("recognition failed: {0}")]
    Failed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which part of the page is being recognised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecognitionMode {
    /// The cropped sheet-number region.
    Region,
    /// The whole page, used for term detection and blank-verso checks.
    FullPage,
}

/// Raw engine output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Recognition {
    pub text: String,
    /// Mean word confidence in `[0, 1]`, if the engine reports one.
    pub confidence: Option<f32>,
}

/// An OCR engine.
///
/// Implementations must be `Send + Sync`; one instance is shared by every
/// worker.
pub trait OcrEngine: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &str;

    /// Check the engine can run. Called once before any image is dispatched.
    fn probe(&self) -> Result<(), OcrError>;

    /// Recognise text in `image`.
    fn recognize(&self, image: &DynamicImage, mode: RecognitionMode) -> Result<Recognition, OcrError>;
}

// ── Tesseract CLI engine ─────────────────────────────────────────────────

/// Tesseract invoked as a subprocess with TSV output.
#[derive(Debug, Clone)]
pub struct TesseractEngine {
    binary: PathBuf,
    language: String,
    oem: u8,
    region_psm: u8,
    full_page_psm: u8,
}

impl TesseractEngine {
    pub fn new(language: impl Into<String>) -> Self {
        Self {
            binary: PathBuf::from("tesseract"),
            language: language.into(),
            oem: 3,
            region_psm: 6,
            full_page_psm: 3,
        }
    }

    /// Engine using the OCR settings of `config`.
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            binary: PathBuf::from("tesseract"),
            language: config.ocr_language.clone(),
            oem: config.oem_mode,
            region_psm: config.psm_mode,
            full_page_psm: config.full_page_psm,
        }
    }

    /// Use a specific `tesseract` executable instead of the one on `PATH`.
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    fn run(&self, args: &[&str]) -> Result<std::process::Output, OcrError> {
        match Command::new(&self.binary).args(args).output() {
            Ok(output) => Ok(output),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(OcrError::Unavailable(format!(
                "'{}' not found on PATH",
                self.binary.display()
            ))),
            Err(e) => Err(OcrError::Io(e)),
        }
    }
}

impl OcrEngine for TesseractEngine {
    fn name(&self) -> &str {
        "tesseract"
    }

    fn probe(&self) -> Result<(), OcrError> {
        let version = self.run(&["--version"])?;
        if !version.status.success() {
            return Err(OcrError::Unavailable(
                String::from_utf8_lossy(&version.stderr).trim().to_string(),
            ));
        }

        // Older releases print the list on stderr.
        let langs = self.run(&["--list-langs"])?;
        let listed = format!(
            "{}\n{}",
            String::from_utf8_lossy(&langs.stdout),
            String::from_utf8_lossy(&langs.stderr)
        );
        let installed: Vec<&str> = listed.lines().map(str::trim).collect();
        for lang in self.language.split('+') {
            if !installed.contains(&lang) {
                return Err(OcrError::Unavailable(format!(
                    "language pack '{lang}' is not installed"
                )));
            }
        }
        Ok(())
    }

    fn recognize(&self, image: &DynamicImage, mode: RecognitionMode) -> Result<Recognition, OcrError> {
        let psm = match mode {
            RecognitionMode::Region => self.region_psm,
            RecognitionMode::FullPage => self.full_page_psm,
        };

        let file = tempfile::Builder::new()
            .prefix("image2doc-")
            .suffix(".png")
            .tempfile()?;
        image
            .save_with_format(file.path(), ImageFormat::Png)
            .map_err(|e| OcrError::Failed(format!("could not stage image: {e}")))?;

        let path = file.path().to_string_lossy().into_owned();
        let (oem, psm) = (self.oem.to_string(), psm.to_string());
        let output = self.run(&[
            &path,
            "stdout",
            "-l",
            &self.language,
            "--oem",
            &oem,
            "--psm",
            &psm,
            "tsv",
        ])?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("Failed loading language") {
                return Err(OcrError::Unavailable(stderr.trim().to_string()));
            }
            return Err(OcrError::Failed(stderr.trim().to_string()));
        }

        Ok(parse_tsv(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parse Tesseract's TSV output into text and mean word confidence.
///
/// Words are joined with spaces within a line and lines with `\n`. Rows with a
/// negative confidence are layout rows and carry no word.
pub fn parse_tsv(tsv: &str) -> Recognition {
    let mut lines: BTreeMap<(u32, u32, u32, u32), Vec<&str>> = BTreeMap::new();
    let mut conf_sum = 0.0f32;
    let mut conf_count = 0usize;

    for row in tsv.lines().skip(1) {
        let cols: Vec<&str> = row.split('\t').collect();
        if cols.len() < 12 {
            continue;
        }
        let conf: f32 = cols[10].trim().parse().unwrap_or(-1.0);
        let word = cols[11].trim();
        if conf < 0.0 || word.is_empty() {
            continue;
        }
        let num = |i: usize| cols[i].trim().parse::<u32>().unwrap_or(0);
        lines
            .entry((num(1), num(2), num(3), num(4)))
            .or_default()
            .push(word);
        conf_sum += conf;
        conf_count += 1;
    }

    let text = lines
        .values()
        .map(|words| words.join(" "))
        .collect::<Vec<_>>()
        .join("\n");
    let confidence = (conf_count > 0).then(|| (conf_sum / conf_count as f32 / 100.0).clamp(0.0, 1.0));
    Recognition { text, confidence }
}

// ── Parsing ──────────────────────────────────────────────────────────────

static RE_PREFIXED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:FOLHAS?|FLS?)\s*[:.\s]*(\d+)").unwrap());

static RE_BARE_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(\d+)\s*(?:-?\s*v(?:erso)?)?\s*[.,]?\s*$").unwrap());

static RE_DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").unwrap());

static RE_PREFIXED_LOOSE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:FOLHAS?|FLS?)\b\s*[:.\s]*([0-9OoIl|SZBG]+)(?:\W|$)").unwrap());

/// Digit string to number; overlong runs saturate so they fail the bounds check.
fn to_number(digits: &str) -> u32 {
    digits.parse().unwrap_or(u32::MAX)
}

/// Apply the parsing rules to region text: `(candidate, clean)`.
pub fn parse_candidate(text: &str) -> (Option<u32>, bool) {
    if let Some(caps) = RE_PREFIXED.captures(text) {
        return (Some(to_number(&caps[1])), true);
    }
    if let Some(caps) = RE_BARE_NUMBER.captures(text) {
        return (Some(to_number(&caps[1])), true);
    }
    match RE_DIGITS.find(text) {
        Some(m) => (Some(to_number(m.as_str())), false),
        None => (None, false),
    }
}

fn map_look_alikes(token: &str) -> Option<String> {
    token
        .chars()
        .map(|c| match c {
            '0'..='9' => Some(c),
            'O' | 'o' => Some('0'),
            'I' | 'l' | '|' => Some('1'),
            'S' => Some('5'),
            'B' => Some('8'),
            'Z' => Some('2'),
            'G' => Some('6'),
            _ => None,
        })
        .collect()
}

/// Second-chance parse tolerant of common OCR look-alikes.
///
/// Mirrors the two strict rules: a token following a `FL`/`FOLHA` prefix, or
/// a text made of a single token that already contains a digit. Plain words
/// are never turned into numbers.
pub fn relaxed_candidate(text: &str) -> Option<u32> {
    if let Some(caps) = RE_PREFIXED_LOOSE.captures(text) {
        if let Some(digits) = map_look_alikes(&caps[1]) {
            return Some(to_number(&digits));
        }
    }
    let mut tokens = text.split_whitespace();
    let token = tokens
        .next()?
        .trim_matches(|c: char| matches!(c, '.' | ',' | ':' | ';' | '-'));
    if tokens.next().is_some() || !token.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    map_look_alikes(token).map(|digits| to_number(&digits))
}

// ── Outcome ──────────────────────────────────────────────────────────────

/// What OCR produced for one image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OcrOutcome {
    /// Raw region text.
    pub text: String,
    /// Engine confidence of the region text, if reported.
    pub engine_confidence: Option<f32>,
    /// Parsed page number, if any digits were found.
    pub candidate: Option<u32>,
    /// Whether the candidate came from a strict rule (prefix or bare number).
    pub clean: bool,
    /// Full-page text, when the full-page scan ran.
    pub full_text: Option<String>,
}

impl OcrOutcome {
    const CLEAN_RANK: u8 = 2;

    /// How useful this reading is when comparing orientations: a clean
    /// number beats loose digits, which beat nothing.
    fn rank(&self) -> u8 {
        match (self.candidate, self.clean) {
            (Some(_), true) => Self::CLEAN_RANK,
            (Some(_), false) => 1,
            (None, _) => 0,
        }
    }

    /// Build an outcome from the region recognition.
    pub fn from_recognition(rec: Recognition) -> Self {
        let (candidate, clean) = parse_candidate(&rec.text);
        Self {
            text: rec.text,
            engine_confidence: rec.confidence,
            candidate,
            clean,
            full_text: None,
        }
    }

    /// Whether the engine's confidence passes `threshold`. Engines that report
    /// no confidence always pass.
    pub fn engine_confident(&self, threshold: f32) -> bool {
        self.engine_confidence.map_or(true, |c| c >= threshold)
    }

    /// Whether the candidate can be accepted without review.
    pub fn is_confident(&self, threshold: f32) -> bool {
        self.candidate.is_some() && self.clean && self.engine_confident(threshold)
    }

    /// Relaxed re-parse of the region text.
    pub fn relaxed_candidate(&self) -> Option<u32> {
        relaxed_candidate(&self.text)
    }

    /// Non-whitespace characters of the full-page text.
    pub fn full_text_chars(&self) -> Option<usize> {
        self.full_text
            .as_ref()
            .map(|t| t.chars().filter(|c| !c.is_whitespace()).count())
    }
}

// ── Reading a page ───────────────────────────────────────────────────────

/// Oriented image plus everything OCR read from it.
#[derive(Debug)]
pub struct PageReading {
    /// The image in the orientation that was kept; this is what gets rendered.
    pub image: DynamicImage,
    pub outcome: OcrOutcome,
    /// Set when the engine failed on this image; the outcome is then empty.
    pub ocr_error: Option<PageError>,
}

fn engine_unavailable(engine: &dyn OcrEngine, detail: String) -> PipelineError {
    PipelineError::OcrEngineUnavailable {
        engine: engine.name().to_string(),
        detail,
    }
}

/// Orient `image`, OCR its region and (optionally) the full page.
///
/// Blocking. An unavailable engine is fatal for the run; any other engine
/// failure only affects this image and is returned in
/// [`PageReading::ocr_error`].
pub fn read_page(
    engine: &dyn OcrEngine,
    image: DynamicImage,
    config: &PipelineConfig,
    file_name: &str,
) -> Result<PageReading, PipelineError> {
    let mut kept: Option<(DynamicImage, OcrOutcome)> = None;
    // Rank of the kept reading; `None` while only failures were seen.
    let mut best: Option<u8> = None;
    let mut ocr_error = None;

    for oriented in orientation_candidates(image, config.auto_rotate) {
        let crop = DynamicImage::ImageLuma8(crop_region(&oriented, &config.roi)?);
        match engine.recognize(&crop, RecognitionMode::Region) {
            Ok(rec) => {
                let outcome = OcrOutcome::from_recognition(rec);
                let rank = outcome.rank();
                if best.is_none_or(|b| rank > b) {
                    kept = Some((oriented, outcome));
                    best = Some(rank);
                    ocr_error = None;
                }
                // Only a clean reading ends the search.
                if rank == OcrOutcome::CLEAN_RANK {
                    break;
                }
            }
            Err(OcrError::Unavailable(detail)) => return Err(engine_unavailable(engine, detail)),
            Err(e) => {
                warn!("{}: region OCR failed: {}", file_name, e);
                if best.is_none() {
                    ocr_error = Some(PageError::OcrFailed {
                        file: file_name.to_string(),
                        detail: e.to_string(),
                    });
                }
                if kept.is_none() {
                    kept = Some((oriented, OcrOutcome::default()));
                }
            }
        }
    }
    let (oriented, mut outcome) = kept.ok_or_else(|| {
        PipelineError::Internal(format!("{file_name}: no orientation was tried"))
    })?;

    if config.scan_full_page {
        match engine.recognize(&oriented, RecognitionMode::FullPage) {
            Ok(rec) => outcome.full_text = Some(rec.text),
            Err(OcrError::Unavailable(detail)) => return Err(engine_unavailable(engine, detail)),
            Err(e) => warn!("{}: full-page OCR failed: {}", file_name, e),
        }
    }

    debug!(
        "{}: region text {:?} → candidate {:?} (clean={}, conf={:?})",
        file_name, outcome.text, outcome.candidate, outcome.clean, outcome.engine_confidence
    );

    Ok(PageReading {
        image: oriented,
        outcome,
        ocr_error,
    })
}

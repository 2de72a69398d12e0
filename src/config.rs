//! Configuration types for organising a batch of scanned pages.
//!
//! All pipeline behaviour is controlled through [`PipelineConfig`], built via
//! its [`PipelineConfigBuilder`]. The config is cheap to clone and shared
//! read-only by every worker; the only shared mutable state (cache index,
//! duplicate ledger) lives in dedicated objects, never in the config.

use crate::pipeline::correction::CorrectionSender;
use crate::error::PipelineError;
use crate::output::Side;
use crate::pipeline::cache::ProcessingCache;
use crate::pipeline::reader::{OcrEngine, OcrOutcome};
use crate::progress::ProgressCallback;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Configuration for one organising run.
///
/// Built via [`PipelineConfig::builder()`] or using
/// [`PipelineConfig::default()`].
///
/// # Example
/// ```rust
/// use image2doc::{PipelineConfig, RegionOfInterest};
///
/// let config = PipelineConfig::builder()
///     .max_pages(250)
///     .worker_count(4)
///     .ocr_language("por")
///     .roi(RegionOfInterest::new(0.5, 0.0, 1.0, 0.2))
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Highest valid sheet number of the book. Default: 300.
    ///
    /// Numbers read outside `[1, max_pages]` are never accepted as regular
    /// pages; they are escalated to manual correction.
    pub max_pages: u32,

    /// Number of images processed in parallel. `0` = one per available core.
    pub worker_count: usize,

    /// Tesseract language pack. Default: "por".
    pub ocr_language: String,

    /// Region where the printed sheet number is expected.
    pub roi: RegionOfInterest,

    /// Tesseract page segmentation mode for the region. Default: 6 (one uniform block).
    pub psm_mode: u8,

    /// Tesseract engine mode. Default: 3 (default engine).
    pub oem_mode: u8,

    /// Segmentation mode for the full-page term scan. Default: 3 (automatic).
    pub full_page_psm: u8,

    /// Minimum engine confidence (0.0–1.0) for a number to be accepted
    /// without review. Default: 0.5. Ignored when the engine reports none.
    pub min_confidence: f32,

    /// Rotate landscape scans to portrait, probing both directions. Default: true.
    pub auto_rotate: bool,

    /// OCR the whole page to detect opening/closing term pages and blank
    /// versos. Default: true.
    pub scan_full_page: bool,

    /// How front and verso are told apart for numbered pages.
    pub side_rule: SideRule,

    /// A page without a number whose full-page text has fewer non-blank
    /// characters than this is the verso of the preceding image's sheet.
    /// `None` disables the rule. Default: `Some(250)`.
    pub blank_verso_max_chars: Option<usize>,

    /// File-name and text markers identifying term pages.
    pub term_markers: TermMarkers,

    /// How unchanged images are recognised across runs.
    pub fingerprint_mode: FingerprintMode,

    /// Resolution used to size the PDF page. Default: 100.
    pub pdf_dpi: f32,

    /// JPEG quality of the embedded page image (1–100). Default: 90.
    pub jpeg_quality: u8,

    /// OCR engine. If None, a Tesseract CLI engine is built from the OCR fields.
    pub engine: Option<Arc<dyn OcrEngine>>,

    /// Processing cache. If None, `<output_dir>/.image2doc-cache.json` is used.
    pub cache: Option<Arc<ProcessingCache>>,

    /// Receives per-image progress events.
    pub progress_callback: Option<ProgressCallback>,

    /// Channel to the human reviewer. If None, unresolved images are
    /// error-marked without asking.
    pub corrections: Option<CorrectionSender>,

    /// Cancels the run: stops dispatch and declines pending corrections.
    pub cancel_token: Option<CancellationToken>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_pages: 300,
            worker_count: 0,
            ocr_language: "por".to_string(),
            roi: RegionOfInterest::default(),
            psm_mode: 6,
            oem_mode: 3,
            full_page_psm: 3,
            min_confidence: 0.5,
            auto_rotate: true,
            scan_full_page: true,
            side_rule: SideRule::default(),
            blank_verso_max_chars: Some(250),
            term_markers: TermMarkers::default(),
            fingerprint_mode: FingerprintMode::default(),
            pdf_dpi: 100.0,
            jpeg_quality: 90,
            engine: None,
            cache: None,
            progress_callback: None,
            corrections: None,
            cancel_token: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("max_pages", &self.max_pages)
            .field("worker_count", &self.worker_count)
            .field("ocr_language", &self.ocr_language)
            .field("roi", &self.roi)
            .field("psm_mode", &self.psm_mode)
            .field("oem_mode", &self.oem_mode)
            .field("min_confidence", &self.min_confidence)
            .field("auto_rotate", &self.auto_rotate)
            .field("scan_full_page", &self.scan_full_page)
            .field("side_rule", &self.side_rule)
            .field("blank_verso_max_chars", &self.blank_verso_max_chars)
            .field("fingerprint_mode", &self.fingerprint_mode)
            .field("engine", &self.engine.as_ref().map(|e| e.name().to_string()))
            .field("corrections", &self.corrections.is_some())
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Worker count with `0` resolved to the number of available cores.
    pub fn effective_workers(&self) -> usize {
        if self.worker_count > 0 {
            return self.worker_count;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    /// Whether `number` is a valid regular sheet number.
    pub fn in_bounds(&self, number: u32) -> bool {
        (1..=self.max_pages).contains(&number)
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn max_pages(mut self, n: u32) -> Self {
        self.config.max_pages = n;
        self
    }

    pub fn worker_count(mut self, n: usize) -> Self {
        self.config.worker_count = n;
        self
    }

    pub fn ocr_language(mut self, lang: impl Into<String>) -> Self {
        self.config.ocr_language = lang.into();
        self
    }

    pub fn roi(mut self, roi: RegionOfInterest) -> Self {
        self.config.roi = roi;
        self
    }

    pub fn psm_mode(mut self, psm: u8) -> Self {
        self.config.psm_mode = psm;
        self
    }

    pub fn oem_mode(mut self, oem: u8) -> Self {
        self.config.oem_mode = oem;
        self
    }

    pub fn full_page_psm(mut self, psm: u8) -> Self {
        self.config.full_page_psm = psm;
        self
    }

    pub fn min_confidence(mut self, c: f32) -> Self {
        self.config.min_confidence = c;
        self
    }

    pub fn auto_rotate(mut self, v: bool) -> Self {
        self.config.auto_rotate = v;
        self
    }

    pub fn scan_full_page(mut self, v: bool) -> Self {
        self.config.scan_full_page = v;
        self
    }

    pub fn side_rule(mut self, rule: SideRule) -> Self {
        self.config.side_rule = rule;
        self
    }

    pub fn blank_verso_max_chars(mut self, n: Option<usize>) -> Self {
        self.config.blank_verso_max_chars = n;
        self
    }

    pub fn term_markers(mut self, markers: TermMarkers) -> Self {
        self.config.term_markers = markers;
        self
    }

    pub fn fingerprint_mode(mut self, mode: FingerprintMode) -> Self {
        self.config.fingerprint_mode = mode;
        self
    }

    pub fn pdf_dpi(mut self, dpi: f32) -> Self {
        self.config.pdf_dpi = dpi;
        self
    }

    pub fn jpeg_quality(mut self, q: u8) -> Self {
        self.config.jpeg_quality = q;
        self
    }

    pub fn engine(mut self, engine: Arc<dyn OcrEngine>) -> Self {
        self.config.engine = Some(engine);
        self
    }

    pub fn cache(mut self, cache: Arc<ProcessingCache>) -> Self {
        self.config.cache = Some(cache);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    pub fn corrections(mut self, tx: CorrectionSender) -> Self {
        self.config.corrections = Some(tx);
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.config.cancel_token = Some(token);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let c = &self.config;
        c.roi.validate()?;
        if c.max_pages == 0 {
            return Err(PipelineError::InvalidConfig(
                "max_pages must be ≥ 1".into(),
            ));
        }
        if c.psm_mode > 13 || c.full_page_psm > 13 {
            return Err(PipelineError::InvalidConfig(format!(
                "page segmentation mode must be 0–13, got {}/{}",
                c.psm_mode, c.full_page_psm
            )));
        }
        if c.oem_mode > 3 {
            return Err(PipelineError::InvalidConfig(format!(
                "OCR engine mode must be 0–3, got {}",
                c.oem_mode
            )));
        }
        if !(0.0..=1.0).contains(&c.min_confidence) {
            return Err(PipelineError::InvalidConfig(format!(
                "min_confidence must be 0.0–1.0, got {}",
                c.min_confidence
            )));
        }
        if c.ocr_language.trim().is_empty() {
            return Err(PipelineError::InvalidConfig(
                "ocr_language must not be empty".into(),
            ));
        }
        if c.pdf_dpi.is_nan() || c.pdf_dpi <= 0.0 {
            return Err(PipelineError::InvalidConfig(format!(
                "pdf_dpi must be positive, got {}",
                c.pdf_dpi
            )));
        }
        if c.jpeg_quality == 0 || c.jpeg_quality > 100 {
            return Err(PipelineError::InvalidConfig(format!(
                "jpeg_quality must be 1–100, got {}",
                c.jpeg_quality
            )));
        }
        Ok(self.config)
    }
}

// ── Region of interest ───────────────────────────────────────────────────

/// Rectangle where the sheet number is printed, as fractions of the page
/// width and height.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegionOfInterest {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl Default for RegionOfInterest {
    /// Upper-right band of the page, where Brazilian registry books stamp
    /// the "FOLHA" number.
    fn default() -> Self {
        Self::new(0.45, 0.05, 0.95, 0.25)
    }
}

impl RegionOfInterest {
    pub const fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// The whole page.
    pub const fn full() -> Self {
        Self::new(0.0, 0.0, 1.0, 1.0)
    }

    /// Reject fractions outside `[0, 1]` and empty rectangles.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let invalid = |reason: &str| PipelineError::InvalidRegion {
            left: self.left,
            top: self.top,
            right: self.right,
            bottom: self.bottom,
            reason: reason.to_string(),
        };
        let coords = [self.left, self.top, self.right, self.bottom];
        if coords.iter().any(|c| !(0.0..=1.0).contains(c)) {
            return Err(invalid("fractions must lie in [0, 1]"));
        }
        if self.left >= self.right {
            return Err(invalid("left must be < right"));
        }
        if self.top >= self.bottom {
            return Err(invalid("top must be < bottom"));
        }
        Ok(())
    }
}

// ── Side rule ────────────────────────────────────────────────────────────

static RE_VERSO_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:\d\s*-?\s*v\b|\bverso\b)").unwrap());

/// Predicate type for [`SideRule::Custom`].
pub type SidePredicate = Arc<dyn Fn(u32, &OcrOutcome) -> Side + Send + Sync>;

/// Decides whether a numbered page is a front or a verso.
///
/// Scans differ in how the back of a sheet is marked, so the rule is
/// configurable rather than hard-coded parity.
#[derive(Clone)]
pub enum SideRule {
    /// Every numbered page is a front.
    Never,
    /// The region text carries a verso marker (`7v`, `7-v`, `verso`).
    Marker(Regex),
    /// Parity of the number decides the side.
    Parity { verso_on_even: bool },
    /// Caller-supplied predicate.
    Custom(SidePredicate),
}

impl Default for SideRule {
    fn default() -> Self {
        SideRule::Marker(RE_VERSO_MARKER.clone())
    }
}

impl fmt::Debug for SideRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SideRule::Never => f.write_str("Never"),
            SideRule::Marker(re) => f.debug_tuple("Marker").field(&re.as_str()).finish(),
            SideRule::Parity { verso_on_even } => f
                .debug_struct("Parity")
                .field("verso_on_even", verso_on_even)
                .finish(),
            SideRule::Custom(_) => f.write_str("Custom(<fn>)"),
        }
    }
}

impl SideRule {
    /// Side of the sheet numbered `number`, read from `outcome`.
    pub fn side_for(&self, number: u32, outcome: &OcrOutcome) -> Side {
        match self {
            SideRule::Never => Side::Front,
            SideRule::Marker(re) => {
                if re.is_match(&outcome.text) {
                    Side::Verso
                } else {
                    Side::Front
                }
            }
            SideRule::Parity { verso_on_even } => {
                if (number % 2 == 0) == *verso_on_even {
                    Side::Verso
                } else {
                    Side::Front
                }
            }
            SideRule::Custom(predicate) => predicate(number, outcome),
        }
    }
}

// ── Term markers ─────────────────────────────────────────────────────────

/// Markers identifying the opening and closing term pages.
///
/// File-name markers are matched case-insensitively against the file stem;
/// text markers are matched case-insensitively against the full-page OCR text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermMarkers {
    pub opening_names: Vec<String>,
    pub closing_names: Vec<String>,
    pub opening_text: Vec<String>,
    pub closing_text: Vec<String>,
}

impl Default for TermMarkers {
    fn default() -> Self {
        Self {
            opening_names: vec!["termo de abertura".into(), "abertura".into()],
            closing_names: vec!["termo de encerramento".into(), "encerramento".into()],
            opening_text: vec![
                "TERMO DE ABERTURA".into(),
                "TERMO DE INSTALAÇÃO".into(),
                "TERMO DE INSTALACAO".into(),
            ],
            closing_text: vec!["TERMO DE ENCERRAMENTO".into()],
        }
    }
}

// ── Fingerprint mode ─────────────────────────────────────────────────────

/// How an image's identity across runs is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FingerprintMode {
    /// File name, size and modification time. Never reads the file. (default)
    #[default]
    Metadata,
    /// File name and a BLAKE3 hash of the content.
    Content,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(text: &str) -> OcrOutcome {
        OcrOutcome {
            text: text.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn defaults_match_registry_books() {
        let c = PipelineConfig::default();
        assert_eq!(c.max_pages, 300);
        assert_eq!(c.ocr_language, "por");
        assert_eq!(c.psm_mode, 6);
        assert_eq!(c.blank_verso_max_chars, Some(250));
        assert!(c.in_bounds(1));
        assert!(c.in_bounds(300));
        assert!(!c.in_bounds(0));
        assert!(!c.in_bounds(301));
    }

    #[test]
    fn zero_workers_resolves_to_cores() {
        let c = PipelineConfig::builder().worker_count(0).build().unwrap();
        assert!(c.effective_workers() >= 1);
        let c = PipelineConfig::builder().worker_count(3).build().unwrap();
        assert_eq!(c.effective_workers(), 3);
    }

    #[test]
    fn invalid_region_is_rejected() {
        let err = PipelineConfig::builder()
            .roi(RegionOfInterest::new(0.8, 0.0, 0.2, 0.5))
            .build()
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidRegion { .. }));

        let err = PipelineConfig::builder()
            .roi(RegionOfInterest::new(0.0, 0.0, 1.5, 0.5))
            .build()
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidRegion { .. }));

        let err = PipelineConfig::builder()
            .roi(RegionOfInterest::new(0.1, 0.4, 0.9, 0.4))
            .build()
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidRegion { .. }));
    }

    #[test]
    fn invalid_scalars_are_rejected() {
        assert!(PipelineConfig::builder().max_pages(0).build().is_err());
        assert!(PipelineConfig::builder().psm_mode(14).build().is_err());
        assert!(PipelineConfig::builder().min_confidence(1.5).build().is_err());
        assert!(PipelineConfig::builder().jpeg_quality(0).build().is_err());
        assert!(PipelineConfig::builder().pdf_dpi(0.0).build().is_err());
        assert!(PipelineConfig::builder().ocr_language(" ").build().is_err());
    }

    #[test]
    fn marker_rule_detects_verso() {
        let rule = SideRule::default();
        assert_eq!(rule.side_for(7, &outcome("FL. 7v")), Side::Verso);
        assert_eq!(rule.side_for(7, &outcome("FOLHA 7 - V")), Side::Verso);
        assert_eq!(rule.side_for(7, &outcome("7 verso")), Side::Verso);
        assert_eq!(rule.side_for(7, &outcome("FOLHA 7")), Side::Front);
        assert_eq!(rule.side_for(7, &outcome("FLS. 7 VOL 2")), Side::Front);
    }

    #[test]
    fn parity_rule() {
        let rule = SideRule::Parity {
            verso_on_even: true,
        };
        assert_eq!(rule.side_for(8, &outcome("")), Side::Verso);
        assert_eq!(rule.side_for(9, &outcome("")), Side::Front);
    }

    #[test]
    fn custom_rule_receives_outcome() {
        let rule = SideRule::Custom(Arc::new(|_: u32, o: &OcrOutcome| {
            if o.text.contains('*') {
                Side::Verso
            } else {
                Side::Front
            }
        }));
        assert_eq!(rule.side_for(1, &outcome("12*")), Side::Verso);
        assert_eq!(rule.side_for(1, &outcome("12")), Side::Front);
    }
}

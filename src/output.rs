//! Result types: per-image decisions, reports and the run summary.

use crate::error::PageError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Physical side of a sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    #[default]
    Front,
    Verso,
}

/// Final classification of one source image.
///
/// Exactly one decision exists per processed image. A `Regular` number always
/// lies in `[1, max_pages]`; anything else is routed to manual correction and,
/// failing that, to `UnresolvedError`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PageDecision {
    Regular { number: u32, side: Side },
    OpeningTerm,
    ClosingTerm,
    UnresolvedError,
}

/// Literal output name of the opening term page.
pub const OPENING_TERM_NAME: &str = "TERMO DE ABERTURA.pdf";
/// Literal output name of the closing term page.
pub const CLOSING_TERM_NAME: &str = "TERMO DE ENCERRAMENTO.pdf";
/// Prefix of every error-marked output.
pub const ERROR_PREFIX: &str = "ERRO_OCR_";

impl PageDecision {
    /// Output file name for this decision.
    ///
    /// `stem` is the source file name without its extension and is only used
    /// for [`PageDecision::UnresolvedError`].
    pub fn output_name(&self, stem: &str) -> String {
        match self {
            PageDecision::Regular { number, side } => {
                let suffix = match side {
                    Side::Front => "",
                    Side::Verso => "-verso",
                };
                format!("FL. {number:03}{suffix}.pdf")
            }
            PageDecision::OpeningTerm => OPENING_TERM_NAME.to_string(),
            PageDecision::ClosingTerm => CLOSING_TERM_NAME.to_string(),
            PageDecision::UnresolvedError => format!("{ERROR_PREFIX}{stem}.pdf"),
        }
    }

    /// The regular page number, if any.
    pub fn page_number(&self) -> Option<u32> {
        match self {
            PageDecision::Regular { number, .. } => Some(*number),
            _ => None,
        }
    }

    /// Opening or closing term.
    pub fn is_special_term(&self) -> bool {
        matches!(self, PageDecision::OpeningTerm | PageDecision::ClosingTerm)
    }
}

impl fmt::Display for PageDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageDecision::Regular {
                number,
                side: Side::Front,
            } => write!(f, "page {number}"),
            PageDecision::Regular {
                number,
                side: Side::Verso,
            } => write!(f, "page {number} (verso)"),
            PageDecision::OpeningTerm => f.write_str("opening term"),
            PageDecision::ClosingTerm => f.write_str("closing term"),
            PageDecision::UnresolvedError => f.write_str("unresolved"),
        }
    }
}

/// How an image left the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageStatus {
    /// OCR, classification and PDF emission ran for this image.
    Processed,
    /// Cache hit: unchanged image with an intact prior output.
    Skipped,
    /// Never dispatched because the run was cancelled.
    Cancelled,
    /// No output could be produced (undecodable image or write failure).
    Failed,
}

/// Outcome for a single source image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageReport {
    /// Position in the sorted input listing.
    pub index: usize,
    /// Source file name.
    pub file_name: String,
    pub status: ImageStatus,
    /// Decision taken (or recalled from the cache).
    pub decision: Option<PageDecision>,
    /// Output PDF file name inside the output directory.
    pub output: Option<String>,
    /// Whether a human supplied the decision.
    pub manually_corrected: bool,
    /// Why the image was escalated to manual correction, if it was.
    pub escalation: Option<PageError>,
    /// Terminal or reporting error for this image.
    pub error: Option<PageError>,
    /// Wall-clock time spent on this image.
    pub duration_ms: u64,
}

impl ImageReport {
    pub(crate) fn new(index: usize, file_name: impl Into<String>, status: ImageStatus) -> Self {
        Self {
            index,
            file_name: file_name.into(),
            status,
            decision: None,
            output: None,
            manually_corrected: false,
            escalation: None,
            error: None,
            duration_ms: 0,
        }
    }
}

/// Counts reported to the shell when a run finishes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Images found in the input directory.
    pub total: usize,
    /// Regular page outputs (front and verso) written in this run.
    pub regular: usize,
    /// Opening/closing term outputs written in this run.
    pub special: usize,
    /// Error-marked outputs written in this run.
    pub error_marked: usize,
    /// Images that ended without an output.
    pub failed: usize,
    /// Cache hits.
    pub skipped: usize,
    /// Images never dispatched because of cancellation.
    pub cancelled: usize,
    /// Total wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

impl RunSummary {
    /// Tally the reports of a run.
    pub fn from_reports(reports: &[ImageReport], duration_ms: u64) -> Self {
        let mut summary = RunSummary {
            total: reports.len(),
            duration_ms,
            ..Default::default()
        };
        for report in reports {
            match report.status {
                ImageStatus::Skipped => summary.skipped += 1,
                ImageStatus::Cancelled => summary.cancelled += 1,
                ImageStatus::Failed => summary.failed += 1,
                ImageStatus::Processed => match report.decision {
                    Some(ref d) if d.page_number().is_some() => summary.regular += 1,
                    Some(ref d) if d.is_special_term() => summary.special += 1,
                    _ => summary.error_marked += 1,
                },
            }
        }
        summary
    }

    /// Whether the run ended without cancellation.
    pub fn is_complete(&self) -> bool {
        self.cancelled == 0
    }
}

/// Everything a run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutput {
    /// One report per input image, in input order.
    pub reports: Vec<ImageReport>,
    pub summary: RunSummary,
    /// Whether the run was cancelled before every image was dispatched.
    pub cancelled: bool,
}

/// Dry-run view of one input image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectEntry {
    pub file_name: String,
    pub fingerprint: String,
    /// Output recorded in the cache, when the cache entry is still valid.
    pub cached_output: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regular_names_are_zero_padded() {
        let d = PageDecision::Regular {
            number: 7,
            side: Side::Front,
        };
        assert_eq!(d.output_name("page07"), "FL. 007.pdf");
        let v = PageDecision::Regular {
            number: 42,
            side: Side::Verso,
        };
        assert_eq!(v.output_name("x"), "FL. 042-verso.pdf");
    }

    #[test]
    fn wide_numbers_are_not_truncated() {
        let d = PageDecision::Regular {
            number: 1200,
            side: Side::Front,
        };
        assert_eq!(d.output_name("x"), "FL. 1200.pdf");
    }

    #[test]
    fn special_and_error_names() {
        assert_eq!(PageDecision::OpeningTerm.output_name("a"), "TERMO DE ABERTURA.pdf");
        assert_eq!(
            PageDecision::ClosingTerm.output_name("a"),
            "TERMO DE ENCERRAMENTO.pdf"
        );
        assert_eq!(
            PageDecision::UnresolvedError.output_name("scan_0042"),
            "ERRO_OCR_scan_0042.pdf"
        );
    }

    #[test]
    fn decision_json_is_tagged() {
        let d = PageDecision::Regular {
            number: 3,
            side: Side::Verso,
        };
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, r#"{"kind":"regular","number":3,"side":"verso"}"#);
        let closing: PageDecision = serde_json::from_str(r#"{"kind":"closing_term"}"#).unwrap();
        assert_eq!(closing, PageDecision::ClosingTerm);
    }

    #[test]
    fn summary_tallies_each_status() {
        let mut regular = ImageReport::new(0, "a.jpg", ImageStatus::Processed);
        regular.decision = Some(PageDecision::Regular {
            number: 1,
            side: Side::Front,
        });
        let mut closing = ImageReport::new(1, "b.jpg", ImageStatus::Processed);
        closing.decision = Some(PageDecision::ClosingTerm);
        let mut error = ImageReport::new(2, "c.jpg", ImageStatus::Processed);
        error.decision = Some(PageDecision::UnresolvedError);
        let skipped = ImageReport::new(3, "d.jpg", ImageStatus::Skipped);
        let cancelled = ImageReport::new(4, "e.jpg", ImageStatus::Cancelled);
        let failed = ImageReport::new(5, "f.jpg", ImageStatus::Failed);
        let mut opening = ImageReport::new(6, "g.jpg", ImageStatus::Processed);
        opening.decision = Some(PageDecision::OpeningTerm);

        let s = RunSummary::from_reports(
            &[regular, closing, error, skipped, cancelled, failed, opening],
            12,
        );
        assert_eq!(s.total, 7);
        assert_eq!(s.regular, 1);
        assert_eq!(s.special, 2);
        assert_eq!(s.error_marked, 1);
        assert_eq!(s.skipped, 1);
        assert_eq!(s.cancelled, 1);
        assert_eq!(s.failed, 1);
        assert!(!s.is_complete());
    }
}

//! Page classification: from OCR outcome to a decision and its output name.
//!
//! Rules, evaluated in order for each image:
//!
//! 0. a term marker in the file name or the full-page text → opening/closing term
//! 1. a confident candidate within `[1, max_pages]` → regular page, side from
//!    the configured [`SideRule`](crate::config::SideRule)
//! 2. otherwise a relaxed re-parse of the region text
//! 3. no number and an almost empty page → verso of the preceding image's sheet
//! 4. anything else is unresolved and goes to manual correction
//!
//! Every accepted decision is admitted through the [`Ledger`]: it claims its
//! output name there, and a name already claimed by another image turns the
//! decision into a `DuplicatePageNumber` escalation.

use crate::config::{PipelineConfig, TermMarkers};
use crate::error::PageError;
use crate::output::{PageDecision, Side};
use crate::pipeline::ledger::Ledger;
use crate::pipeline::reader::OcrOutcome;
use crate::pipeline::source::SourceImage;
use tracing::{debug, info};

/// Result of automatic classification.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    /// Decided and admitted; `output` is claimed in the ledger.
    Accepted { decision: PageDecision, output: String },
    /// Needs a human.
    Unresolved {
        reason: PageError,
        suggestion: Option<u32>,
    },
}

/// Term page named by the file stem, if any.
pub fn term_from_name(stem: &str, markers: &TermMarkers) -> Option<PageDecision> {
    let stem = stem.to_lowercase();
    if markers
        .closing_names
        .iter()
        .any(|m| stem.contains(&m.to_lowercase()))
    {
        return Some(PageDecision::ClosingTerm);
    }
    if markers
        .opening_names
        .iter()
        .any(|m| stem.contains(&m.to_lowercase()))
    {
        return Some(PageDecision::OpeningTerm);
    }
    None
}

/// Term page announced in the full-page text, if any.
pub fn term_from_text(text: &str, markers: &TermMarkers) -> Option<PageDecision> {
    let text = text.to_uppercase();
    if markers
        .opening_text
        .iter()
        .any(|m| text.contains(&m.to_uppercase()))
    {
        return Some(PageDecision::OpeningTerm);
    }
    if markers
        .closing_text
        .iter()
        .any(|m| text.contains(&m.to_uppercase()))
    {
        return Some(PageDecision::ClosingTerm);
    }
    None
}

/// Check `decision` against the bounds and claim its output name.
///
/// On success the image's ledger slot is settled, so a waiting successor can
/// proceed. `UnresolvedError` always succeeds, possibly under a fallback name.
pub fn admit(
    decision: &PageDecision,
    image: &SourceImage,
    config: &PipelineConfig,
    ledger: &Ledger,
) -> Result<String, PageError> {
    let output = match decision {
        PageDecision::UnresolvedError => {
            ledger.claim_error_name(&image.stem, &image.file_name, image.index)
        }
        PageDecision::Regular { number, .. } if !config.in_bounds(*number) => {
            return Err(PageError::PageOutOfRange {
                file: image.file_name.clone(),
                number: *number,
                max_pages: config.max_pages,
            });
        }
        _ => {
            let output = decision.output_name(&image.stem);
            ledger
                .claim(&output, &image.file_name)
                .map_err(|holder| PageError::DuplicatePageNumber {
                    file: image.file_name.clone(),
                    output: output.clone(),
                    holder,
                })?;
            output
        }
    };
    ledger.settle(image.index, decision.page_number());
    Ok(output)
}

/// Classify one image automatically.
///
/// May wait for the preceding image's decision when the blank-verso rule
/// applies; never waits on a later image.
pub async fn classify(
    image: &SourceImage,
    outcome: &OcrOutcome,
    ocr_error: Option<&PageError>,
    config: &PipelineConfig,
    ledger: &Ledger,
) -> Classification {
    let proposed = propose(image, outcome, config, ledger).await;

    let decision = match proposed {
        Ok(decision) => decision,
        Err(reason) => {
            let reason = match (reason, ocr_error) {
                (PageError::UnparseableOcrResult { .. }, Some(err)) => err.clone(),
                (reason, _) => reason,
            };
            return Classification::Unresolved {
                reason,
                suggestion: suggest(outcome, image.index, config, ledger),
            };
        }
    };

    match admit(&decision, image, config, ledger) {
        Ok(output) => {
            info!("{} → {}", image.file_name, output);
            Classification::Accepted { decision, output }
        }
        Err(reason) => {
            debug!("{}: {} rejected: {}", image.file_name, decision, reason);
            Classification::Unresolved {
                reason,
                suggestion: suggest(outcome, image.index, config, ledger),
            }
        }
    }
}

/// Apply rules 0–3. `Err` carries the escalation reason.
async fn propose(
    image: &SourceImage,
    outcome: &OcrOutcome,
    config: &PipelineConfig,
    ledger: &Ledger,
) -> Result<PageDecision, PageError> {
    let markers = &config.term_markers;
    if let Some(term) = term_from_name(&image.stem, markers) {
        return Ok(term);
    }
    if let Some(term) = outcome
        .full_text
        .as_deref()
        .and_then(|t| term_from_text(t, markers))
    {
        return Ok(term);
    }

    let regular = |number: u32| PageDecision::Regular {
        number,
        side: config.side_rule.side_for(number, outcome),
    };

    if outcome.is_confident(config.min_confidence) {
        if let Some(number) = outcome.candidate {
            if config.in_bounds(number) {
                return Ok(regular(number));
            }
            return Err(PageError::PageOutOfRange {
                file: image.file_name.clone(),
                number,
                max_pages: config.max_pages,
            });
        }
    }

    if outcome.engine_confident(config.min_confidence) {
        if let Some(number) = outcome.relaxed_candidate() {
            if config.in_bounds(number) {
                debug!("{}: relaxed parse read {}", image.file_name, number);
                return Ok(regular(number));
            }
        }
    }

    if outcome.candidate.is_none() && is_blank(outcome, config) {
        if let Some(number) = ledger.predecessor(image.index).await {
            debug!("{}: blank page after sheet {}", image.file_name, number);
            return Ok(PageDecision::Regular {
                number,
                side: Side::Verso,
            });
        }
    }

    match outcome.candidate {
        Some(number) if !config.in_bounds(number) => Err(PageError::PageOutOfRange {
            file: image.file_name.clone(),
            number,
            max_pages: config.max_pages,
        }),
        _ => Err(PageError::UnparseableOcrResult {
            file: image.file_name.clone(),
            text: outcome.text.clone(),
        }),
    }
}

fn is_blank(outcome: &OcrOutcome, config: &PipelineConfig) -> bool {
    match (config.blank_verso_max_chars, outcome.full_text_chars()) {
        (Some(max), Some(chars)) => chars < max,
        _ => false,
    }
}

/// Page number to offer the reviewer: the OCR candidate when it is in range,
/// otherwise the page after the preceding image's, if that is known.
pub fn suggest(outcome: &OcrOutcome, index: usize, config: &PipelineConfig, ledger: &Ledger) -> Option<u32> {
    outcome
        .candidate
        .or_else(|| outcome.relaxed_candidate())
        .filter(|n| config.in_bounds(*n))
        .or_else(|| {
            ledger
                .peek_predecessor(index)
                .map(|n| n.saturating_add(1))
                .filter(|n| config.in_bounds(*n))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SideRule;
    use std::path::PathBuf;

    fn image(index: usize, stem: &str) -> SourceImage {
        SourceImage {
            index,
            path: PathBuf::from(format!("{stem}.jpg")),
            file_name: format!("{stem}.jpg"),
            stem: stem.to_string(),
            fingerprint: format!("fp-{stem}"),
        }
    }

    fn outcome(text: &str, full: Option<&str>) -> OcrOutcome {
        let mut o = OcrOutcome::from_recognition(crate::pipeline::reader::Recognition {
            text: text.to_string(),
            confidence: Some(0.9),
        });
        o.full_text = full.map(str::to_string);
        o
    }

    fn config() -> PipelineConfig {
        PipelineConfig::builder().max_pages(300).build().unwrap()
    }

    #[test]
    fn names_mark_terms() {
        let m = TermMarkers::default();
        assert_eq!(term_from_name("Termo de Abertura", &m), Some(PageDecision::OpeningTerm));
        assert_eq!(term_from_name("99_ENCERRAMENTO", &m), Some(PageDecision::ClosingTerm));
        assert_eq!(term_from_name("page07", &m), None);
    }

    #[test]
    fn text_marks_terms() {
        let m = TermMarkers::default();
        assert_eq!(
            term_from_text("... termo de instalação do livro ...", &m),
            Some(PageDecision::OpeningTerm)
        );
        assert_eq!(
            term_from_text("TERMO DE ENCERRAMENTO\nlivro 3", &m),
            Some(PageDecision::ClosingTerm)
        );
        assert_eq!(term_from_text("FOLHA 3", &m), None);
    }

    #[tokio::test]
    async fn confident_number_is_accepted() {
        let ledger = Ledger::new(1);
        let c = classify(&image(0, "page07"), &outcome("FOLHA 7", None), None, &config(), &ledger).await;
        assert_eq!(
            c,
            Classification::Accepted {
                decision: PageDecision::Regular {
                    number: 7,
                    side: Side::Front
                },
                output: "FL. 007.pdf".into()
            }
        );
        assert_eq!(ledger.peek_predecessor(1), Some(7));
    }

    #[tokio::test]
    async fn verso_marker_sets_side() {
        let ledger = Ledger::new(1);
        let c = classify(&image(0, "a"), &outcome("FL. 7v", None), None, &config(), &ledger).await;
        assert!(matches!(c, Classification::Accepted { ref output, .. } if output == "FL. 007-verso.pdf"));
    }

    #[tokio::test]
    async fn term_name_overrides_ocr() {
        let ledger = Ledger::new(1);
        let c = classify(
            &image(0, "termo de encerramento"),
            &outcome("FOLHA 12", None),
            None,
            &config(),
            &ledger,
        )
        .await;
        assert!(matches!(c, Classification::Accepted { decision: PageDecision::ClosingTerm, .. }));
    }

    #[tokio::test]
    async fn out_of_range_is_escalated() {
        let ledger = Ledger::new(1);
        let c = classify(&image(0, "a"), &outcome("FOLHA 999", None), None, &config(), &ledger).await;
        match c {
            Classification::Unresolved { reason, suggestion } => {
                assert!(matches!(reason, PageError::PageOutOfRange { number: 999, .. }));
                assert_eq!(suggestion, None);
            }
            other => panic!("expected escalation, got {other:?}"),
        }
        assert!(ledger.holder("FL. 999.pdf").is_none());
    }

    #[tokio::test]
    async fn duplicate_is_escalated_with_holder() {
        let ledger = Ledger::new(2);
        let cfg = config();
        classify(&image(0, "a"), &outcome("FOLHA 3", None), None, &cfg, &ledger).await;
        let c = classify(&image(1, "b"), &outcome("FOLHA 3", None), None, &cfg, &ledger).await;
        match c {
            Classification::Unresolved {
                reason: PageError::DuplicatePageNumber { holder, output, .. },
                suggestion,
            } => {
                assert_eq!(holder, "a.jpg");
                assert_eq!(output, "FL. 003.pdf");
                assert_eq!(suggestion, Some(3));
            }
            other => panic!("expected duplicate, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn low_confidence_is_escalated() {
        let ledger = Ledger::new(1);
        let mut o = outcome("FOLHA 5", None);
        o.engine_confidence = Some(0.2);
        let c = classify(&image(0, "a"), &o, None, &config(), &ledger).await;
        assert!(matches!(c, Classification::Unresolved { suggestion: Some(5), .. }));
    }

    #[tokio::test]
    async fn relaxed_parse_recovers_look_alikes() {
        let ledger = Ledger::new(1);
        let c = classify(&image(0, "a"), &outcome("FL. O7", None), None, &config(), &ledger).await;
        assert!(matches!(c, Classification::Accepted { ref output, .. } if output == "FL. 007.pdf"));
    }

    #[tokio::test]
    async fn blank_page_becomes_verso_of_predecessor() {
        let ledger = Ledger::new(2);
        let cfg = config();
        classify(&image(0, "a"), &outcome("FOLHA 4", Some("FOLHA 4 texto")), None, &cfg, &ledger).await;
        let c = classify(&image(1, "b"), &outcome("", Some("  \n ")), None, &cfg, &ledger).await;
        assert!(matches!(c, Classification::Accepted { ref output, .. } if output == "FL. 004-verso.pdf"));
    }

    #[tokio::test]
    async fn blank_first_page_is_unresolved() {
        let ledger = Ledger::new(1);
        let c = classify(&image(0, "a"), &outcome("", Some("")), None, &config(), &ledger).await;
        assert!(matches!(
            c,
            Classification::Unresolved {
                reason: PageError::UnparseableOcrResult { .. },
                suggestion: None
            }
        ));
    }

    #[tokio::test]
    async fn dense_unnumbered_page_is_unresolved() {
        let ledger = Ledger::new(2);
        let cfg = config();
        ledger.settle(0, Some(10));
        let full = "x".repeat(400);
        let c = classify(&image(1, "b"), &outcome("", Some(&full)), None, &cfg, &ledger).await;
        assert!(matches!(c, Classification::Unresolved { suggestion: Some(11), .. }));
    }

    #[tokio::test]
    async fn ocr_failure_is_the_reason() {
        let ledger = Ledger::new(1);
        let err = PageError::OcrFailed {
            file: "a.jpg".into(),
            detail: "crash".into(),
        };
        let c = classify(&image(0, "a"), &OcrOutcome::default(), Some(&err), &config(), &ledger).await;
        assert!(matches!(c, Classification::Unresolved { reason: PageError::OcrFailed { .. }, .. }));
    }

    #[tokio::test]
    async fn parity_rule_applies() {
        let ledger = Ledger::new(1);
        let cfg = PipelineConfig::builder()
            .side_rule(SideRule::Parity { verso_on_even: true })
            .build()
            .unwrap();
        let c = classify(&image(0, "a"), &outcome("FOLHA 8", None), None, &cfg, &ledger).await;
        assert!(matches!(c, Classification::Accepted { ref output, .. } if output == "FL. 008-verso.pdf"));
    }

    #[test]
    fn admit_error_settles_undecided() {
        let ledger = Ledger::new(1);
        let out = admit(&PageDecision::UnresolvedError, &image(0, "scan"), &config(), &ledger).unwrap();
        assert_eq!(out, "ERRO_OCR_scan.pdf");
        assert_eq!(ledger.peek(0), Some(crate::pipeline::ledger::Slot::Settled(None)));
    }
}

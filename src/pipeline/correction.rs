//! Manual correction: hand an unresolved image to a human and wait for the answer.
//!
//! The shell owns the receiving end of a [`CorrectionSender`] channel. For each
//! unresolved image the gate sends one [`CorrectionRequest`] carrying a
//! oneshot reply handle, and the owning worker awaits the reply; other
//! workers keep running.
//!
//! ```text
//! Pending ──request sent──▶ AwaitingHuman ──valid answer──▶ Resolved
//!                               │   ▲
//!                               │   └── invalid answer (out of range, duplicate): ask again
//!                               ├── decline / channel closed ──▶ Declined
//!                               └── run cancelled ──▶ Cancelled
//! ```
//!
//! With no channel configured every unresolved image is declined at once.
//! `Cancelled` is kept apart from `Declined` so that an unanswered question is
//! not remembered as a decision.

use crate::error::PageError;
use crate::output::{PageDecision, Side};
use crate::pipeline::reader::OcrOutcome;
use crate::pipeline::source::SourceImage;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Sending half given to the pipeline via
/// [`PipelineConfigBuilder::corrections`](crate::config::PipelineConfigBuilder::corrections).
pub type CorrectionSender = mpsc::Sender<CorrectionRequest>;

/// Receiving half kept by the shell.
pub type CorrectionReceiver = mpsc::Receiver<CorrectionRequest>;

/// Create a correction channel with room for `buffer` pending requests.
pub fn correction_channel(buffer: usize) -> (CorrectionSender, CorrectionReceiver) {
    mpsc::channel(buffer.max(1))
}

/// A human's answer to a [`CorrectionRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CorrectionResponse {
    Page { number: u32, side: Side },
    OpeningTerm,
    ClosingTerm,
    /// Mark the image as an error.
    Decline,
}

impl CorrectionResponse {
    /// Decision the answer stands for; `None` for a decline.
    pub fn into_decision(self) -> Option<PageDecision> {
        match self {
            CorrectionResponse::Page { number, side } => Some(PageDecision::Regular { number, side }),
            CorrectionResponse::OpeningTerm => Some(PageDecision::OpeningTerm),
            CorrectionResponse::ClosingTerm => Some(PageDecision::ClosingTerm),
            CorrectionResponse::Decline => None,
        }
    }
}

/// One image waiting for a human decision.
#[derive(Debug)]
pub struct CorrectionRequest {
    /// Position of the image in the input listing.
    pub index: usize,
    pub file_name: String,
    /// Source image, for display.
    pub path: PathBuf,
    /// What OCR read.
    pub outcome: OcrOutcome,
    /// Why the image needs a human (or why the previous answer was rejected).
    pub reason: PageError,
    /// Page number to pre-fill.
    pub suggestion: Option<u32>,
    /// Which attempt this is; starts at 1.
    pub attempt: u32,
    respond: oneshot::Sender<CorrectionResponse>,
}

impl CorrectionRequest {
    /// Answer the request. Returns `false` if the pipeline stopped waiting.
    pub fn respond(self, response: CorrectionResponse) -> bool {
        self.respond.send(response).is_ok()
    }

    pub fn decline(self) -> bool {
        self.respond(CorrectionResponse::Decline)
    }
}

/// Lifecycle of one image's correction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateState {
    Pending,
    AwaitingHuman,
    Resolved { decision: PageDecision, output: String },
    Declined,
    /// The run was cancelled before anyone answered.
    Cancelled,
}

impl GateState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GateState::Resolved { .. } | GateState::Declined | GateState::Cancelled
        )
    }
}

/// Everything the gate needs from the run.
pub struct CorrectionGate<'a> {
    pub sender: Option<&'a CorrectionSender>,
    pub cancel: &'a CancellationToken,
    pub progress: Option<&'a ProgressCallback>,
}

impl CorrectionGate<'_> {
    /// Ask for a decision on `image` until a valid one arrives or the
    /// request is declined.
    ///
    /// `admit` validates an answer and claims its output name; a rejected
    /// answer is sent back to the human with the rejection as the reason.
    /// Always returns a terminal state.
    pub async fn resolve<F>(
        &self,
        image: &SourceImage,
        outcome: &OcrOutcome,
        reason: PageError,
        suggestion: Option<u32>,
        mut admit: F,
    ) -> GateState
    where
        F: FnMut(&PageDecision) -> Result<String, PageError>,
    {
        let mut state = GateState::Pending;
        let mut reason = reason;
        let mut attempt = 0u32;

        while !state.is_terminal() {
            state = match state {
                GateState::Pending => {
                    let Some(sender) = self.sender else {
                        debug!("{}: no reviewer attached, declining", image.file_name);
                        return GateState::Declined;
                    };
                    if self.cancel.is_cancelled() {
                        return GateState::Cancelled;
                    }
                    attempt += 1;
                    let (tx, rx) = oneshot::channel();
                    let request = CorrectionRequest {
                        index: image.index,
                        file_name: image.file_name.clone(),
                        path: image.path.clone(),
                        outcome: outcome.clone(),
                        reason: reason.clone(),
                        suggestion,
                        attempt,
                        respond: tx,
                    };
                    if let Some(cb) = self.progress {
                        cb.on_correction_requested(image.index, &reason);
                    }
                    info!("{}: waiting for manual correction ({})", image.file_name, reason);

                    let sent = tokio::select! {
                        sent = sender.send(request) => sent.is_ok(),
                        _ = self.cancel.cancelled() => return GateState::Cancelled,
                    };
                    if !sent {
                        return GateState::Declined;
                    }

                    let response = tokio::select! {
                        r = rx => r.unwrap_or(CorrectionResponse::Decline),
                        _ = self.cancel.cancelled() => {
                            info!("{}: run cancelled while awaiting correction", image.file_name);
                            return GateState::Cancelled;
                        }
                    };
                    self.answer(image, response, &mut reason, &mut admit)
                }
                GateState::AwaitingHuman => GateState::Pending,
                terminal => terminal,
            };
        }
        state
    }

    fn answer<F>(
        &self,
        image: &SourceImage,
        response: CorrectionResponse,
        reason: &mut PageError,
        admit: &mut F,
    ) -> GateState
    where
        F: FnMut(&PageDecision) -> Result<String, PageError>,
    {
        let Some(decision) = response.into_decision() else {
            info!("{}: correction declined", image.file_name);
            return GateState::Declined;
        };
        match admit(&decision) {
            Ok(output) => {
                info!("{}: corrected to {}", image.file_name, decision);
                GateState::Resolved { decision, output }
            }
            Err(rejection) => {
                warn!("{}: answer rejected: {}", image.file_name, rejection);
                *reason = rejection;
                GateState::AwaitingHuman
            }
        }
    }
}

//! The run's single serialization point for classification.
//!
//! Two things must be shared between concurrently running workers:
//!
//! * **Output claims**: each output name may be produced once. The first image
//!   to claim `FL. 012.pdf` holds it; any later claim is a duplicate and is
//!   escalated instead of overwriting.
//! * **Decisions in input order**: the blank-verso rule needs the regular page
//!   decided for the image immediately before it. Every image owns a `watch`
//!   slot that is settled exactly once; a worker that needs its predecessor
//!   waits on that slot. Images are dispatched in input order, so the
//!   predecessor is always already in flight and the wait cannot deadlock.

use crate::output::ERROR_PREFIX;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::watch;
use tracing::debug;

/// Decision state of one image as seen by its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Pending,
    /// Decided. Holds the regular page number, if the image got one.
    Settled(Option<u32>),
}

/// Output claims and per-image decision slots for one run.
#[derive(Debug)]
pub struct Ledger {
    claims: Mutex<HashMap<String, String>>,
    slots: Vec<watch::Sender<Slot>>,
}

impl Ledger {
    /// Ledger for a run over `images` inputs.
    pub fn new(images: usize) -> Self {
        Self {
            claims: Mutex::new(HashMap::new()),
            slots: (0..images).map(|_| watch::channel(Slot::Pending).0).collect(),
        }
    }

    /// Claim `output` for `holder`.
    ///
    /// Returns the current holder if another image already owns the name.
    /// Claiming a name one already holds succeeds.
    pub fn claim(&self, output: &str, holder: &str) -> Result<(), String> {
        let mut claims = self.claims.lock().unwrap_or_else(|p| p.into_inner());
        match claims.get(output) {
            Some(existing) if existing != holder => Err(existing.clone()),
            Some(_) => Ok(()),
            None => {
                claims.insert(output.to_string(), holder.to_string());
                debug!("{} claimed {}", holder, output);
                Ok(())
            }
        }
    }

    /// Give up a claim, e.g. after the output failed to write.
    pub fn release(&self, output: &str, holder: &str) {
        let mut claims = self.claims.lock().unwrap_or_else(|p| p.into_inner());
        if claims.get(output).is_some_and(|h| h == holder) {
            claims.remove(output);
        }
    }

    /// Current holder of `output`.
    pub fn holder(&self, output: &str) -> Option<String> {
        self.claims
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(output)
            .cloned()
    }

    /// Run `remove` for `output` only if no image has claimed it in this run.
    ///
    /// The claims stay locked while `remove` runs, so an image claiming the
    /// same name afterwards writes a fresh file. Returns `None` when claimed.
    pub fn retire<R>(&self, output: &str, remove: impl FnOnce() -> R) -> Option<R> {
        let claims = self.claims.lock().unwrap_or_else(|p| p.into_inner());
        if claims.contains_key(output) {
            return None;
        }
        Some(remove())
    }

    /// Claim an error-marked name for an image that could not be resolved.
    ///
    /// Tries `ERRO_OCR_<stem>.pdf`, then `ERRO_OCR_<file name>.pdf` (two
    /// sources sharing a stem), then appends the input index.
    pub fn claim_error_name(&self, stem: &str, file_name: &str, index: usize) -> String {
        let candidates = [
            format!("{ERROR_PREFIX}{stem}.pdf"),
            format!("{ERROR_PREFIX}{file_name}.pdf"),
        ];
        for name in candidates {
            if self.claim(&name, file_name).is_ok() {
                return name;
            }
        }
        let name = format!("{ERROR_PREFIX}{file_name}-{index}.pdf");
        // The index is unique within a run.
        let _ = self.claim(&name, file_name);
        name
    }

    /// Record the decision of image `index`. Later calls are ignored.
    pub fn settle(&self, index: usize, number: Option<u32>) {
        if let Some(slot) = self.slots.get(index) {
            slot.send_if_modified(|s| match s {
                Slot::Pending => {
                    *s = Slot::Settled(number);
                    true
                }
                Slot::Settled(_) => false,
            });
        }
    }

    /// Current state of image `index`'s slot.
    pub fn peek(&self, index: usize) -> Option<Slot> {
        self.slots.get(index).map(|s| *s.borrow())
    }

    /// Regular page number of the image before `index`, waiting for it to be
    /// decided. `None` for the first image or when the predecessor got no
    /// regular number.
    pub async fn predecessor(&self, index: usize) -> Option<u32> {
        let prev = index.checked_sub(1)?;
        let mut rx = self.slots.get(prev)?.subscribe();
        let settled = rx.wait_for(|s| matches!(s, Slot::Settled(_))).await.ok()?;
        match *settled {
            Slot::Settled(n) => n,
            Slot::Pending => None,
        }
    }

    /// Predecessor's number if it is already decided, without waiting.
    pub fn peek_predecessor(&self, index: usize) -> Option<u32> {
        match self.peek(index.checked_sub(1)?)? {
            Slot::Settled(n) => n,
            Slot::Pending => None,
        }
    }

    /// Guard that settles `index` as undecided if it is dropped first.
    pub fn guard(&self, index: usize) -> SlotGuard<'_> {
        SlotGuard { ledger: self, index }
    }
}

/// Settles an image's slot when its worker exits early (decode failure,
/// cancellation, fatal error), so a successor never waits forever.
pub struct SlotGuard<'a> {
    ledger: &'a Ledger,
    index: usize,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.ledger.settle(self.index, None);
    }
}

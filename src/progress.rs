//! Progress-callback trait for per-image pipeline events.
//!
//! Inject an [`Arc<dyn PipelineProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events as workers pick up and finish images. This is how an external shell
//! (terminal UI, desktop window) follows a run; log lines go through `tracing`
//! and correction requests through [`crate::pipeline::correction`].
//!
//! # Example
//!
//! ```rust
//! use image2doc::{ImageReport, PipelineConfig, PipelineProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     finished: AtomicUsize,
//! }
//!
//! impl PipelineProgressCallback for CountingCallback {
//!     fn on_image_complete(&self, report: &ImageReport) {
//!         let done = self.finished.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("{done}: {} -> {:?}", report.file_name, report.output);
//!     }
//! }
//!
//! let counter = Arc::new(CountingCallback { finished: AtomicUsize::new(0) });
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(counter as Arc<dyn PipelineProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use crate::error::PageError;
use crate::output::{ImageReport, RunSummary};
use std::sync::Arc;

/// Called by the pipeline as it processes each image.
///
/// Implementations must be `Send + Sync`: images are processed concurrently
/// and events for different images may interleave. All methods have default
/// no-op implementations so callers only override what they care about.
pub trait PipelineProgressCallback: Send + Sync {
    /// Called once after discovery, before any image is dispatched.
    ///
    /// # Arguments
    /// * `total_images`: images found in the input directory
    /// * `cached`      : how many of them are cache hits and will be skipped
    fn on_run_start(&self, total_images: usize, cached: usize) {
        let _ = (total_images, cached);
    }

    /// Called when a worker picks up an image.
    fn on_image_start(&self, index: usize, file_name: &str) {
        let _ = (index, file_name);
    }

    /// Called when an image leaves the pipeline with an output (including
    /// cache hits and error-marked outputs).
    fn on_image_complete(&self, report: &ImageReport) {
        let _ = report;
    }

    /// Called when an image could not produce an output, or a non-fatal
    /// problem (cache update) occurred after it did.
    fn on_image_error(&self, index: usize, error: &PageError) {
        let _ = (index, error);
    }

    /// Called when an image is escalated to the human reviewer.
    fn on_correction_requested(&self, index: usize, reason: &PageError) {
        let _ = (index, reason);
    }

    /// Called once after every dispatched image has finished.
    fn on_run_complete(&self, summary: &RunSummary) {
        let _ = summary;
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::ImageStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct TrackingCallback {
        starts: AtomicUsize,
        completes: AtomicUsize,
        errors: AtomicUsize,
        corrections: AtomicUsize,
        summary_total: AtomicUsize,
    }

    impl PipelineProgressCallback for TrackingCallback {
        fn on_image_start(&self, _index: usize, _file_name: &str) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_image_complete(&self, _report: &ImageReport) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_image_error(&self, _index: usize, _error: &PageError) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }

        fn on_correction_requested(&self, _index: usize, _reason: &PageError) {
            self.corrections.fetch_add(1, Ordering::SeqCst);
        }

        fn on_run_complete(&self, summary: &RunSummary) {
            self.summary_total.store(summary.total, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_run_start(5, 1);
        cb.on_image_start(0, "a.jpg");
        cb.on_image_complete(&ImageReport::new(0, "a.jpg", ImageStatus::Processed));
        cb.on_run_complete(&RunSummary::default());
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback::default();
        let report = ImageReport::new(0, "a.jpg", ImageStatus::Processed);
        let err = PageError::UnparseableOcrResult {
            file: "b.jpg".into(),
            text: "".into(),
        };

        tracker.on_image_start(0, "a.jpg");
        tracker.on_image_complete(&report);
        tracker.on_image_start(1, "b.jpg");
        tracker.on_correction_requested(1, &err);
        tracker.on_image_error(1, &err);
        tracker.on_run_complete(&RunSummary {
            total: 2,
            ..Default::default()
        });

        assert_eq!(tracker.starts.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.completes.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.errors.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.corrections.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.summary_total.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn arc_dyn_callback_works() {
        let cb: Arc<dyn PipelineProgressCallback> = Arc::new(NoopProgressCallback);
        cb.on_run_start(10, 0);
        cb.on_image_start(1, "x.png");
    }
}

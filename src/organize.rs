//! Run entry points: organise a directory of scans into numbered PDFs.
//!
//! [`organize`] discovers the images, skips cache hits, then pushes the rest
//! through a bounded pool of workers. Each worker owns one image from decode
//! to PDF; the only state workers share is the [`Ledger`] (output claims and
//! decision order) and the [`ProcessingCache`].
//!
//! Cancelling the run's token stops dispatch. Images already in flight finish
//! normally, the rest are reported as [`ImageStatus::Cancelled`] and never
//! cached. An image whose correction was still waiting is error-marked, but
//! its cache entry is provisional so the next run asks again.
//!
//! When a changed image is written under a new name, the output its older
//! version left behind is removed, unless another image of this run owns it.

use crate::config::PipelineConfig;
use crate::error::{PageError, PipelineError};
use crate::output::{ImageReport, ImageStatus, InspectEntry, PageDecision, RunOutput, RunSummary};
use crate::pipeline::assemble::assemble;
use crate::pipeline::cache::{CacheEntry, ProcessingCache};
use crate::pipeline::classify::{admit, classify, Classification};
use crate::pipeline::correction::{CorrectionGate, GateState};
use crate::pipeline::ledger::Ledger;
use crate::pipeline::reader::{read_page, OcrEngine, OcrError, PageReading, TesseractEngine};
use crate::pipeline::source::{discover, SourceImage};
use futures::stream::{self, StreamExt};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Organise every supported image in `input_dir` into `output_dir`.
///
/// # Returns
/// `Ok(RunOutput)` once every dispatched image has finished, even if some
/// images failed or were error-marked (see the per-image reports).
///
/// # Errors
/// Returns `Err(PipelineError)` only for fatal errors:
/// - input directory missing or unreadable
/// - output directory cannot be created
/// - OCR engine unavailable (before or during the run)
pub async fn organize(
    input_dir: impl AsRef<Path>,
    output_dir: impl AsRef<Path>,
    config: &PipelineConfig,
) -> Result<RunOutput, PipelineError> {
    let start = Instant::now();
    let input_dir = input_dir.as_ref();
    let output_dir = output_dir.as_ref();
    config.roi.validate()?;
    info!("Organising {} → {}", input_dir.display(), output_dir.display());

    // ── Step 1: Resolve and probe the OCR engine ─────────────────────────
    let engine = resolve_engine(config);
    probe_engine(&engine).await?;

    // ── Step 2: Discover images ──────────────────────────────────────────
    let listing = {
        let dir = input_dir.to_path_buf();
        let mode = config.fingerprint_mode;
        tokio::task::spawn_blocking(move || discover(&dir, mode))
            .await
            .map_err(|e| PipelineError::Internal(format!("Discovery task panicked: {e}")))??
    };

    // ── Step 3: Prepare output and cache ─────────────────────────────────
    tokio::fs::create_dir_all(output_dir)
        .await
        .map_err(|e| PipelineError::OutputDirFailed {
            path: output_dir.to_path_buf(),
            source: e,
        })?;
    let cache = match config.cache {
        Some(ref cache) => Arc::clone(cache),
        None => Arc::new(ProcessingCache::for_output_dir(output_dir)),
    };

    // ── Step 4: Settle unreadable files and cache hits before dispatch ───
    let total = listing.len();
    let ledger = Ledger::new(total);
    // Anything not overwritten below was never dispatched.
    let mut reports: Vec<ImageReport> = (0..total)
        .map(|index| ImageReport::new(index, String::new(), ImageStatus::Cancelled))
        .collect();
    let mut settled = Vec::new();

    for missing in listing.unreadable {
        ledger.settle(missing.index, None);
        let mut report = ImageReport::new(missing.index, &missing.file_name, ImageStatus::Failed);
        report.error = Some(missing.error);
        settled.push(missing.index);
        reports[missing.index] = report;
    }

    let mut pending = Vec::with_capacity(listing.images.len());
    for image in &listing.images {
        reports[image.index].file_name.clone_from(&image.file_name);
        match cache.lookup(&image.fingerprint, output_dir) {
            Some(entry) if ledger.claim(&entry.output, &image.file_name).is_ok() => {
                ledger.settle(image.index, entry.decision.page_number());
                debug!("{}: unchanged, keeping {}", image.file_name, entry.output);
                let mut report = ImageReport::new(image.index, &image.file_name, ImageStatus::Skipped);
                report.decision = Some(entry.decision);
                report.output = Some(entry.output);
                settled.push(image.index);
                reports[image.index] = report;
            }
            _ => pending.push(image),
        }
    }

    let cached = listing.images.len() - pending.len();
    info!(
        "{} images: {} unchanged, {} unreadable, {} to process",
        total,
        cached,
        settled.len() - cached,
        pending.len()
    );
    if let Some(ref cb) = config.progress_callback {
        cb.on_run_start(total, cached);
        settled.sort_unstable();
        for &index in &settled {
            let report = &reports[index];
            if let Some(ref err) = report.error {
                cb.on_image_error(index, err);
            }
            cb.on_image_complete(report);
        }
    }

    // ── Step 5: Dispatch ─────────────────────────────────────────────────
    let cancel = config
        .cancel_token
        .as_ref()
        .map(CancellationToken::child_token)
        .unwrap_or_default();
    let ctx = RunContext {
        config,
        engine: &engine,
        cache: &cache,
        ledger: &ledger,
        output_dir,
        cancel: &cancel,
    };
    let workers = config.effective_workers();
    debug!("Dispatching with {} workers", workers);

    let mut results = stream::iter(pending)
        .take_until(cancel.clone().cancelled_owned())
        .map(|image| process_image(&ctx, image))
        .buffer_unordered(workers)
        .boxed();

    let mut fatal = None;
    while let Some(result) = results.next().await {
        match result {
            Ok(report) => {
                let index = report.index;
                reports[index] = report;
            }
            Err(e) => {
                error!("Aborting run: {}", e);
                cancel.cancel();
                fatal.get_or_insert(e);
            }
        }
    }
    drop(results);
    if let Some(e) = fatal {
        return Err(e);
    }

    // ── Step 6: Fan in ───────────────────────────────────────────────────
    let summary = RunSummary::from_reports(&reports, start.elapsed().as_millis() as u64);
    info!(
        "Run complete: {} regular, {} terms, {} error-marked, {} failed, {} skipped, {} cancelled in {}ms",
        summary.regular,
        summary.special,
        summary.error_marked,
        summary.failed,
        summary.skipped,
        summary.cancelled,
        summary.duration_ms
    );
    if let Some(ref cb) = config.progress_callback {
        cb.on_run_complete(&summary);
    }

    Ok(RunOutput {
        reports,
        summary,
        cancelled: cancel.is_cancelled(),
    })
}

/// Synchronous wrapper around [`organize`].
///
/// Creates a temporary tokio runtime internally.
pub fn organize_sync(
    input_dir: impl AsRef<Path>,
    output_dir: impl AsRef<Path>,
    config: &PipelineConfig,
) -> Result<RunOutput, PipelineError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| PipelineError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(organize(input_dir, output_dir, config))
}

/// List the images a run would see, with their fingerprints and cache status.
///
/// Does not run OCR and does not need an engine.
pub async fn inspect(
    input_dir: impl AsRef<Path>,
    output_dir: impl AsRef<Path>,
    config: &PipelineConfig,
) -> Result<Vec<InspectEntry>, PipelineError> {
    let dir = input_dir.as_ref().to_path_buf();
    let output_dir = output_dir.as_ref();
    let mode = config.fingerprint_mode;
    let listing = tokio::task::spawn_blocking(move || discover(&dir, mode))
        .await
        .map_err(|e| PipelineError::Internal(format!("Discovery task panicked: {e}")))??;
    for missing in &listing.unreadable {
        warn!("{}", missing.error);
    }

    let cache = match config.cache {
        Some(ref cache) => Arc::clone(cache),
        None => Arc::new(ProcessingCache::for_output_dir(output_dir)),
    };

    Ok(listing
        .images
        .into_iter()
        .map(|image| InspectEntry {
            cached_output: cache
                .lookup(&image.fingerprint, output_dir)
                .map(|entry| entry.output),
            file_name: image.file_name,
            fingerprint: image.fingerprint,
        })
        .collect())
}

// ── Internal helpers ─────────────────────────────────────────────────────

/// Shared, read-only view of a run handed to every worker.
struct RunContext<'a> {
    config: &'a PipelineConfig,
    engine: &'a Arc<dyn OcrEngine>,
    cache: &'a Arc<ProcessingCache>,
    ledger: &'a Ledger,
    output_dir: &'a Path,
    cancel: &'a CancellationToken,
}

/// Pre-built engine from the config, else Tesseract with the config's OCR settings.
fn resolve_engine(config: &PipelineConfig) -> Arc<dyn OcrEngine> {
    match config.engine {
        Some(ref engine) => Arc::clone(engine),
        None => Arc::new(TesseractEngine::from_config(config)),
    }
}

async fn probe_engine(engine: &Arc<dyn OcrEngine>) -> Result<(), PipelineError> {
    let probe = Arc::clone(engine);
    let result = tokio::task::spawn_blocking(move || probe.probe())
        .await
        .map_err(|e| PipelineError::Internal(format!("Engine probe panicked: {e}")))?;
    match result {
        Ok(()) => Ok(()),
        Err(OcrError::Unavailable(detail)) => Err(PipelineError::OcrEngineUnavailable {
            engine: engine.name().to_string(),
            detail,
        }),
        Err(e) => Err(PipelineError::OcrEngineUnavailable {
            engine: engine.name().to_string(),
            detail: e.to_string(),
        }),
    }
}

/// Take one image from decode to cached PDF.
///
/// Per-image problems end up in the report; only an unavailable engine (or an
/// internal panic) is returned as `Err` and aborts the run.
async fn process_image(ctx: &RunContext<'_>, image: &SourceImage) -> Result<ImageReport, PipelineError> {
    let start = Instant::now();
    // Settles this image's slot as undecided on any early exit.
    let _slot = ctx.ledger.guard(image.index);
    let progress = ctx.config.progress_callback.as_ref();
    if let Some(cb) = progress {
        cb.on_image_start(image.index, &image.file_name);
    }
    let mut report = ImageReport::new(image.index, &image.file_name, ImageStatus::Processed);

    // ── Decode and OCR on the blocking pool ──────────────────────────────
    let reading = {
        let engine = Arc::clone(ctx.engine);
        let config = ctx.config.clone();
        let source = image.clone();
        tokio::task::spawn_blocking(move || -> Result<Result<PageReading, PageError>, PipelineError> {
            let pixels = match source.decode() {
                Ok(pixels) => pixels,
                Err(e) => return Ok(Err(e)),
            };
            read_page(engine.as_ref(), pixels, &config, &source.file_name).map(Ok)
        })
        .await
        .map_err(|e| PipelineError::Internal(format!("OCR task panicked: {e}")))??
    };

    let PageReading {
        image: pixels,
        outcome,
        ocr_error,
    } = match reading {
        Ok(reading) => reading,
        Err(e) => return Ok(fail(report, e, start, ctx)),
    };

    // ── Classify, asking a human if needed ───────────────────────────────
    let mut undecided = false;
    let (decision, output) =
        match classify(image, &outcome, ocr_error.as_ref(), ctx.config, ctx.ledger).await {
            Classification::Accepted { decision, output } => (decision, output),
            Classification::Unresolved { reason, suggestion } => {
                report.escalation = Some(reason.clone());
                let gate = CorrectionGate {
                    sender: ctx.config.corrections.as_ref(),
                    cancel: ctx.cancel,
                    progress,
                };
                let state = gate
                    .resolve(image, &outcome, reason, suggestion, |d| {
                        admit(d, image, ctx.config, ctx.ledger)
                    })
                    .await;
                match state {
                    GateState::Resolved { decision, output } => {
                        report.manually_corrected = true;
                        (decision, output)
                    }
                    other => {
                        undecided = other == GateState::Cancelled;
                        let decision = PageDecision::UnresolvedError;
                        let output = ctx
                            .ledger
                            .claim_error_name(&image.stem, &image.file_name, image.index);
                        ctx.ledger.settle(image.index, None);
                        warn!("{}: marked as error → {}", image.file_name, output);
                        report.error = Some(PageError::ManualCorrectionDeclined {
                            file: image.file_name.clone(),
                        });
                        (decision, output)
                    }
                }
            }
        };
    drop(outcome);

    // ── Write the PDF ────────────────────────────────────────────────────
    report.decision = Some(decision.clone());
    if let Err(e) = assemble(
        pixels,
        ctx.output_dir,
        &output,
        &image.file_name,
        ctx.config.pdf_dpi,
        ctx.config.jpeg_quality,
    )
    .await
    {
        ctx.ledger.release(&output, &image.file_name);
        return Ok(fail(report, e, start, ctx));
    }
    report.output = Some(output.clone());

    // ── Retire what an older version of this image produced ──────────────
    for stale in ctx.cache.entries_for(&image.file_name) {
        if stale.output != output {
            retire_output(ctx, &image.file_name, &stale.output);
        }
    }

    // ── Record in the cache ──────────────────────────────────────────────
    let mut entry = CacheEntry::new(&image.file_name, decision, &output);
    if undecided {
        entry = entry.provisional();
    }
    if let Err(e) = ctx.cache.record(&image.fingerprint, entry).await {
        let err = PageError::CacheWriteFailed {
            file: image.file_name.clone(),
            detail: e.to_string(),
        };
        warn!("{}", err);
        if let Some(cb) = progress {
            cb.on_image_error(image.index, &err);
        }
        report.error.get_or_insert(err);
    }

    report.duration_ms = start.elapsed().as_millis() as u64;
    if let Some(cb) = progress {
        cb.on_image_complete(&report);
    }
    Ok(report)
}

/// Delete `output`, left by an earlier version of `file_name`, unless an
/// image of this run has claimed that name.
fn retire_output(ctx: &RunContext<'_>, file_name: &str, output: &str) {
    let path = ctx.output_dir.join(output);
    match ctx.ledger.retire(output, || std::fs::remove_file(&path)) {
        Some(Ok(())) => info!("{}: removed outdated {}", file_name, output),
        Some(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {}
        Some(Err(e)) => warn!("{}: cannot remove outdated {}: {}", file_name, output, e),
        None => debug!("{}: {} now belongs to another image", file_name, output),
    }
}

/// Finish `report` as a failure with no output.
fn fail(mut report: ImageReport, err: PageError, start: Instant, ctx: &RunContext<'_>) -> ImageReport {
    warn!("{}", err);
    if let Some(ref cb) = ctx.config.progress_callback {
        cb.on_image_error(report.index, &err);
    }
    report.status = ImageStatus::Failed;
    report.error = Some(err);
    report.duration_ms = start.elapsed().as_millis() as u64;
    report
}

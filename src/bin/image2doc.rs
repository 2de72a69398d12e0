//! CLI binary for image2doc.
//!
//! A thin shim over the library crate: maps CLI flags to `PipelineConfig`,
//! renders progress, and answers manual-correction requests from stdin.

use anyhow::{Context, Result};
use clap::Parser;
use image2doc::{
    correction_channel, inspect, organize, CorrectionReceiver, CorrectionRequest, CorrectionResponse,
    FingerprintMode, ImageReport, ImageStatus, PageError, PipelineConfig, PipelineProgressCallback,
    ProgressCallback, RegionOfInterest, RunSummary, Side, SideRule, TesseractEngine,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: one bar at the bottom, one log line per image.
/// Images finish out of order, so start times are keyed by index.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<usize, Instant>>,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Scanning input directory…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            errors: AtomicUsize::new(0),
        })
    }

    fn activate_bar(&self, total: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} images  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Organising");
        self.bar.reset_eta();
    }

    fn elapsed_secs(&self, index: usize) -> f64 {
        self.start_times
            .lock()
            .ok()
            .and_then(|mut m| m.remove(&index))
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl PipelineProgressCallback for CliProgressCallback {
    fn on_run_start(&self, total_images: usize, cached: usize) {
        self.activate_bar(total_images);
        self.bar.inc(cached as u64);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!(
                "{total_images} images found, {cached} unchanged since the last run"
            ))
        ));
    }

    fn on_image_start(&self, index: usize, file_name: &str) {
        if let Ok(mut m) = self.start_times.lock() {
            m.insert(index, Instant::now());
        }
        self.bar.set_message(file_name.to_string());
    }

    fn on_image_complete(&self, report: &ImageReport) {
        // Cache hits were counted in on_run_start.
        if report.status == ImageStatus::Skipped {
            return;
        }
        let secs = self.elapsed_secs(report.index);
        let output = report.output.as_deref().unwrap_or("-");
        let mark = if report.error.is_some() {
            yellow("!")
        } else if report.manually_corrected {
            cyan("✎")
        } else {
            green("✓")
        };
        self.bar.println(format!(
            "  {} {:<28} → {}  {}",
            mark,
            report.file_name,
            bold(output),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_image_error(&self, index: usize, error: &PageError) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        let msg = error.to_string();
        let msg = if msg.chars().count() > 90 {
            format!("{}\u{2026}", msg.chars().take(89).collect::<String>())
        } else {
            msg
        };
        self.bar.println(format!("  {} {}", red("✗"), red(&msg)));
        if error.is_terminal_failure() {
            self.elapsed_secs(index);
            self.bar.inc(1);
        }
    }

    fn on_correction_requested(&self, _index: usize, reason: &PageError) {
        self.bar.println(format!("  {} {}", yellow("?"), reason));
    }

    fn on_run_complete(&self, summary: &RunSummary) {
        self.bar.finish_and_clear();
        let produced = summary.regular + summary.special + summary.error_marked;
        let icon = if summary.failed > 0 || summary.cancelled > 0 {
            red("✘")
        } else if summary.error_marked > 0 {
            yellow("⚠")
        } else {
            green("✔")
        };
        eprintln!(
            "{} {} PDFs written  ({} pages, {} terms, {} error-marked, {} unchanged, {} failed, {} cancelled)",
            icon,
            bold(&produced.to_string()),
            summary.regular,
            summary.special,
            summary.error_marked,
            summary.skipped,
            summary.failed,
            summary.cancelled,
        );
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Organise a book of up to 300 sheets
  image2doc scans/ livro-3/

  # A 120-sheet book, 4 workers, number stamped in the top-left corner
  image2doc --max-pages 120 --workers 4 --roi 0.0,0.0,0.5,0.2 scans/ out/

  # Odd numbers are fronts, even numbers versos
  image2doc --side parity-even scans/ out/

  # Unattended run: never prompt, error-mark what OCR cannot number
  image2doc --no-prompt scans/ out/

  # Show which images the next run would skip
  image2doc --inspect-only scans/ out/

MANUAL CORRECTION:
  When a page number cannot be read (or collides with another image), the
  file is shown and a number is asked for on stdin:
    12            sheet 12, front
    12v           sheet 12, verso
    abertura      opening term (also: open)
    encerramento  closing term (also: close)
    <enter>       accept the suggested number, if one is shown
    x             mark the image as ERRO_OCR_<name>.pdf

ENVIRONMENT VARIABLES:
  IMAGE2DOC_*   Every flag can be set from the environment (see --help)
  RUST_LOG      Override the log filter (e.g. image2doc=debug)

SETUP:
  Tesseract and the Portuguese language pack must be installed:
    apt install tesseract-ocr tesseract-ocr-por
"#;

/// Sort scanned registry-book pages by their printed sheet number.
#[derive(Parser, Debug)]
#[command(
    name = "image2doc",
    version,
    about = "Sort scanned page images by their printed sheet number and emit one PDF per page",
    long_about = "Reads the sheet number printed on each scanned page with Tesseract OCR and \
writes one PDF per page (FL. 001.pdf, FL. 001-verso.pdf, TERMO DE ABERTURA.pdf, ...). Pages \
that cannot be numbered are asked for interactively, and unchanged images are skipped on reruns.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Directory containing the scanned images.
    input: PathBuf,

    /// Directory receiving the PDFs (created if missing).
    output: PathBuf,

    /// Highest sheet number in the book.
    #[arg(long, env = "IMAGE2DOC_MAX_PAGES", default_value_t = 300)]
    max_pages: u32,

    /// Images processed in parallel (0 = one per core).
    #[arg(short, long, env = "IMAGE2DOC_WORKERS", default_value_t = 0)]
    workers: usize,

    /// Tesseract language pack.
    #[arg(long, env = "IMAGE2DOC_LANG", default_value = "por")]
    lang: String,

    /// Tesseract page segmentation mode for the number region.
    #[arg(long, env = "IMAGE2DOC_PSM", default_value_t = 6,
          value_parser = clap::value_parser!(u8).range(0..=13))]
    psm: u8,

    /// Tesseract OCR engine mode.
    #[arg(long, env = "IMAGE2DOC_OEM", default_value_t = 3,
          value_parser = clap::value_parser!(u8).range(0..=3))]
    oem: u8,

    /// Path to the tesseract executable.
    #[arg(long, env = "IMAGE2DOC_TESSERACT")]
    tesseract: Option<PathBuf>,

    /// Number region as left,top,right,bottom fractions of the page.
    #[arg(long, env = "IMAGE2DOC_ROI", default_value = "0.45,0.05,0.95,0.25")]
    roi: String,

    /// Minimum OCR confidence (0.0–1.0) to accept a number without asking.
    #[arg(long, env = "IMAGE2DOC_MIN_CONFIDENCE", default_value_t = 0.5)]
    min_confidence: f32,

    /// Do not rotate landscape scans.
    #[arg(long, env = "IMAGE2DOC_NO_ROTATE")]
    no_rotate: bool,

    /// Skip the full-page scan (term detection and blank versos).
    #[arg(long, env = "IMAGE2DOC_NO_FULL_PAGE")]
    no_full_page: bool,

    /// Pages with fewer characters than this and no number are versos of
    /// the previous sheet. 0 disables the rule.
    #[arg(long, env = "IMAGE2DOC_BLANK_VERSO_CHARS", default_value_t = 250)]
    blank_verso_chars: usize,

    /// How front and verso are told apart.
    #[arg(long, env = "IMAGE2DOC_SIDE", value_enum, default_value = "marker")]
    side: SideArg,

    /// How unchanged images are recognised across runs.
    #[arg(long, env = "IMAGE2DOC_FINGERPRINT", value_enum, default_value = "metadata")]
    fingerprint: FingerprintArg,

    /// Resolution used to size the PDF page.
    #[arg(long, env = "IMAGE2DOC_DPI", default_value_t = 100.0)]
    dpi: f32,

    /// JPEG quality of the embedded page (1–100).
    #[arg(long, env = "IMAGE2DOC_QUALITY", default_value_t = 90,
          value_parser = clap::value_parser!(u8).range(1..=100))]
    quality: u8,

    /// Never ask for corrections; error-mark unresolved images.
    #[arg(long, env = "IMAGE2DOC_NO_PROMPT")]
    no_prompt: bool,

    /// Print the run reports as JSON on stdout.
    #[arg(long, env = "IMAGE2DOC_JSON")]
    json: bool,

    /// Disable the progress bar.
    #[arg(long, env = "IMAGE2DOC_NO_PROGRESS")]
    no_progress: bool,

    /// List images, fingerprints and cached outputs; process nothing.
    #[arg(long)]
    inspect_only: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "IMAGE2DOC_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "IMAGE2DOC_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum SideArg {
    /// "7v" or "verso" next to the number marks the back.
    Marker,
    /// Even numbers are versos.
    ParityEven,
    /// Odd numbers are versos.
    ParityOdd,
    /// Every numbered page is a front.
    Never,
}

impl From<SideArg> for SideRule {
    fn from(v: SideArg) -> Self {
        match v {
            SideArg::Marker => SideRule::default(),
            SideArg::ParityEven => SideRule::Parity { verso_on_even: true },
            SideArg::ParityOdd => SideRule::Parity {
                verso_on_even: false,
            },
            SideArg::Never => SideRule::Never,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum FingerprintArg {
    Metadata,
    Content,
}

impl From<FingerprintArg> for FingerprintMode {
    fn from(v: FingerprintArg) -> Self {
        match v {
            FingerprintArg::Metadata => FingerprintMode::Metadata,
            FingerprintArg::Content => FingerprintMode::Content,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs; verbose always wins.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Inspect-only mode ────────────────────────────────────────────────
    if cli.inspect_only {
        let config = PipelineConfig::builder()
            .fingerprint_mode(cli.fingerprint.into())
            .build()
            .context("Invalid configuration")?;
        let entries = inspect(&cli.input, &cli.output, &config)
            .await
            .context("Failed to inspect input directory")?;

        if cli.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&entries).context("Failed to serialize entries")?
            );
        } else {
            for entry in &entries {
                println!(
                    "{:<32} {:<24} {}",
                    entry.file_name,
                    entry.cached_output.as_deref().unwrap_or("(pending)"),
                    dim(&entry.fingerprint),
                );
            }
            let cached = entries.iter().filter(|e| e.cached_output.is_some()).count();
            println!("{} images, {} unchanged", entries.len(), cached);
        }
        return Ok(());
    }

    // ── Build config ─────────────────────────────────────────────────────
    let progress: Option<Arc<CliProgressCallback>> = show_progress.then(CliProgressCallback::new_dynamic);

    let cancel = CancellationToken::new();
    let mut config = build_config(&cli, &cancel)?;
    if let Some(ref cb) = progress {
        config.progress_callback = Some(Arc::clone(cb) as ProgressCallback);
    }

    // ── Manual correction over stdin ─────────────────────────────────────
    let prompt_task = if cli.no_prompt {
        None
    } else {
        let (tx, rx) = correction_channel(16);
        config.corrections = Some(tx);
        let bar = progress.as_ref().map(|cb| cb.bar.clone());
        Some(tokio::spawn(answer_corrections(rx, bar, cli.max_pages)))
    };

    // ── Ctrl-C cancels the run ───────────────────────────────────────────
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("{}", yellow("Interrupted: finishing images in flight…"));
                cancel.cancel();
            }
        });
    }

    // ── Run ──────────────────────────────────────────────────────────────
    let result = organize(&cli.input, &cli.output, &config).await;
    // Dropping the config closes the correction channel and ends the prompt task.
    drop(config);
    if let Some(task) = prompt_task {
        task.abort();
    }
    let output = result.context("Organising failed")?;

    if cli.json {
        let json = serde_json::to_string_pretty(&output).context("Failed to serialise output")?;
        println!("{json}");
    } else if !cli.quiet && !show_progress {
        let s = &output.summary;
        eprintln!(
            "Organised {} images in {}ms: {} pages, {} terms, {} error-marked, {} unchanged, {} failed, {} cancelled",
            s.total, s.duration_ms, s.regular, s.special, s.error_marked, s.skipped, s.failed, s.cancelled
        );
    }

    if output.cancelled {
        std::process::exit(130);
    }
    Ok(())
}

/// Map CLI args to `PipelineConfig`.
fn build_config(cli: &Cli, cancel: &CancellationToken) -> Result<PipelineConfig> {
    let roi = parse_roi(&cli.roi)?;
    let blank_verso = (cli.blank_verso_chars > 0).then_some(cli.blank_verso_chars);

    let mut config = PipelineConfig::builder()
        .max_pages(cli.max_pages)
        .worker_count(cli.workers)
        .ocr_language(cli.lang.clone())
        .psm_mode(cli.psm)
        .oem_mode(cli.oem)
        .roi(roi)
        .min_confidence(cli.min_confidence)
        .auto_rotate(!cli.no_rotate)
        .scan_full_page(!cli.no_full_page)
        .blank_verso_max_chars(blank_verso)
        .side_rule(cli.side.clone().into())
        .fingerprint_mode(cli.fingerprint.into())
        .pdf_dpi(cli.dpi)
        .jpeg_quality(cli.quality)
        .cancel_token(cancel.clone())
        .build()
        .context("Invalid configuration")?;

    if let Some(ref binary) = cli.tesseract {
        let engine = TesseractEngine::from_config(&config).with_binary(binary);
        config.engine = Some(Arc::new(engine));
    }

    Ok(config)
}

/// Parse `--roi` as four comma-separated fractions.
fn parse_roi(s: &str) -> Result<RegionOfInterest> {
    let parts: Vec<f32> = s
        .split(',')
        .map(|p| {
            p.trim()
                .parse::<f32>()
                .with_context(|| format!("Invalid region fraction: '{}'", p.trim()))
        })
        .collect::<Result<Vec<_>>>()?;

    let [left, top, right, bottom] = parts[..] else {
        anyhow::bail!("--roi expects left,top,right,bottom (got {} values)", parts.len());
    };
    let roi = RegionOfInterest::new(left, top, right, bottom);
    roi.validate().context("Invalid --roi")?;
    Ok(roi)
}

/// Parse one line typed by the reviewer. `None` means the input was not understood.
///
/// An empty line takes `suggestion` as the front of that sheet.
fn parse_answer(line: &str, suggestion: Option<u32>) -> Option<CorrectionResponse> {
    let s = line.trim().to_lowercase();
    match s.as_str() {
        "" => {
            return suggestion.map(|number| CorrectionResponse::Page {
                number,
                side: Side::Front,
            })
        }
        "x" | "erro" | "skip" => return Some(CorrectionResponse::Decline),
        "abertura" | "open" | "a" => return Some(CorrectionResponse::OpeningTerm),
        "encerramento" | "close" | "e" => return Some(CorrectionResponse::ClosingTerm),
        _ => {}
    }
    let (digits, side) = match s.strip_suffix('v') {
        Some(rest) => (rest.trim_end_matches(['-', ' ']), Side::Verso),
        None => (s.as_str(), Side::Front),
    };
    digits
        .parse::<u32>()
        .ok()
        .map(|number| CorrectionResponse::Page { number, side })
}

/// Answer correction requests one at a time from stdin.
async fn answer_corrections(mut rx: CorrectionReceiver, bar: Option<ProgressBar>, max_pages: u32) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(request) = rx.recv().await {
        show_request(&request, bar.as_ref(), max_pages);

        let response = loop {
            match lines.next_line().await {
                Ok(Some(line)) => match parse_answer(&line, request.suggestion) {
                    Some(response) => break response,
                    None => eprint!("{} ", yellow("Not understood; number, 12v, abertura, encerramento or x:")),
                },
                // stdin closed: nobody left to ask.
                Ok(None) | Err(_) => break CorrectionResponse::Decline,
            }
        };

        if !request.respond(response) {
            tracing::debug!("Correction answered after the pipeline stopped waiting");
        }
    }
}

fn show_request(request: &CorrectionRequest, bar: Option<&ProgressBar>, max_pages: u32) {
    let text = request.outcome.text.trim().replace('\n', " ⏎ ");
    let suggestion = request
        .suggestion
        .map(|n| format!(" (enter for {n})"))
        .unwrap_or_default();
    let attempt = if request.attempt > 1 {
        format!(" attempt {}", request.attempt)
    } else {
        String::new()
    };
    let message = format!(
        "\n{} {}{}\n  {}\n  reason: {}\n  OCR read: {}\n  Sheet number 1..={}{}, 12v, abertura, encerramento or x to mark as error: ",
        cyan("◆"),
        bold(&request.file_name),
        dim(&attempt),
        dim(&request.path.display().to_string()),
        request.reason,
        if text.is_empty() { dim("(nothing)") } else { text },
        max_pages,
        suggestion,
    );
    match bar {
        Some(bar) => bar.suspend(|| eprint!("{message}")),
        None => eprint!("{message}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answers_are_parsed() {
        assert_eq!(
            parse_answer("12", None),
            Some(CorrectionResponse::Page {
                number: 12,
                side: Side::Front
            })
        );
        assert_eq!(
            parse_answer(" 12v ", Some(3)),
            Some(CorrectionResponse::Page {
                number: 12,
                side: Side::Verso
            })
        );
        assert_eq!(
            parse_answer("12-V", None),
            Some(CorrectionResponse::Page {
                number: 12,
                side: Side::Verso
            })
        );
        assert_eq!(parse_answer("Abertura", None), Some(CorrectionResponse::OpeningTerm));
        assert_eq!(parse_answer("close", None), Some(CorrectionResponse::ClosingTerm));
        assert_eq!(parse_answer("x", Some(7)), Some(CorrectionResponse::Decline));
        assert_eq!(parse_answer("doze", None), None);
    }

    #[test]
    fn empty_answer_takes_the_suggestion() {
        assert_eq!(
            parse_answer("  ", Some(7)),
            Some(CorrectionResponse::Page {
                number: 7,
                side: Side::Front
            })
        );
        // Nothing to accept: ask again rather than guess.
        assert_eq!(parse_answer("", None), None);
    }

    #[test]
    fn roi_is_parsed_and_validated() {
        let roi = parse_roi("0.5, 0, 1, 0.2").unwrap();
        assert_eq!(roi, RegionOfInterest::new(0.5, 0.0, 1.0, 0.2));
        assert!(parse_roi("0.5,0,1").is_err());
        assert!(parse_roi("0.9,0,0.1,0.2").is_err());
        assert!(parse_roi("a,b,c,d").is_err());
    }
}

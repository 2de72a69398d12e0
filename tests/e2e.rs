//! End-to-end tests against a real Tesseract install.
//!
//! Scans are rendered on the fly: a white page with a black "FOLHA n" stamp
//! drawn from a tiny built-in bitmap font, so no fixture files are needed.
//! Gated behind `E2E_ENABLED` because they need the `tesseract` binary and
//! the `por` language pack.
//!
//! Run with:
//!   E2E_ENABLED=1 cargo test --test e2e -- --nocapture

use image::{imageops, DynamicImage, GrayImage, Luma};
use image2doc::{
    inspect, organize, OcrEngine, PipelineConfig, RecognitionMode, RegionOfInterest, TesseractEngine,
};
use std::path::Path;
use tempfile::TempDir;

// ── Test helpers ─────────────────────────────────────────────────────────────

/// Skip this test unless E2E_ENABLED is set and tesseract answers.
macro_rules! e2e_skip_unless_ready {
    () => {{
        if std::env::var("E2E_ENABLED").is_err() {
            println!("SKIP: set E2E_ENABLED=1 to run e2e tests");
            return;
        }
        init_tracing();
        if let Err(e) = TesseractEngine::new("por").probe() {
            println!("SKIP: tesseract not usable: {e}");
            return;
        }
    }};
}

/// Route library logs to the test output; `RUST_LOG=image2doc=debug` for detail.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// 5×7 glyphs, one row per byte, low five bits used.
fn glyph(c: char) -> [u8; 7] {
    match c {
        'F' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x10],
        'O' => [0x0E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'L' => [0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1F],
        'H' => [0x11, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'A' => [0x0E, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        _ => [0; 7],
    }
}

/// A portrait scan with `stamp` printed large in the upper-right band.
fn stamped_page(stamp: &str) -> GrayImage {
    const SCALE: u32 = 8;
    let mut page = GrayImage::from_pixel(1240, 1754, Luma([255]));
    let (x0, y0) = (700u32, 180u32);
    for (i, c) in stamp.chars().enumerate() {
        let rows = glyph(c);
        let gx = x0 + i as u32 * 6 * SCALE;
        for (ry, bits) in rows.iter().enumerate() {
            for rx in 0..5u32 {
                if bits & (0x10 >> rx) == 0 {
                    continue;
                }
                for dy in 0..SCALE {
                    for dx in 0..SCALE {
                        page.put_pixel(gx + rx * SCALE + dx, y0 + ry as u32 * SCALE + dy, Luma([0]));
                    }
                }
            }
        }
    }
    page
}

fn write_page(dir: &Path, name: &str, stamp: &str) {
    stamped_page(stamp).save(dir.join(name)).unwrap();
}

// ── Engine ───────────────────────────────────────────────────────────────────

#[test]
fn test_tesseract_reads_stamp() {
    e2e_skip_unless_ready!();
    let engine = TesseractEngine::new("por");
    let page = DynamicImage::ImageLuma8(stamped_page("FOLHA 12"));
    let band = page.crop_imm(560, 88, 620, 350);
    let rec = engine.recognize(&band, RecognitionMode::Region).unwrap();
    println!("read: {:?} conf={:?}", rec.text, rec.confidence);
    assert!(rec.text.contains("12"), "got {:?}", rec.text);
}

#[test]
fn test_missing_binary_is_unavailable() {
    let engine = TesseractEngine::new("por").with_binary("/nonexistent/tesseract");
    let err = engine.probe().unwrap_err();
    assert!(matches!(err, image2doc::OcrError::Unavailable(_)), "{err}");
}

// ── Full runs ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_organize_stamped_book() {
    e2e_skip_unless_ready!();
    let input = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    write_page(input.path(), "scan_003.png", "FOLHA 1");
    write_page(input.path(), "scan_001.png", "FOLHA 3");
    write_page(input.path(), "scan_002.png", "FOLHA 2");

    // A sideways scan of sheet 4.
    let rotated = imageops::rotate270(&stamped_page("FOLHA 4"));
    rotated.save(input.path().join("scan_004.png")).unwrap();

    let config = PipelineConfig::builder()
        .max_pages(10)
        .worker_count(2)
        .build()
        .unwrap();
    let run = organize(input.path(), output.path(), &config).await.unwrap();

    for r in &run.reports {
        println!("{:<14} → {:?}  {:?}", r.file_name, r.output, r.escalation);
    }
    for expected in ["FL. 001.pdf", "FL. 002.pdf", "FL. 003.pdf", "FL. 004.pdf"] {
        assert!(output.path().join(expected).exists(), "missing {expected}");
    }
    assert_eq!(run.summary.total, 4);

    // Everything is cached now.
    let entries = inspect(input.path(), output.path(), &config).await.unwrap();
    assert!(entries.iter().all(|e| e.cached_output.is_some()));
}

#[tokio::test]
async fn test_blank_page_follows_previous_sheet() {
    e2e_skip_unless_ready!();
    let input = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    write_page(input.path(), "a.png", "FOLHA 5");
    GrayImage::from_pixel(1240, 1754, Luma([255]))
        .save(input.path().join("b.png"))
        .unwrap();

    let config = PipelineConfig::builder()
        .roi(RegionOfInterest::new(0.45, 0.05, 0.95, 0.25))
        .worker_count(1)
        .build()
        .unwrap();
    organize(input.path(), output.path(), &config).await.unwrap();

    assert!(output.path().join("FL. 005.pdf").exists());
    assert!(output.path().join("FL. 005-verso.pdf").exists());
}

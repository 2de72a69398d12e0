//! PDF assembly: one scanned page → one single-page PDF.
//!
//! The page image is JPEG-encoded and embedded as a `DCTDecode` image XObject
//! that fills the page. The page size follows the image size at the configured
//! resolution, so a 1000×1400 px scan at 100 dpi becomes a 720×1008 pt page.
//!
//! Files are written to `<name>.tmp` and renamed into place, so a crash or a
//! full disk never leaves a half-written PDF under a final name.

use crate::error::PageError;
use image::codecs::jpeg::JpegEncoder;
use image::{ColorType, DynamicImage};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Encoded page image ready to embed.
struct PageImage {
    jpeg: Vec<u8>,
    width: u32,
    height: u32,
    gray: bool,
}

fn encode_jpeg(image: &DynamicImage, quality: u8) -> io::Result<PageImage> {
    let gray = matches!(
        image.color(),
        ColorType::L8 | ColorType::La8 | ColorType::L16 | ColorType::La16
    );
    let mut jpeg = Vec::new();
    {
        let mut encoder = JpegEncoder::new_with_quality(&mut jpeg, quality);
        let encoded = if gray {
            encoder.encode_image(&image.to_luma8())
        } else {
            encoder.encode_image(&image.to_rgb8())
        };
        encoded.map_err(io::Error::other)?;
    }
    Ok(PageImage {
        jpeg,
        width: image.width(),
        height: image.height(),
        gray,
    })
}

/// Build a one-page PDF document showing `page`.
fn build_document(page: PageImage, dpi: f32) -> io::Result<Document> {
    let to_points = |px: u32| px as f32 * 72.0 / dpi;
    let (width_pt, height_pt) = (to_points(page.width), to_points(page.height));

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();

    let image = Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => page.width as i64,
            "Height" => page.height as i64,
            "ColorSpace" => if page.gray { "DeviceGray" } else { "DeviceRGB" },
            "BitsPerComponent" => 8,
            "Filter" => "DCTDecode",
        },
        page.jpeg,
    )
    .with_compression(false);
    let image_id = doc.add_object(image);

    let content = Content {
        operations: vec![
            Operation::new("q", vec![]),
            Operation::new(
                "cm",
                vec![
                    width_pt.into(),
                    0.into(),
                    0.into(),
                    height_pt.into(),
                    0.into(),
                    0.into(),
                ],
            ),
            Operation::new("Do", vec![Object::Name(b"Im0".to_vec())]),
            Operation::new("Q", vec![]),
        ],
    };
    let encoded = content.encode().map_err(io::Error::other)?;
    let content_id = doc.add_object(Stream::new(dictionary! {}, encoded));

    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "MediaBox" => vec![0.into(), 0.into(), width_pt.into(), height_pt.into()],
        "Contents" => content_id,
        "Resources" => dictionary! {
            "XObject" => dictionary! { "Im0" => image_id },
        },
    });

    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![page_id.into()],
            "Count" => 1,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    Ok(doc)
}

/// Write `image` as a single-page PDF at `path`, atomically.
///
/// Blocking; returns the number of bytes written.
pub fn write_page_pdf(image: &DynamicImage, path: &Path, dpi: f32, quality: u8) -> io::Result<u64> {
    let page = encode_jpeg(image, quality)?;
    let mut doc = build_document(page, dpi)?;

    let tmp = tmp_path(path);
    let result = (|| -> io::Result<u64> {
        let file = std::fs::File::create(&tmp)?;
        let mut writer = BufWriter::new(file);
        doc.save_to(&mut writer).map_err(io::Error::other)?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        let bytes = file.metadata()?.len();
        std::fs::rename(&tmp, path)?;
        Ok(bytes)
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Render `image` to `<output_dir>/<output>` on the blocking pool.
pub async fn assemble(
    image: DynamicImage,
    output_dir: &Path,
    output: &str,
    file_name: &str,
    dpi: f32,
    quality: u8,
) -> Result<PathBuf, PageError> {
    let path = output_dir.join(output);
    let target = path.clone();
    let written = tokio::task::spawn_blocking(move || write_page_pdf(&image, &target, dpi, quality))
        .await
        .map_err(|e| io::Error::other(format!("PDF task panicked: {e}")))
        .and_then(|r| r);

    match written {
        Ok(bytes) => {
            debug!("Wrote {} ({} bytes)", path.display(), bytes);
            Ok(path)
        }
        Err(e) => Err(PageError::WriteFailure {
            file: file_name.to_string(),
            output: output.to_string(),
            detail: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, RgbImage};
    use tempfile::TempDir;

    #[test]
    fn gray_page_round_trips_through_lopdf() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("FL. 001.pdf");
        let img = DynamicImage::ImageLuma8(GrayImage::from_pixel(100, 140, image::Luma([200])));

        let bytes = write_page_pdf(&img, &path, 100.0, 90).unwrap();
        assert!(bytes > 0);
        assert!(!dir.path().join("FL. 001.pdf.tmp").exists());

        let doc = Document::load(&path).unwrap();
        let pages = doc.get_pages();
        assert_eq!(pages.len(), 1);
        let page_id = *pages.get(&1).unwrap();
        let page = doc.get_dictionary(page_id).unwrap();
        let media_box = page.get(b"MediaBox").unwrap().as_array().unwrap();
        let w = media_box[2].as_float().unwrap();
        let h = media_box[3].as_float().unwrap();
        assert!((w - 72.0).abs() < 0.01, "{w}");
        assert!((h - 100.8).abs() < 0.01, "{h}");
    }

    #[test]
    fn color_page_uses_rgb() {
        let img = DynamicImage::ImageRgb8(RgbImage::new(8, 8));
        let page = encode_jpeg(&img, 80).unwrap();
        assert!(!page.gray);
        assert_eq!(&page.jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn output_is_deterministic_in_size() {
        let dir = TempDir::new().unwrap();
        let img = DynamicImage::ImageLuma8(GrayImage::new(20, 20));
        let a = write_page_pdf(&img, &dir.path().join("a.pdf"), 100.0, 90).unwrap();
        let b = write_page_pdf(&img, &dir.path().join("b.pdf"), 100.0, 90).unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn unwritable_dir_is_write_failure() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("gone");
        let img = DynamicImage::ImageLuma8(GrayImage::new(4, 4));
        let err = assemble(img, &missing, "FL. 002.pdf", "p.jpg", 100.0, 90)
            .await
            .unwrap_err();
        assert!(matches!(err, PageError::WriteFailure { ref output, .. } if output == "FL. 002.pdf"));
    }
}

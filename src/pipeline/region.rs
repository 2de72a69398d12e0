//! Region extraction: crop the sheet-number band and normalise scan orientation.
//!
//! ## Orientation
//!
//! Books are often scanned two-up or sideways, so a landscape image is
//! rotated to portrait before the region is cropped. Which way to turn it is
//! not knowable from pixels alone: the caller rotates clockwise first, reads
//! the region, and falls back to counter-clockwise when nothing is found
//! (see [`orientation_candidates`]).
//!
//! Everything here is pure and CPU-bound; callers run it inside
//! `spawn_blocking`.

use crate::config::RegionOfInterest;
use crate::error::PipelineError;
use image::{imageops, DynamicImage, GrayImage};
use tracing::debug;

/// Crop `roi` out of `image` and convert it to 8-bit grayscale.
///
/// Deterministic: the same image and region always give the same pixels.
/// The pixel rectangle is clamped to the image, and a rectangle that rounds
/// down to zero pixels is widened to one so tiny images still yield a crop.
pub fn crop_region(image: &DynamicImage, roi: &RegionOfInterest) -> Result<GrayImage, PipelineError> {
    roi.validate()?;

    let (x, y, w, h) = pixel_rect(image.width(), image.height(), roi);
    debug!(
        "Cropping region {}x{}+{}+{} from {}x{}",
        w,
        h,
        x,
        y,
        image.width(),
        image.height()
    );
    Ok(imageops::crop_imm(&image.to_luma8(), x, y, w, h).to_image())
}

/// Pixel rectangle `(x, y, width, height)` of `roi` on a `width`×`height` image.
pub fn pixel_rect(width: u32, height: u32, roi: &RegionOfInterest) -> (u32, u32, u32, u32) {
    let scale = |frac: f32, extent: u32| -> u32 {
        ((frac as f64) * extent as f64).round().clamp(0.0, extent as f64) as u32
    };

    let left = scale(roi.left, width).min(width.saturating_sub(1));
    let top = scale(roi.top, height).min(height.saturating_sub(1));
    let right = scale(roi.right, width).max(left + 1).min(width.max(1));
    let bottom = scale(roi.bottom, height).max(top + 1).min(height.max(1));

    (left, top, (right - left).max(1), (bottom - top).max(1))
}

/// Whether a scan is wider than it is tall.
pub fn is_landscape(image: &DynamicImage) -> bool {
    image.width() > image.height()
}

/// Orientations to try, in order, when reading the sheet number.
///
/// Portrait scans (or `auto_rotate = false`) are used as-is. Landscape scans
/// are tried rotated clockwise, then counter-clockwise.
pub fn orientation_candidates(image: DynamicImage, auto_rotate: bool) -> Vec<DynamicImage> {
    if !auto_rotate || !is_landscape(&image) {
        return vec![image];
    }
    debug!("Landscape scan {}x{}, probing both rotations", image.width(), image.height());
    vec![image.rotate90(), image.rotate270()]
}

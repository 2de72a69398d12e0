//! Input discovery: list, filter and fingerprint the scanned page images.
//!
//! Images are sorted by file name so a batch is always dispatched in the same
//! order; the blank-verso rule depends on that order. Fingerprints are
//! computed here, once, so cache hits can be decided before any worker starts.

use crate::config::FingerprintMode;
use crate::error::{PageError, PipelineError};
use image::{DynamicImage, ImageReader};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, info, warn};

/// Raster extensions accepted as input (lower-case).
pub const SUPPORTED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "tif", "tiff", "bmp"];

/// One scanned page awaiting processing.
///
/// Pixels are not held here; the worker that owns the image decodes it with
/// [`SourceImage::decode`] and drops the buffer when done.
#[derive(Debug, Clone)]
pub struct SourceImage {
    /// Position in the sorted listing.
    pub index: usize,
    pub path: PathBuf,
    pub file_name: String,
    /// File name without extension.
    pub stem: String,
    pub fingerprint: String,
}

impl SourceImage {
    /// Decode the full-resolution image.
    pub fn decode(&self) -> Result<DynamicImage, PageError> {
        let decode_err = |detail: String| PageError::DecodeFailed {
            file: self.file_name.clone(),
            detail,
        };
        ImageReader::open(&self.path)
            .map_err(|e| decode_err(e.to_string()))?
            .with_guessed_format()
            .map_err(|e| decode_err(e.to_string()))?
            .decode()
            .map_err(|e| decode_err(e.to_string()))
    }
}

/// Whether `path` has one of the [`SUPPORTED_EXTENSIONS`].
pub fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| SUPPORTED_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// A listed image whose file could not be read for fingerprinting.
#[derive(Debug, Clone)]
pub struct UnreadableImage {
    /// Position in the sorted listing.
    pub index: usize,
    pub file_name: String,
    pub error: PageError,
}

/// Result of [`discover`]: every listed image, fingerprinted or not.
#[derive(Debug, Default)]
pub struct Listing {
    pub images: Vec<SourceImage>,
    /// Files removed after listing or unreadable; reported per image.
    pub unreadable: Vec<UnreadableImage>,
}

impl Listing {
    /// Number of listed images, readable or not.
    pub fn len(&self) -> usize {
        self.images.len() + self.unreadable.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// List the supported images in `input_dir`, sorted by file name, and
/// fingerprint each one.
///
/// Subdirectories and other files are ignored. Only a missing or unlistable
/// directory is an error; a single file that cannot be read ends up in
/// [`Listing::unreadable`].
pub fn discover(input_dir: &Path, mode: FingerprintMode) -> Result<Listing, PipelineError> {
    if !input_dir.is_dir() {
        return Err(PipelineError::InputDirNotFound {
            path: input_dir.to_path_buf(),
        });
    }

    let unreadable = |source: io::Error| PipelineError::InputDirUnreadable {
        path: input_dir.to_path_buf(),
        source,
    };

    let mut paths = Vec::new();
    for entry in std::fs::read_dir(input_dir).map_err(unreadable)? {
        let path = entry.map_err(unreadable)?.path();
        if path.is_file() && is_supported(&path) {
            paths.push(path);
        } else {
            debug!("Ignoring {}", path.display());
        }
    }
    paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

    let listing = fingerprint_all(paths, mode);
    info!(
        "Found {} images in {} ({} unreadable)",
        listing.len(),
        input_dir.display(),
        listing.unreadable.len()
    );
    Ok(listing)
}

/// Fingerprint already sorted `paths`, indexing them in order.
pub fn fingerprint_all(paths: Vec<PathBuf>, mode: FingerprintMode) -> Listing {
    let mut listing = Listing::default();
    for (index, path) in paths.into_iter().enumerate() {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stem = path
            .file_stem()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_name.clone());
        match fingerprint(&path, &file_name, mode) {
            Ok(fingerprint) => listing.images.push(SourceImage {
                index,
                path,
                file_name,
                stem,
                fingerprint,
            }),
            Err(e) => {
                warn!("{}: cannot read file: {}", file_name, e);
                listing.unreadable.push(UnreadableImage {
                    index,
                    error: PageError::SourceUnreadable {
                        file: file_name.clone(),
                        detail: e.to_string(),
                    },
                    file_name,
                });
            }
        }
    }
    listing
}

/// Stable identifier of an image file.
///
/// The file name is always part of the key so two identical copies under
/// different names are tracked separately.
pub fn fingerprint(path: &Path, file_name: &str, mode: FingerprintMode) -> io::Result<String> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(file_name.as_bytes());
    hasher.update(&[0]);

    match mode {
        FingerprintMode::Metadata => {
            let meta = std::fs::metadata(path)?;
            let mtime = meta
                .modified()?
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0);
            hasher.update(&meta.len().to_le_bytes());
            hasher.update(&mtime.to_le_bytes());
            Ok(format!("meta-{}", hasher.finalize().to_hex()))
        }
        FingerprintMode::Content => {
            let mut file = File::open(path)?;
            io::copy(&mut file, &mut hasher)?;
            Ok(format!("blake3-{}", hasher.finalize().to_hex()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
        let p = dir.join(name);
        std::fs::write(&p, bytes).unwrap();
        p
    }

    #[test]
    fn test_is_supported() {
        assert!(is_supported(Path::new("a.jpg")));
        assert!(is_supported(Path::new("a.JPEG")));
        assert!(is_supported(Path::new("scan.Png")));
        assert!(is_supported(Path::new("b.tif")));
        assert!(!is_supported(Path::new("notes.txt")));
        assert!(!is_supported(Path::new("FL. 001.pdf")));
        assert!(!is_supported(Path::new("noext")));
    }

    #[test]
    fn discover_filters_and_sorts() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "page10.jpg", b"x");
        touch(dir.path(), "page02.JPG", b"x");
        touch(dir.path(), "readme.txt", b"x");
        touch(dir.path(), "page01.png", b"x");
        std::fs::create_dir(dir.path().join("sub.jpg")).unwrap();

        let images = discover(dir.path(), FingerprintMode::Metadata).unwrap().images;
        let names: Vec<_> = images.iter().map(|i| i.file_name.as_str()).collect();
        assert_eq!(names, vec!["page01.png", "page02.JPG", "page10.jpg"]);
        assert_eq!(images[1].stem, "page02");
        assert_eq!(images[2].index, 2);
    }

    #[test]
    fn discover_missing_dir() {
        let err = discover(Path::new("/definitely/not/here"), FingerprintMode::Metadata).unwrap_err();
        assert!(matches!(err, PipelineError::InputDirNotFound { .. }));
    }

    #[test]
    fn vanished_file_is_reported_not_fatal() {
        let dir = TempDir::new().unwrap();
        let a = touch(dir.path(), "a.jpg", b"x");
        let gone = dir.path().join("b.jpg");
        let c = touch(dir.path(), "c.jpg", b"x");

        let listing = fingerprint_all(vec![a, gone, c], FingerprintMode::Content);
        assert_eq!(listing.len(), 3);
        let indices: Vec<_> = listing.images.iter().map(|i| i.index).collect();
        assert_eq!(indices, vec![0, 2]);
        assert_eq!(listing.unreadable.len(), 1);
        let missing = &listing.unreadable[0];
        assert_eq!((missing.index, missing.file_name.as_str()), (1, "b.jpg"));
        assert!(matches!(missing.error, PageError::SourceUnreadable { .. }));
        assert!(missing.error.is_terminal_failure());
    }

    #[test]
    fn content_fingerprint_tracks_bytes() {
        let dir = TempDir::new().unwrap();
        let p = touch(dir.path(), "a.jpg", b"one");
        let first = fingerprint(&p, "a.jpg", FingerprintMode::Content).unwrap();
        let again = fingerprint(&p, "a.jpg", FingerprintMode::Content).unwrap();
        assert_eq!(first, again);
        assert!(first.starts_with("blake3-"));

        std::fs::write(&p, b"two").unwrap();
        let changed = fingerprint(&p, "a.jpg", FingerprintMode::Content).unwrap();
        assert_ne!(first, changed);
    }

    #[test]
    fn fingerprint_includes_name() {
        let dir = TempDir::new().unwrap();
        let a = touch(dir.path(), "a.jpg", b"same");
        let b = touch(dir.path(), "b.jpg", b"same");
        let fa = fingerprint(&a, "a.jpg", FingerprintMode::Content).unwrap();
        let fb = fingerprint(&b, "b.jpg", FingerprintMode::Content).unwrap();
        assert_ne!(fa, fb);
    }

    #[test]
    fn decode_reports_garbage() {
        let dir = TempDir::new().unwrap();
        let p = touch(dir.path(), "bad.jpg", b"not an image");
        let img = SourceImage {
            index: 0,
            path: p,
            file_name: "bad.jpg".into(),
            stem: "bad".into(),
            fingerprint: "x".into(),
        };
        assert!(matches!(img.decode(), Err(PageError::DecodeFailed { .. })));
    }
}

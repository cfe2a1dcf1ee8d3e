//! Input image discovery.

use std::path::{Path, PathBuf};

use rand::seq::IndexedRandom;
use rand::Rng;
use walkdir::WalkDir;

use crate::error::CoreError;

/// File extensions accepted as input images.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp"];

/// Whether `path` has an accepted image extension (case-insensitive).
pub fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.iter().any(|x| e.eq_ignore_ascii_case(x)))
        .unwrap_or(false)
}

/// List the images directly inside `dir`, sorted by path.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>, CoreError> {
    if !dir.is_dir() {
        return Err(CoreError::NotFound(dir.to_path_buf()));
    }

    let mut images: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| is_image(path))
        .collect();
    images.sort();
    Ok(images)
}

/// Pick one image from `dir` uniformly at random.
pub fn pick_random<R: Rng + ?Sized>(dir: &Path, rng: &mut R) -> Option<PathBuf> {
    let images = list_images(dir).ok()?;
    images.choose(rng).cloned()
}

/// Read an image's pixel dimensions from its header.
pub fn dimensions(path: &Path) -> Result<(u32, u32), CoreError> {
    image::image_dimensions(path)
        .map_err(|e| CoreError::Validation(format!("{}: {e}", path.display())))
}

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use image::{DynamicImage, ImageFormat};

// ────────────────────────────────────────────────────────────────
// Thumbnail Generation
// ────────────────────────────────────────────────────────────────

/// Write a JPEG thumbnail whose longer side is at most `max_side`
pub fn generate_thumbnail(dynamic_image: &DynamicImage, path: &Path, max_side: u32) -> Result<()> {
    let (compressed_width, compressed_height) =
        small_width_height(dynamic_image.width(), dynamic_image.height(), max_side);
    let thumbnail_image = dynamic_image
        .thumbnail_exact(compressed_width, compressed_height)
        .to_rgb8();

    let parent_path = path
        .parent()
        .ok_or_else(|| anyhow!("failed to determine parent directory of {:?}", path))?;
    std::fs::create_dir_all(parent_path)
        .context(format!("failed to create directory tree {:?}", parent_path))?;

    thumbnail_image
        .save_with_format(path, ImageFormat::Jpeg)
        .context(format!("failed to save JPEG thumbnail to {:?}", path))?;

    Ok(())
}

// ────────────────────────────────────────────────────────────────
// Perceptual Hash
// ────────────────────────────────────────────────────────────────

pub fn generate_thumbhash(dynamic_image_rotated: &DynamicImage) -> Vec<u8> {
    let resized_image = dynamic_image_rotated.thumbnail_exact(100, 100);
    let rgba_image = resized_image.to_rgba8();
    let (swidth, sheight) = (rgba_image.width(), rgba_image.height());
    thumbhash::rgba_to_thumb_hash(swidth as usize, sheight as usize, &rgba_image)
}

// ────────────────────────────────────────────────────────────────
// Helper Functions
// ────────────────────────────────────────────────────────────────

/// Resize dimensions so that the larger side equals `small_side`, preserving aspect ratio.
/// Images already smaller than `small_side` keep their size.
pub fn small_width_height(width: u32, height: u32, small_side: u32) -> (u32, u32) {
    let (nwidth, nheight) = if width >= std::cmp::max(height, small_side) {
        (small_side, height * small_side / width)
    } else if height >= std::cmp::max(width, small_side) {
        (width * small_side / height, small_side)
    } else {
        (width, height)
    };

    (nwidth.max(1), nheight.max(1))
}

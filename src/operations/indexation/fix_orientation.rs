use image::DynamicImage;

// EXIF orientation codes that need a rotation to display upright.
const ROTATE_90: u32 = 6;
const ROTATE_180: u32 = 3;
const ROTATE_270: u32 = 8;

pub fn fix_image_orientation(orientation: Option<u32>, dynamic_image: &mut DynamicImage) {
    match orientation {
        Some(ROTATE_90) => *dynamic_image = dynamic_image.rotate90(),
        Some(ROTATE_180) => *dynamic_image = dynamic_image.rotate180(),
        Some(ROTATE_270) => *dynamic_image = dynamic_image.rotate270(),
        _ => (),
    }
}

/// Stored dimensions describe the upright image.
pub fn fix_image_width_height(orientation: Option<u32>, width: &mut u32, height: &mut u32) {
    if matches!(orientation, Some(ROTATE_90 | ROTATE_270)) {
        std::mem::swap(width, height)
    }
}

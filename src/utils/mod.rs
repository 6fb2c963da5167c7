use std::collections::HashMap;
use std::path::Path;

use arrayvec::ArrayString;

use crate::common::{VALID_IMAGE_EXTENSIONS, VALID_LIVE_PHOTO_EXTENSIONS};
use crate::models::StorageObject;

pub trait PathExt {
    fn ext_lower(&self) -> String;
}

impl PathExt for Path {
    fn ext_lower(&self) -> String {
        self.extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_ascii_lowercase())
            .unwrap_or_default()
    }
}

pub fn is_image_key(key: &str) -> bool {
    VALID_IMAGE_EXTENSIONS.contains(&Path::new(key).ext_lower().as_str())
}

pub fn is_live_photo_key(key: &str) -> bool {
    VALID_LIVE_PHOTO_EXTENSIONS.contains(&Path::new(key).ext_lower().as_str())
}

/// Thumbnails are addressed by the Blake3 hash of the storage key, so nested
/// keys map to a flat directory without collisions.
pub fn thumbnail_hash(key: &str) -> ArrayString<64> {
    blake3::hash(key.as_bytes()).to_hex()
}

pub fn thumbnail_file_name(key: &str) -> String {
    format!("{}.jpg", thumbnail_hash(key))
}

/// Pair every image with a motion clip that shares its stem.
///
/// Keys are compared case-insensitively, so `IMG_1.HEIC` pairs with `IMG_1.mov`.
pub fn pair_live_photos(objects: &[StorageObject]) -> HashMap<String, StorageObject> {
    let videos: HashMap<String, &StorageObject> = objects
        .iter()
        .filter(|object| is_live_photo_key(&object.key))
        .map(|object| (object.stem().to_lowercase(), object))
        .collect();

    objects
        .iter()
        .filter(|object| is_image_key(&object.key))
        .filter_map(|image| {
            videos
                .get(&image.stem().to_lowercase())
                .map(|video| (image.key.clone(), (*video).clone()))
        })
        .collect()
}

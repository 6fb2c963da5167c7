use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::storage_object::StorageObject;

pub const MANIFEST_VERSION: &str = "v1";

/// Camera and lens fields extracted from EXIF.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoExif {
    pub make: Option<String>,
    pub model: Option<String>,
    pub lens_make: Option<String>,
    pub lens_model: Option<String>,
    pub f_number: Option<f64>,
    pub exposure_time: Option<String>,
    pub iso: Option<u32>,
    pub focal_length: Option<f64>,
    pub date_time_original: Option<String>,
}

/// Enriched, persisted record for one photo, keyed by its storage key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestItem {
    pub id: String,
    pub key: String,
    pub title: String,
    pub size: Option<u64>,
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
    pub width: u32,
    pub height: u32,
    pub aspect_ratio: f64,
    pub thumbnail_url: Option<String>,
    pub thumbhash: Option<Vec<u8>>,
    pub date_taken: Option<DateTime<Utc>>,
    pub exif: Option<PhotoExif>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub live_photo_video_key: Option<String>,
}

impl ManifestItem {
    /// Seed a record from the raw storage identity; enrichment fills in the rest.
    pub fn from_object(object: &StorageObject) -> Self {
        let file_name = object.stem().rsplit('/').next().unwrap_or(object.stem());
        Self {
            id: file_name.to_string(),
            key: object.key.clone(),
            title: file_name.to_string(),
            size: object.size,
            last_modified: object.last_modified,
            etag: object.etag.clone(),
            width: 0,
            height: 0,
            aspect_ratio: 0.0,
            thumbnail_url: None,
            thumbhash: None,
            date_taken: None,
            exif: None,
            tags: Vec::new(),
            live_photo_video_key: None,
        }
    }

    pub fn set_dimensions(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.aspect_ratio = if height == 0 {
            0.0
        } else {
            f64::from(width) / f64::from(height)
        };
    }

    /// Tags are derived from the directory components of the key.
    pub fn tags_from_key(key: &str) -> Vec<String> {
        let mut parts: Vec<&str> = key.split('/').collect();
        parts.pop();
        parts
            .into_iter()
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraInfo {
    pub make: String,
    pub model: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LensInfo {
    pub make: Option<String>,
    pub model: String,
    pub display_name: String,
}

/// The persisted artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    pub items: Vec<ManifestItem>,
    #[serde(default)]
    pub cameras: Vec<CameraInfo>,
    #[serde(default)]
    pub lenses: Vec<LensInfo>,
}

impl Manifest {
    pub fn empty() -> Self {
        Self {
            version: MANIFEST_VERSION.to_string(),
            items: Vec::new(),
            cameras: Vec::new(),
            lenses: Vec::new(),
        }
    }

    /// Index the items by key. Later duplicates win.
    pub fn item_map(&self) -> HashMap<String, ManifestItem> {
        self.items
            .iter()
            .map(|item| (item.key.clone(), item.clone()))
            .collect()
    }
}

impl Default for Manifest {
    fn default() -> Self {
        Self::empty()
    }
}

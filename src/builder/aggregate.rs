use std::cmp::Reverse;
use std::collections::BTreeMap;

use crate::models::{CameraInfo, LensInfo, ManifestItem};

/// Unique cameras across the items, keyed and sorted by display name.
pub fn collect_cameras(items: &[ManifestItem]) -> Vec<CameraInfo> {
    let mut cameras = BTreeMap::new();
    for exif in items.iter().filter_map(|item| item.exif.as_ref()) {
        let (Some(make), Some(model)) = (non_empty(&exif.make), non_empty(&exif.model)) else {
            continue;
        };
        let display_name = display_name(Some(make), model);
        cameras.entry(display_name.clone()).or_insert_with(|| CameraInfo {
            make: make.to_string(),
            model: model.to_string(),
            display_name,
        });
    }
    cameras.into_values().collect()
}

/// Unique lenses across the items. The lens make is optional in EXIF.
pub fn collect_lenses(items: &[ManifestItem]) -> Vec<LensInfo> {
    let mut lenses = BTreeMap::new();
    for exif in items.iter().filter_map(|item| item.exif.as_ref()) {
        let Some(model) = non_empty(&exif.lens_model) else {
            continue;
        };
        let make = non_empty(&exif.lens_make);
        let display_name = display_name(make, model);
        lenses.entry(display_name.clone()).or_insert_with(|| LensInfo {
            make: make.map(str::to_string),
            model: model.to_string(),
            display_name,
        });
    }
    lenses.into_values().collect()
}

/// Newest first by capture date; undated items last; key breaks ties.
pub fn sort_items(items: &mut [ManifestItem]) {
    items.sort_by(|a, b| {
        Reverse(a.date_taken)
            .cmp(&Reverse(b.date_taken))
            .then_with(|| a.key.cmp(&b.key))
    });
}

// "Canon" + "Canon EOS R5" reads as "Canon EOS R5", not "Canon Canon EOS R5".
fn display_name(make: Option<&str>, model: &str) -> String {
    match make {
        Some(make) if !model.to_lowercase().starts_with(&make.to_lowercase()) => {
            format!("{make} {model}")
        }
        _ => model.to_string(),
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};

use crate::config::BuildOptions;
use crate::interfaces::ManifestStore;
use crate::models::{ManifestItem, StorageObject};

/// Pick the images that need enrichment this run.
///
/// An image is selected when it has no prior record, when its stored
/// signature differs from the listing, or when its thumbnail is gone. Any
/// force flag selects everything.
pub fn select_tasks(
    images: &[StorageObject],
    existing: &HashMap<String, ManifestItem>,
    store: &dyn ManifestStore,
    options: &BuildOptions,
) -> Vec<StorageObject> {
    if options.force_any() {
        return images.to_vec();
    }

    images
        .iter()
        .filter(|object| match existing.get(&object.key) {
            None => true,
            Some(item) => store.needs_update(item, object) || !store.thumbnail_exists(item),
        })
        .cloned()
        .collect()
}

/// Largest first, so the biggest files cannot become the tail of the run.
/// Unknown sizes count as zero; ties keep listing order.
pub fn sort_by_size_desc(tasks: &mut [StorageObject]) {
    tasks.sort_by_key(|object| Reverse(object.size_or_zero()));
}

/// Keys with a prior record that are no longer in storage, sorted.
pub fn find_deleted_keys(existing: &HashMap<String, ManifestItem>, present: &HashSet<&str>) -> Vec<String> {
    let mut deleted: Vec<String> = existing
        .keys()
        .filter(|key| !present.contains(key.as_str()))
        .cloned()
        .collect();
    deleted.sort_unstable();
    deleted
}

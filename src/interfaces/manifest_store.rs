use anyhow::Result;
use futures::future::BoxFuture;

use crate::models::{CameraInfo, LensInfo, Manifest, ManifestItem, StorageObject};

pub trait ManifestStore: Send + Sync {
    fn load(&self) -> BoxFuture<'_, Result<Manifest>>;

    fn save<'a>(
        &'a self,
        items: &'a [ManifestItem],
        cameras: &'a [CameraInfo],
        lenses: &'a [LensInfo],
    ) -> BoxFuture<'a, Result<()>>;

    fn needs_update(&self, existing: &ManifestItem, object: &StorageObject) -> bool {
        signature_changed(existing, object)
    }

    fn thumbnail_exists(&self, item: &ManifestItem) -> bool {
        item.thumbnail_url.is_some()
    }
}

/// Compares the modification signature (time, size, etag) of a stored record
/// with a fresh listing. A side the listing does not report is not compared.
pub fn signature_changed(existing: &ManifestItem, object: &StorageObject) -> bool {
    if object.last_modified.is_some() && existing.last_modified != object.last_modified {
        return true;
    }
    if object.size.is_some() && existing.size != object.size {
        return true;
    }
    matches!(
        (&existing.etag, &object.etag),
        (Some(old), Some(new)) if old != new
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[test]
    fn signature_compares_time_size_and_etag() {
        let now = Utc::now();
        let object = StorageObject::new("a.jpg")
            .with_size(100)
            .with_last_modified(now)
            .with_etag("e1");
        let item = ManifestItem::from_object(&object);

        assert!(!signature_changed(&item, &object));
        assert!(signature_changed(&item, &object.clone().with_size(101)));
        assert!(signature_changed(
            &item,
            &object.clone().with_last_modified(now + Duration::seconds(1))
        ));
        assert!(signature_changed(&item, &object.clone().with_etag("e2")));
        assert!(!signature_changed(&item, &StorageObject::new("a.jpg")));
    }
}

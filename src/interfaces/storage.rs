use std::collections::HashMap;

use anyhow::{Result, anyhow};
use futures::future::BoxFuture;

use crate::models::StorageObject;

/// Called with the running count of files seen while listing. The callback
/// may borrow from the caller for the duration of the listing.
pub type ListingProgress<'a> = dyn Fn(usize) + Send + Sync + 'a;

/// Object storage consumed by the builder and by the per-item processor.
pub trait StorageProvider: Send + Sync {
    fn list_all_files<'a>(
        &'a self,
        progress: Option<&'a ListingProgress<'a>>,
    ) -> BoxFuture<'a, Result<Vec<StorageObject>>>;

    fn list_images(&self) -> BoxFuture<'_, Result<Vec<StorageObject>>>;

    /// Map of image key to its paired motion clip ("live photo").
    fn detect_paired_assets(&self, _objects: &[StorageObject]) -> HashMap<String, StorageObject> {
        HashMap::new()
    }

    fn get_file<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>>;

    fn upload_file<'a>(
        &'a self,
        key: &'a str,
        _data: Vec<u8>,
    ) -> BoxFuture<'a, Result<StorageObject>> {
        let error = anyhow!("storage provider does not support uploads ({key})");
        Box::pin(async move { Err::<StorageObject, _>(error) })
    }

    fn delete_file<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
        let error = anyhow!("storage provider does not support deletes ({key})");
        Box::pin(async move { Err::<(), _>(error) })
    }

    fn move_file<'a>(&'a self, from: &'a str, to: &'a str) -> BoxFuture<'a, Result<StorageObject>> {
        let error = anyhow!("storage provider does not support moves ({from} -> {to})");
        Box::pin(async move { Err::<StorageObject, _>(error) })
    }
}

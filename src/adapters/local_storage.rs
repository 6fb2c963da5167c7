use std::collections::HashMap;
use std::fs::Metadata;
use std::path::{Component, Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use log::{info, warn};
use path_clean::PathClean;
use tokio::sync::mpsc::{self, UnboundedSender};
use walkdir::{DirEntry, WalkDir};

use crate::config::BuilderConfig;
use crate::interfaces::{ListingProgress, StorageProvider};
use crate::models::StorageObject;
use crate::utils::{is_image_key, pair_live_photos};

/// Progress is reported every this many files while walking.
const PROGRESS_EVERY: usize = 256;

/// Storage backed by a directory tree. Keys are `/`-separated paths
/// relative to the root.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root: PathBuf = root.into();
        Self { root: root.clean() }
    }

    pub fn from_config(config: &BuilderConfig) -> Self {
        Self::new(&config.storage_root)
    }

    /// Map a key onto the tree, refusing anything that escapes the root.
    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        if relative.is_absolute()
            || relative
                .components()
                .any(|component| matches!(component, Component::Prefix(_)))
        {
            bail!("storage key {key:?} must be relative");
        }
        let path = self.root.join(relative).clean();
        if !path.starts_with(&self.root) || path == self.root {
            bail!("storage key {key:?} escapes {}", self.root.display());
        }
        Ok(path)
    }

    async fn list_all(&self, progress: Option<&ListingProgress<'_>>) -> Result<Vec<StorageObject>> {
        let start_time = Instant::now();
        let root = self.root.clone();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let walker = tokio::task::spawn_blocking(move || scan(&root, tx));

        while let Some(count) = rx.recv().await {
            if let Some(progress) = progress {
                progress(count);
            }
        }
        let objects = walker.await.context("storage walker panicked")??;

        info!(
            duration = &*format!("{:?}", start_time.elapsed());
            "walked {} files under {}", objects.len(), self.root.display()
        );
        Ok(objects)
    }

    async fn list_image_objects(&self) -> Result<Vec<StorageObject>> {
        let mut objects = self.list_all(None).await?;
        objects.retain(|object| is_image_key(&object.key));
        Ok(objects)
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    async fn write(&self, key: &str, data: Vec<u8>) -> Result<StorageObject> {
        let path = self.resolve(key)?;
        create_parent(&path).await?;
        tokio::fs::write(&path, data)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        self.stat(key, &path).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        tokio::fs::remove_file(&path)
            .await
            .with_context(|| format!("failed to delete {}", path.display()))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<StorageObject> {
        let source = self.resolve(from)?;
        let target = self.resolve(to)?;
        create_parent(&target).await?;
        tokio::fs::rename(&source, &target)
            .await
            .with_context(|| format!("failed to move {} to {}", source.display(), target.display()))?;
        self.stat(to, &target).await
    }

    async fn stat(&self, key: &str, path: &Path) -> Result<StorageObject> {
        let metadata = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("failed to stat {}", path.display()))?;
        Ok(object_from_metadata(key.to_string(), &metadata))
    }
}

impl StorageProvider for LocalStorage {
    fn list_all_files<'a>(
        &'a self,
        progress: Option<&'a ListingProgress<'a>>,
    ) -> BoxFuture<'a, Result<Vec<StorageObject>>> {
        Box::pin(self.list_all(progress))
    }

    fn list_images(&self) -> BoxFuture<'_, Result<Vec<StorageObject>>> {
        Box::pin(self.list_image_objects())
    }

    fn detect_paired_assets(&self, objects: &[StorageObject]) -> HashMap<String, StorageObject> {
        pair_live_photos(objects)
    }

    fn get_file<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
        Box::pin(self.read(key))
    }

    fn upload_file<'a>(&'a self, key: &'a str, data: Vec<u8>) -> BoxFuture<'a, Result<StorageObject>> {
        Box::pin(self.write(key, data))
    }

    fn delete_file<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.remove(key))
    }

    fn move_file<'a>(&'a self, from: &'a str, to: &'a str) -> BoxFuture<'a, Result<StorageObject>> {
        Box::pin(self.rename(from, to))
    }
}

// ────────────────────────────────────────────────────────────────
// Walking
// ────────────────────────────────────────────────────────────────

fn scan(root: &Path, progress: UnboundedSender<usize>) -> Result<Vec<StorageObject>> {
    if !root.is_dir() {
        bail!("storage root {} is not a directory", root.display());
    }

    let mut objects = Vec::new();
    for entry in WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry))
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("skipping unreadable entry: {e}");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let key = key_for(root, entry.path())?;
        let metadata = entry
            .metadata()
            .map_err(|e| anyhow!("failed to stat {}: {e}", entry.path().display()))?;
        objects.push(object_from_metadata(key, &metadata));

        if objects.len() % PROGRESS_EVERY == 0 {
            let _ = progress.send(objects.len());
        }
    }
    let _ = progress.send(objects.len());

    objects.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(objects)
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.file_name().to_str().is_some_and(|name| name.starts_with('.'))
}

fn key_for(root: &Path, path: &Path) -> Result<String> {
    let relative = path
        .strip_prefix(root)
        .with_context(|| format!("{} is outside {}", path.display(), root.display()))?;
    let parts: Vec<&str> = relative
        .components()
        .map(|component| {
            component
                .as_os_str()
                .to_str()
                .ok_or_else(|| anyhow!("non UTF-8 path {}", path.display()))
        })
        .collect::<Result<_>>()?;
    Ok(parts.join("/"))
}

fn object_from_metadata(key: String, metadata: &Metadata) -> StorageObject {
    let mut object = StorageObject::new(key).with_size(metadata.len());
    if let Ok(modified) = metadata.modified() {
        object = object.with_last_modified(DateTime::<Utc>::from(modified));
    }
    object
}

async fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    Ok(())
}

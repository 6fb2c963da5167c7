use std::path::PathBuf;

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use log::{info, warn};

use crate::config::BuilderConfig;
use crate::interfaces::ManifestStore;
use crate::models::{CameraInfo, LensInfo, MANIFEST_VERSION, Manifest, ManifestItem};
use crate::utils::thumbnail_file_name;

/// Manifest persisted as pretty-printed JSON next to a flat thumbnail directory.
#[derive(Debug, Clone)]
pub struct JsonManifestStore {
    manifest_path: PathBuf,
    thumbnail_dir: PathBuf,
}

impl JsonManifestStore {
    pub fn new(manifest_path: impl Into<PathBuf>, thumbnail_dir: impl Into<PathBuf>) -> Self {
        Self {
            manifest_path: manifest_path.into(),
            thumbnail_dir: thumbnail_dir.into(),
        }
    }

    pub fn from_config(config: &BuilderConfig) -> Self {
        Self::new(&config.manifest_path, &config.thumbnail_dir)
    }

    async fn read_manifest(&self) -> Result<Manifest> {
        let text = match tokio::fs::read_to_string(&self.manifest_path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("no manifest at {}, starting fresh", self.manifest_path.display());
                return Ok(Manifest::empty());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", self.manifest_path.display()));
            }
        };

        let manifest: Manifest = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse {}", self.manifest_path.display()))?;
        if manifest.version != MANIFEST_VERSION {
            warn!(
                "manifest version {} does not match {}, rebuilding from scratch",
                manifest.version, MANIFEST_VERSION
            );
            return Ok(Manifest::empty());
        }
        Ok(manifest)
    }

    async fn write_manifest(&self, items: &[ManifestItem], cameras: &[CameraInfo], lenses: &[LensInfo]) -> Result<()> {
        let manifest = Manifest {
            version: MANIFEST_VERSION.to_string(),
            items: items.to_vec(),
            cameras: cameras.to_vec(),
            lenses: lenses.to_vec(),
        };
        let json = serde_json::to_vec_pretty(&manifest).context("failed to serialize manifest")?;

        if let Some(parent) = self.manifest_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        // Write next to the target and rename, so readers never see half a file.
        let path_tmp = self.manifest_path.with_extension("json.tmp");
        tokio::fs::write(&path_tmp, json)
            .await
            .with_context(|| format!("failed to write {}", path_tmp.display()))?;
        tokio::fs::rename(&path_tmp, &self.manifest_path)
            .await
            .with_context(|| format!("failed to replace {}", self.manifest_path.display()))?;

        info!("saved {} items to {}", items.len(), self.manifest_path.display());
        Ok(())
    }
}

impl ManifestStore for JsonManifestStore {
    fn load(&self) -> BoxFuture<'_, Result<Manifest>> {
        Box::pin(self.read_manifest())
    }

    fn save<'a>(
        &'a self,
        items: &'a [ManifestItem],
        cameras: &'a [CameraInfo],
        lenses: &'a [LensInfo],
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.write_manifest(items, cameras, lenses))
    }

    fn thumbnail_exists(&self, item: &ManifestItem) -> bool {
        item.thumbnail_url.is_some() && self.thumbnail_dir.join(thumbnail_file_name(&item.key)).is_file()
    }
}

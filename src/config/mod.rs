use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use dotenv::dotenv;
use serde::{Deserialize, Serialize};

use crate::common::{CURRENT_NUM_THREADS, ENV_PREFIX};

/// Builder configuration, read from `GALLERY_*` environment variables.
///
/// The same value travels to worker processes inside the shared snapshot, so
/// it must stay serialisable by both `envy` and `bitcode`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuilderConfig {
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,
    #[serde(default = "default_manifest_path")]
    pub manifest_path: PathBuf,
    #[serde(default = "default_thumbnail_dir")]
    pub thumbnail_dir: PathBuf,
    #[serde(default = "default_thumbnail_url_prefix")]
    pub thumbnail_url_prefix: String,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_true")]
    pub cluster_enabled: bool,
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    #[serde(default = "default_true")]
    pub live_photo_detection: bool,
    #[serde(default = "default_thumbnail_size")]
    pub thumbnail_size: u32,
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("./photos")
}

fn default_manifest_path() -> PathBuf {
    PathBuf::from("./manifest/photos-manifest.json")
}

fn default_thumbnail_dir() -> PathBuf {
    PathBuf::from("./manifest/thumbnails")
}

fn default_thumbnail_url_prefix() -> String {
    "/thumbnails".to_string()
}

fn default_concurrency() -> usize {
    *CURRENT_NUM_THREADS
}

fn default_worker_concurrency() -> usize {
    2
}

fn default_thumbnail_size() -> u32 {
    600
}

fn default_true() -> bool {
    true
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            storage_root: default_storage_root(),
            manifest_path: default_manifest_path(),
            thumbnail_dir: default_thumbnail_dir(),
            thumbnail_url_prefix: default_thumbnail_url_prefix(),
            concurrency: default_concurrency(),
            cluster_enabled: true,
            worker_concurrency: default_worker_concurrency(),
            live_photo_detection: true,
            thumbnail_size: default_thumbnail_size(),
        }
    }
}

impl BuilderConfig {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        envy::prefixed(ENV_PREFIX)
            .from_env::<Self>()
            .context("failed to read GALLERY_* builder configuration")
    }
}

/// Per-run switches. Force flags are forwarded to worker processes as
/// `GALLERY_FORCE_*` variables and decoded there with the same type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOptions {
    #[serde(default)]
    pub force_full_rescan: bool,
    #[serde(default)]
    pub force_manifest_rebuild: bool,
    #[serde(default)]
    pub force_thumbnail_rebuild: bool,
    #[serde(default)]
    pub concurrency_limit: Option<usize>,
}

impl BuildOptions {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        envy::prefixed(ENV_PREFIX)
            .from_env::<Self>()
            .context("failed to read GALLERY_FORCE_* build options")
    }

    /// True when any flag mandates reprocessing regardless of the diff.
    pub fn force_any(&self) -> bool {
        self.force_full_rescan || self.force_manifest_rebuild || self.force_thumbnail_rebuild
    }

    /// The prior manifest is ignored when a full rescan or a manifest rebuild is requested.
    pub fn ignores_prior_manifest(&self) -> bool {
        self.force_full_rescan || self.force_manifest_rebuild
    }

    pub fn worker_env(&self) -> BTreeMap<String, String> {
        [
            ("FORCE_FULL_RESCAN", self.force_full_rescan),
            ("FORCE_MANIFEST_REBUILD", self.force_manifest_rebuild),
            ("FORCE_THUMBNAIL_REBUILD", self.force_thumbnail_rebuild),
        ]
        .into_iter()
        .map(|(name, value)| (format!("{ENV_PREFIX}{name}"), value.to_string()))
        .collect()
    }
}

/// Environment seen by a process spawned by the cluster pool.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkerEnvironment {
    #[serde(default)]
    pub cluster_worker: bool,
    pub worker_id: Option<usize>,
    pub worker_concurrency: Option<usize>,
}

impl WorkerEnvironment {
    pub fn from_env() -> Result<Self> {
        envy::prefixed(ENV_PREFIX)
            .from_env::<Self>()
            .context("failed to read cluster worker environment")
    }

    pub fn is_cluster_worker(&self) -> bool {
        self.cluster_worker && self.worker_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_env_carries_force_flags() {
        let options = BuildOptions {
            force_thumbnail_rebuild: true,
            ..Default::default()
        };
        let env = options.worker_env();
        assert_eq!(env["GALLERY_FORCE_THUMBNAIL_REBUILD"], "true");
        assert_eq!(env["GALLERY_FORCE_FULL_RESCAN"], "false");

        let decoded: BuildOptions = envy::prefixed(ENV_PREFIX)
            .from_iter(env.into_iter())
            .unwrap();
        assert_eq!(decoded, options);
    }

    #[test]
    fn config_defaults_fill_missing_variables() {
        let config: BuilderConfig = envy::prefixed(ENV_PREFIX)
            .from_iter(vec![
                ("GALLERY_WORKER_CONCURRENCY".to_string(), "4".to_string()),
                ("GALLERY_CLUSTER_ENABLED".to_string(), "false".to_string()),
            ])
            .unwrap();
        assert_eq!(config.worker_concurrency, 4);
        assert!(!config.cluster_enabled);
        assert_eq!(config.thumbnail_size, 600);
        assert!(config.live_photo_detection);
    }

    #[test]
    fn worker_environment_requires_an_id() {
        let env: WorkerEnvironment = envy::prefixed(ENV_PREFIX)
            .from_iter(vec![("GALLERY_CLUSTER_WORKER".to_string(), "true".to_string())])
            .unwrap();
        assert!(!env.is_cluster_worker());
    }
}

use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::manifest::ManifestItem;
use super::storage_object::StorageObject;
use crate::config::BuilderConfig;

/// Immutable build input shared with every worker.
///
/// Encoded once with `bitcode` (maps and timestamps survive the trip) and sent
/// as a single `init` message; the receiving side wraps the decoded value in an
/// `Arc` and never mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedBuildSnapshot {
    existing_manifest_map: HashMap<String, ManifestItem>,
    live_photo_map: HashMap<String, StorageObject>,
    objects_to_process: Vec<StorageObject>,
    config: BuilderConfig,
}

impl SharedBuildSnapshot {
    pub fn new(
        existing_manifest_map: HashMap<String, ManifestItem>,
        live_photo_map: HashMap<String, StorageObject>,
        objects_to_process: Vec<StorageObject>,
        config: BuilderConfig,
    ) -> Self {
        Self {
            existing_manifest_map,
            live_photo_map,
            objects_to_process,
            config,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        bitcode::serialize(self).context("failed to encode shared build snapshot")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bitcode::deserialize(bytes).context("failed to decode shared build snapshot")
    }

    pub fn len(&self) -> usize {
        self.objects_to_process.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects_to_process.is_empty()
    }

    pub fn object(&self, index: usize) -> Option<&StorageObject> {
        self.objects_to_process.get(index)
    }

    pub fn objects(&self) -> &[StorageObject] {
        &self.objects_to_process
    }

    pub fn existing(&self, key: &str) -> Option<&ManifestItem> {
        self.existing_manifest_map.get(key)
    }

    pub fn existing_manifest_map(&self) -> &HashMap<String, ManifestItem> {
        &self.existing_manifest_map
    }

    pub fn live_photo(&self, key: &str) -> Option<&StorageObject> {
        self.live_photo_map.get(key)
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }
}

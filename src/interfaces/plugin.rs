use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Result;
use log::warn;

use crate::config::BuildOptions;
use crate::models::{BuildSummary, ExecutionMode, Manifest, ManifestItem, StorageObject, TaskOutcome};

/// Lifecycle events emitted by the builder, in emission order.
///
/// Only `BeforeAddManifestItem` hands out a mutable field; plugins observe
/// everything else and cannot change control flow.
#[derive(Debug)]
pub enum BuildEvent<'a> {
    BeforeBuild {
        options: &'a BuildOptions,
    },
    AfterManifestLoad {
        manifest: &'a Manifest,
    },
    AfterAllFilesListed {
        objects: &'a [StorageObject],
    },
    AfterLivePhotoDetection {
        live_photos: &'a HashMap<String, StorageObject>,
    },
    AfterImagesListed {
        images: &'a [StorageObject],
    },
    AfterTasksPrepared {
        tasks: &'a [StorageObject],
    },
    BeforeProcessTasks {
        total: usize,
        mode: ExecutionMode,
        concurrency: usize,
    },
    BeforeAddManifestItem {
        item: &'a mut ManifestItem,
        plugin_data: &'a BTreeMap<String, String>,
        retained: bool,
    },
    AfterProcessTasks {
        outcomes: &'a [TaskOutcome],
    },
    AfterCleanup {
        deleted_keys: &'a [String],
    },
    BeforeSaveManifest {
        manifest: &'a Manifest,
    },
    AfterSaveManifest {
        manifest: &'a Manifest,
    },
    AfterBuild {
        summary: &'a BuildSummary,
    },
    OnError {
        error: &'a anyhow::Error,
    },
}

impl BuildEvent<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            BuildEvent::BeforeBuild { .. } => "beforeBuild",
            BuildEvent::AfterManifestLoad { .. } => "afterManifestLoad",
            BuildEvent::AfterAllFilesListed { .. } => "afterAllFilesListed",
            BuildEvent::AfterLivePhotoDetection { .. } => "afterLivePhotoDetection",
            BuildEvent::AfterImagesListed { .. } => "afterImagesListed",
            BuildEvent::AfterTasksPrepared { .. } => "afterTasksPrepared",
            BuildEvent::BeforeProcessTasks { .. } => "beforeProcessTasks",
            BuildEvent::BeforeAddManifestItem { .. } => "beforeAddManifestItem",
            BuildEvent::AfterProcessTasks { .. } => "afterProcessTasks",
            BuildEvent::AfterCleanup { .. } => "afterCleanup",
            BuildEvent::BeforeSaveManifest { .. } => "beforeSaveManifest",
            BuildEvent::AfterSaveManifest { .. } => "afterSaveManifest",
            BuildEvent::AfterBuild { .. } => "afterBuild",
            BuildEvent::OnError { .. } => "onError",
        }
    }
}

pub trait BuildPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn on_event(&self, event: &mut BuildEvent<'_>) -> Result<()>;
}

/// Fire-and-forget dispatch: a failing plugin is logged and the next one runs.
#[derive(Default, Clone)]
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn BuildPlugin>>,
}

impl PluginRegistry {
    pub fn register(&mut self, plugin: Arc<dyn BuildPlugin>) {
        self.plugins.push(plugin);
    }

    pub fn emit(&self, mut event: BuildEvent<'_>) {
        for plugin in &self.plugins {
            if let Err(e) = plugin.on_event(&mut event) {
                warn!(
                    "plugin {} failed while handling {}: {:#}",
                    plugin.name(),
                    event.name(),
                    e
                );
            }
        }
    }
}

//! The build orchestrator: diff storage against the prior manifest, enrich
//! what changed on the right engine, and persist the merged result.

pub mod aggregate;
pub mod diff;


use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use anyhow::{Context, Result};
use log::{debug, info, warn};

use crate::background::cluster::launcher::WorkerLauncher;
use crate::background::{ClusterPool, ClusterPoolOptions, ProcessLauncher, TaskRunner, WorkerPool};
use crate::common::errors::handle_error;
use crate::config::{BuildOptions, BuilderConfig};
use crate::interfaces::{
    BuildEvent, BuildPlugin, ManifestStore, PluginRegistry, ProcessorFactory, ProgressListener, StorageProvider,
};
use crate::models::{
    BuildProgress, BuildSummary, ExecutionMode, MANIFEST_VERSION, Manifest, OutcomeKind, SharedBuildSnapshot,
    StorageObject, TaskOutcome,
};
use aggregate::{collect_cameras, collect_lenses, sort_items};
use diff::{find_deleted_keys, select_tasks, sort_by_size_desc};

/// Builds the storage provider from the builder configuration.
pub type StorageFactory = dyn Fn(&BuilderConfig) -> Result<Arc<dyn StorageProvider>> + Send + Sync;

/// Worker id reported to the processor for in-process tasks.
const IN_PROCESS_WORKER_ID: usize = 0;

/// Multi-process execution pays off only once every worker would get at
/// least this many tasks.
const CLUSTER_TASKS_PER_WORKER: usize = 2;

pub struct Builder {
    config: BuilderConfig,
    storage_factory: Arc<StorageFactory>,
    storage: OnceLock<Arc<dyn StorageProvider>>,
    manifest_store: Arc<dyn ManifestStore>,
    processors: Arc<dyn ProcessorFactory>,
    launcher: Option<Arc<dyn WorkerLauncher>>,
    plugins: PluginRegistry,
}

impl Builder {
    pub fn new<F>(
        config: BuilderConfig,
        storage_factory: F,
        manifest_store: Arc<dyn ManifestStore>,
        processors: Arc<dyn ProcessorFactory>,
    ) -> Self
    where
        F: Fn(&BuilderConfig) -> Result<Arc<dyn StorageProvider>> + Send + Sync + 'static,
    {
        Self {
            config,
            storage_factory: Arc::new(storage_factory),
            storage: OnceLock::new(),
            manifest_store,
            processors,
            launcher: None,
            plugins: PluginRegistry::default(),
        }
    }

    /// Start cluster workers through `launcher` instead of re-executing the
    /// current binary.
    pub fn with_worker_launcher(mut self, launcher: Arc<dyn WorkerLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn with_plugin(mut self, plugin: Arc<dyn BuildPlugin>) -> Self {
        self.plugins.register(plugin);
        self
    }

    /// Replace the storage factory. The current provider is dropped and the
    /// next build constructs a new one.
    pub fn register_storage_provider<F>(&mut self, storage_factory: F)
    where
        F: Fn(&BuilderConfig) -> Result<Arc<dyn StorageProvider>> + Send + Sync + 'static,
    {
        self.storage_factory = Arc::new(storage_factory);
        self.storage = OnceLock::new();
    }

    /// The long-lived storage provider, built on first use.
    pub fn storage_manager(&self) -> Result<Arc<dyn StorageProvider>> {
        if let Some(storage) = self.storage.get() {
            return Ok(storage.clone());
        }
        let storage = (self.storage_factory)(&self.config).context("failed to construct storage provider")?;
        Ok(self.storage.get_or_init(|| storage).clone())
    }

    pub async fn build(
        &self,
        options: BuildOptions,
        listener: Option<Arc<dyn ProgressListener>>,
    ) -> Result<BuildSummary> {
        let start_time = Instant::now();
        match self.run_build(&options, listener.as_deref()).await {
            Ok(summary) => {
                info!(
                    duration = &*format!("{:?}", start_time.elapsed());
                    "build finished: {} new, {} processed, {} skipped, {} failed, {} deleted, {} photos",
                    summary.new_count,
                    summary.processed_count,
                    summary.skipped_count,
                    summary.failed_count,
                    summary.deleted_count,
                    summary.total_photos
                );
                Ok(summary)
            }
            Err(error) => {
                if let Some(listener) = &listener {
                    listener.on_error(&error);
                }
                self.plugins.emit(BuildEvent::OnError { error: &error });
                Err(handle_error(error))
            }
        }
    }

    async fn run_build(
        &self,
        options: &BuildOptions,
        listener: Option<&dyn ProgressListener>,
    ) -> Result<BuildSummary> {
        self.plugins.emit(BuildEvent::BeforeBuild { options });

        // ────────────────────────────────────────────────────────────────
        // Load the prior manifest
        // ────────────────────────────────────────────────────────────────
        let manifest = if options.ignores_prior_manifest() {
            info!("ignoring the prior manifest");
            Manifest::empty()
        } else {
            let start_time = Instant::now();
            let manifest = self
                .manifest_store
                .load()
                .await
                .context("failed to load manifest")?;
            info!(
                duration = &*format!("{:?}", start_time.elapsed());
                "loaded manifest with {} items", manifest.items.len()
            );
            manifest
        };
        self.plugins.emit(BuildEvent::AfterManifestLoad { manifest: &manifest });
        let existing = manifest.item_map();

        // ────────────────────────────────────────────────────────────────
        // List storage and compute the task set
        // ────────────────────────────────────────────────────────────────
        let storage = self.storage_manager()?;
        let start_time = Instant::now();
        let on_listed = |count: usize| debug!("listed {count} files");
        let all_files = storage
            .list_all_files(Some(&on_listed))
            .await
            .context("failed to list storage")?;
        info!(
            duration = &*format!("{:?}", start_time.elapsed());
            "listed {} files", all_files.len()
        );
        self.plugins.emit(BuildEvent::AfterAllFilesListed { objects: &all_files });

        let live_photos: HashMap<String, StorageObject> = if self.config.live_photo_detection {
            storage.detect_paired_assets(&all_files)
        } else {
            HashMap::new()
        };
        self.plugins.emit(BuildEvent::AfterLivePhotoDetection {
            live_photos: &live_photos,
        });

        let images = storage.list_images().await.context("failed to list images")?;
        self.plugins.emit(BuildEvent::AfterImagesListed { images: &images });

        let mut tasks = select_tasks(&images, &existing, self.manifest_store.as_ref(), options);
        sort_by_size_desc(&mut tasks);
        self.plugins.emit(BuildEvent::AfterTasksPrepared { tasks: &tasks });

        let present: HashSet<&str> = all_files.iter().map(|object| object.key.as_str()).collect();
        let deleted_keys = find_deleted_keys(&existing, &present);
        info!(
            "{} of {} images need processing, {} records deleted",
            tasks.len(),
            images.len(),
            deleted_keys.len()
        );

        if tasks.is_empty() && deleted_keys.is_empty() {
            let summary = BuildSummary {
                total_photos: existing.len(),
                ..Default::default()
            };
            if let Some(listener) = listener {
                listener.on_complete(&summary);
            }
            self.plugins.emit(BuildEvent::AfterBuild { summary: &summary });
            return Ok(summary);
        }

        // ────────────────────────────────────────────────────────────────
        // Execute
        // ────────────────────────────────────────────────────────────────
        let total = tasks.len();
        let concurrency = options
            .concurrency_limit
            .unwrap_or(self.config.concurrency)
            .max(1);
        let mode = select_execution_mode(&self.config, total, concurrency);
        info!("processing {total} tasks {mode} with concurrency {concurrency}");
        if let Some(listener) = listener {
            listener.on_start(total, mode, concurrency);
        }
        self.plugins.emit(BuildEvent::BeforeProcessTasks {
            total,
            mode,
            concurrency,
        });

        let snapshot = Arc::new(SharedBuildSnapshot::new(
            existing,
            live_photos,
            tasks,
            self.config.clone(),
        ));

        let mut progress = BuildProgress::new(total);
        let on_settled = |index: usize, outcome: &TaskOutcome| {
            progress.record(outcome, snapshot.object(index).map(|object| object.key.as_str()));
            if let Some(listener) = listener {
                listener.on_progress(&progress);
            }
        };

        let start_time = Instant::now();
        let outcomes = match mode {
            ExecutionMode::InProcess => {
                self.run_in_process(snapshot.clone(), options, concurrency, on_settled)
                    .await?
            }
            ExecutionMode::Cluster => {
                self.run_cluster(snapshot.clone(), options, concurrency, on_settled)
                    .await?
            }
        };
        info!(
            duration = &*format!("{:?}", start_time.elapsed());
            "processed {} tasks", outcomes.len()
        );
        self.plugins.emit(BuildEvent::AfterProcessTasks { outcomes: &outcomes });

        // ────────────────────────────────────────────────────────────────
        // Merge into the new manifest
        // ────────────────────────────────────────────────────────────────
        let mut summary = BuildSummary {
            mode: Some(mode),
            ..Default::default()
        };
        let mut items = Vec::with_capacity(present.len());
        let task_keys: HashSet<&str> = snapshot.objects().iter().map(|object| object.key.as_str()).collect();

        for (index, outcome) in outcomes.into_iter().enumerate() {
            match outcome.kind {
                OutcomeKind::New => summary.new_count += 1,
                OutcomeKind::Processed => summary.processed_count += 1,
                OutcomeKind::Skipped => summary.skipped_count += 1,
                OutcomeKind::Failed => {
                    summary.failed_count += 1;
                    let key = snapshot.object(index).map_or("?", |object| object.key.as_str());
                    warn!(
                        "{key} failed and is left out of the manifest: {}",
                        outcome.error.as_deref().unwrap_or("unknown error")
                    );
                }
            }
            if let Some(mut item) = outcome.item {
                self.plugins.emit(BuildEvent::BeforeAddManifestItem {
                    item: &mut item,
                    plugin_data: &outcome.plugin_data,
                    retained: false,
                });
                items.push(item);
            }
        }

        let no_plugin_data = BTreeMap::new();
        let mut retained: Vec<_> = snapshot
            .existing_manifest_map()
            .values()
            .filter(|item| present.contains(item.key.as_str()) && !task_keys.contains(item.key.as_str()))
            .cloned()
            .collect();
        retained.sort_by(|a, b| a.key.cmp(&b.key));
        for mut item in retained {
            self.plugins.emit(BuildEvent::BeforeAddManifestItem {
                item: &mut item,
                plugin_data: &no_plugin_data,
                retained: true,
            });
            items.push(item);
        }

        summary.deleted_count = deleted_keys.len();
        self.plugins.emit(BuildEvent::AfterCleanup {
            deleted_keys: &deleted_keys,
        });

        sort_items(&mut items);
        let manifest = Manifest {
            version: MANIFEST_VERSION.to_string(),
            cameras: collect_cameras(&items),
            lenses: collect_lenses(&items),
            items,
        };

        // ────────────────────────────────────────────────────────────────
        // Persist
        // ────────────────────────────────────────────────────────────────
        self.plugins.emit(BuildEvent::BeforeSaveManifest { manifest: &manifest });
        self.manifest_store
            .save(&manifest.items, &manifest.cameras, &manifest.lenses)
            .await
            .context("failed to save manifest")?;
        self.plugins.emit(BuildEvent::AfterSaveManifest { manifest: &manifest });

        summary.total_photos = manifest.items.len();
        summary.has_updates = summary.new_count + summary.processed_count + summary.deleted_count > 0;
        if let Some(listener) = listener {
            listener.on_complete(&summary);
        }
        self.plugins.emit(BuildEvent::AfterBuild { summary: &summary });
        Ok(summary)
    }

    async fn run_in_process<S>(
        &self,
        snapshot: Arc<SharedBuildSnapshot>,
        options: &BuildOptions,
        concurrency: usize,
        mut on_settled: S,
    ) -> Result<Vec<TaskOutcome>>
    where
        S: FnMut(usize, &TaskOutcome),
    {
        let runner = TaskRunner::new(snapshot, self.processors.as_ref(), options.clone())?;
        let results = WorkerPool::new(concurrency)
            .execute(
                runner.total(),
                |index| runner.run(index, IN_PROCESS_WORKER_ID),
                |index, result| match result {
                    Ok(outcome) => on_settled(index, outcome),
                    Err(e) => on_settled(index, &TaskOutcome::failed(format!("{e:#}"))),
                },
            )
            .await;

        Ok(results
            .into_iter()
            .map(|result| result.unwrap_or_else(|e| TaskOutcome::failed(format!("{e:#}"))))
            .collect())
    }

    async fn run_cluster<S>(
        &self,
        snapshot: Arc<SharedBuildSnapshot>,
        options: &BuildOptions,
        concurrency: usize,
        on_settled: S,
    ) -> Result<Vec<TaskOutcome>>
    where
        S: FnMut(usize, &TaskOutcome),
    {
        let launcher: Arc<dyn WorkerLauncher> = match &self.launcher {
            Some(launcher) => launcher.clone(),
            None => Arc::new(ProcessLauncher::current_exe()?),
        };
        let pool_options = ClusterPoolOptions::new(concurrency, snapshot.len(), self.config.worker_concurrency)
            .with_worker_env(options.worker_env());

        ClusterPool::new(pool_options, snapshot, launcher)
            .execute(on_settled)
            .await
            .context("cluster execution failed")
    }
}

/// Multi-process only when enabled and the task count covers the fork cost.
pub fn select_execution_mode(config: &BuilderConfig, task_count: usize, concurrency: usize) -> ExecutionMode {
    if config.cluster_enabled && task_count > 0 && task_count >= CLUSTER_TASKS_PER_WORKER * concurrency {
        ExecutionMode::Cluster
    } else {
        ExecutionMode::InProcess
    }
}

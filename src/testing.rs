//! In-memory collaborators shared by the unit tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use futures::future::BoxFuture;
use tokio::task::JoinHandle;

use crate::background::cluster::launcher::{LaunchedWorker, WorkerLauncher, WorkerProcess};
use crate::background::cluster::run_worker;
use crate::config::BuildOptions;
use crate::interfaces::{
    BuildEvent, BuildPlugin, ListingProgress, ManifestStore, PhotoProcessor, ProcessInput, ProcessorFactory,
    ProgressListener, StorageProvider,
};
use crate::models::{
    BuildProgress, BuildSummary, CameraInfo, ExecutionMode, LensInfo, MANIFEST_VERSION, Manifest, ManifestItem,
    PhotoExif, SharedBuildSnapshot, StorageObject, TaskOutcome,
};
use crate::utils::{is_image_key, pair_live_photos};

// ────────────────────────────────────────────────────────────────
// Processor
// ────────────────────────────────────────────────────────────────

/// Builds a manifest item straight from the storage identity. Keys can be
/// configured to fail, to panic on their first attempt, or to always panic.
#[derive(Clone, Default)]
pub(crate) struct EchoProcessorFactory {
    fail: HashSet<String>,
    panic_once: HashSet<String>,
    panic_always: HashSet<String>,
    delay: Duration,
    create_error: Option<String>,
    panicked: Arc<Mutex<HashSet<String>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl EchoProcessorFactory {
    pub fn fail_on(mut self, key: &str) -> Self {
        self.fail.insert(key.to_string());
        self
    }

    pub fn panic_once_on(mut self, key: &str) -> Self {
        self.panic_once.insert(key.to_string());
        self
    }

    pub fn panic_always_on(mut self, key: &str) -> Self {
        self.panic_always.insert(key.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Every `create` call fails with `message`.
    pub fn fail_create(mut self, message: &str) -> Self {
        self.create_error = Some(message.to_string());
        self
    }

    /// Keys in the order processing started, across every worker.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl ProcessorFactory for EchoProcessorFactory {
    fn create(&self, _snapshot: &SharedBuildSnapshot) -> Result<Arc<dyn PhotoProcessor>> {
        if let Some(message) = &self.create_error {
            bail!("{message}");
        }
        Ok(Arc::new(self.clone()))
    }
}

impl EchoProcessorFactory {
    async fn echo(&self, input: ProcessInput<'_>) -> Result<TaskOutcome> {
        let key = input.object.key.as_str();
        self.calls.lock().unwrap().push(key.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if self.fail.contains(key) {
            bail!("cannot decode {key}");
        }
        if self.panic_always.contains(key) {
            panic!("decoder crashed on {key}");
        }
        if self.panic_once.contains(key) && self.panicked.lock().unwrap().insert(key.to_string()) {
            panic!("decoder crashed on {key}");
        }

        let mut item = ManifestItem::from_object(input.object);
        item.set_dimensions(4, 3);
        item.thumbnail_url = Some(format!("/thumbs/{key}"));
        item.tags = ManifestItem::tags_from_key(key);
        if key.contains("canon") {
            item.exif = Some(PhotoExif {
                make: Some("Canon".into()),
                model: Some("EOS R5".into()),
                lens_model: Some("RF 24-70mm".into()),
                ..Default::default()
            });
        }
        item.live_photo_video_key = input.live_photo.map(|video| video.key.clone());

        Ok(match input.existing {
            None => TaskOutcome::new(item),
            Some(_) => TaskOutcome::processed(item),
        }
        .with_plugin_data("worker", input.worker_id.to_string()))
    }
}

impl PhotoProcessor for EchoProcessorFactory {
    fn process<'a>(&'a self, input: ProcessInput<'a>) -> BoxFuture<'a, Result<TaskOutcome>> {
        Box::pin(self.echo(input))
    }
}

// ────────────────────────────────────────────────────────────────
// Worker launcher
// ────────────────────────────────────────────────────────────────

/// Runs each "process" as a tokio task speaking the real protocol over
/// in-memory pipes. A panicking task drops its pipes, which the pool sees as
/// an exit.
pub(crate) struct InProcessLauncher {
    factory: Arc<dyn ProcessorFactory>,
    options: BuildOptions,
    silent: bool,
    launches: AtomicUsize,
    envs: Mutex<Vec<BTreeMap<String, String>>>,
}

impl InProcessLauncher {
    pub fn new(factory: impl ProcessorFactory + 'static) -> Self {
        Self {
            factory: Arc::new(factory),
            options: BuildOptions::default(),
            silent: false,
            launches: AtomicUsize::new(0),
            envs: Mutex::new(Vec::new()),
        }
    }

    /// Workers that start but never say a word.
    pub fn silent() -> Self {
        Self {
            silent: true,
            ..Self::new(EchoProcessorFactory::default())
        }
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn envs(&self) -> Vec<BTreeMap<String, String>> {
        self.envs.lock().unwrap().clone()
    }
}

impl WorkerLauncher for InProcessLauncher {
    fn launch(&self, worker_id: usize, env: &BTreeMap<String, String>) -> Result<LaunchedWorker> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.envs.lock().unwrap().push(env.clone());

        let (parent_in, worker_in) = tokio::io::duplex(1 << 20);
        let (worker_out, parent_out) = tokio::io::duplex(1 << 20);

        let handle = if self.silent {
            tokio::spawn(async move {
                let _pipes = (worker_in, worker_out);
                std::future::pending::<()>().await;
                Ok(())
            })
        } else {
            tokio::spawn(run_worker(
                worker_in,
                worker_out,
                worker_id,
                self.factory.clone(),
                self.options.clone(),
            ))
        };

        Ok(LaunchedWorker {
            input: Box::new(parent_in),
            output: Box::new(parent_out),
            process: Box::new(TaskProcess::new(handle)),
        })
    }
}

/// A worker "process" that is really a tokio task.
pub(crate) struct TaskProcess {
    handle: JoinHandle<Result<()>>,
}

impl TaskProcess {
    pub fn new(handle: JoinHandle<Result<()>>) -> Self {
        Self { handle }
    }

    async fn join(&mut self) -> Result<String> {
        Ok(match (&mut self.handle).await {
            Ok(Ok(())) => "exited cleanly".to_string(),
            Ok(Err(e)) => format!("exited with error: {e:#}"),
            Err(e) => format!("task ended: {e}"),
        })
    }

    async fn abort(&mut self) -> Result<()> {
        self.handle.abort();
        let _ = (&mut self.handle).await;
        Ok(())
    }
}

impl WorkerProcess for TaskProcess {
    fn wait(&mut self) -> BoxFuture<'_, Result<String>> {
        Box::pin(self.join())
    }

    fn kill(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.abort())
    }
}

// ────────────────────────────────────────────────────────────────
// Storage and manifest
// ────────────────────────────────────────────────────────────────

#[derive(Default)]
pub(crate) struct MemoryStorage {
    objects: Mutex<Vec<StorageObject>>,
    fail_listing: AtomicBool,
}

impl MemoryStorage {
    pub fn with_objects(objects: Vec<StorageObject>) -> Self {
        Self {
            objects: Mutex::new(objects),
            fail_listing: AtomicBool::new(false),
        }
    }

    pub fn set_objects(&self, objects: Vec<StorageObject>) {
        *self.objects.lock().unwrap() = objects;
    }

    pub fn fail_listing(&self) {
        self.fail_listing.store(true, Ordering::SeqCst);
    }

    fn snapshot(&self) -> Result<Vec<StorageObject>> {
        if self.fail_listing.load(Ordering::SeqCst) {
            bail!("bucket is unreachable");
        }
        Ok(self.objects.lock().unwrap().clone())
    }
}

impl StorageProvider for MemoryStorage {
    fn list_all_files<'a>(
        &'a self,
        progress: Option<&'a ListingProgress<'a>>,
    ) -> BoxFuture<'a, Result<Vec<StorageObject>>> {
        let listed = self.snapshot();
        if let (Ok(objects), Some(progress)) = (&listed, progress) {
            progress(objects.len());
        }
        Box::pin(async move { listed })
    }

    fn list_images(&self) -> BoxFuture<'_, Result<Vec<StorageObject>>> {
        let listed = self
            .snapshot()
            .map(|objects| objects.into_iter().filter(|o| is_image_key(&o.key)).collect());
        Box::pin(async move { listed })
    }

    fn detect_paired_assets(&self, objects: &[StorageObject]) -> HashMap<String, StorageObject> {
        pair_live_photos(objects)
    }

    fn get_file<'a>(&'a self, _key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
        Box::pin(async { Ok(None) })
    }
}

pub(crate) struct MemoryManifestStore {
    manifest: Mutex<Manifest>,
    saves: AtomicUsize,
    fail_save: AtomicBool,
}

impl MemoryManifestStore {
    pub fn new(manifest: Manifest) -> Self {
        Self {
            manifest: Mutex::new(manifest),
            saves: AtomicUsize::new(0),
            fail_save: AtomicBool::new(false),
        }
    }

    pub fn manifest(&self) -> Manifest {
        self.manifest.lock().unwrap().clone()
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn fail_save(&self) {
        self.fail_save.store(true, Ordering::SeqCst);
    }
}

impl Default for MemoryManifestStore {
    fn default() -> Self {
        Self::new(Manifest::empty())
    }
}

impl ManifestStore for MemoryManifestStore {
    fn load(&self) -> BoxFuture<'_, Result<Manifest>> {
        let manifest = self.manifest();
        Box::pin(async move { Ok(manifest) })
    }

    fn save<'a>(
        &'a self,
        items: &'a [ManifestItem],
        cameras: &'a [CameraInfo],
        lenses: &'a [LensInfo],
    ) -> BoxFuture<'a, Result<()>> {
        let saved = if self.fail_save.load(Ordering::SeqCst) {
            Err(anyhow::anyhow!("disk full"))
        } else {
            *self.manifest.lock().unwrap() = Manifest {
                version: MANIFEST_VERSION.to_string(),
                items: items.to_vec(),
                cameras: cameras.to_vec(),
                lenses: lenses.to_vec(),
            };
            self.saves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        };
        Box::pin(async move { saved })
    }
}

// ────────────────────────────────────────────────────────────────
// Observers
// ────────────────────────────────────────────────────────────────

#[derive(Default)]
pub(crate) struct RecordingListener {
    pub starts: Mutex<Vec<(usize, ExecutionMode, usize)>>,
    pub progress: Mutex<Vec<BuildProgress>>,
    pub completed: Mutex<Option<BuildSummary>>,
    pub errors: Mutex<Vec<String>>,
}

impl ProgressListener for RecordingListener {
    fn on_start(&self, total: usize, mode: ExecutionMode, concurrency: usize) {
        self.starts.lock().unwrap().push((total, mode, concurrency));
    }

    fn on_progress(&self, progress: &BuildProgress) {
        self.progress.lock().unwrap().push(progress.clone());
    }

    fn on_complete(&self, summary: &BuildSummary) {
        *self.completed.lock().unwrap() = Some(summary.clone());
    }

    fn on_error(&self, error: &anyhow::Error) {
        self.errors.lock().unwrap().push(format!("{error:#}"));
    }
}

/// Records event names and rewrites thumbnail URLs onto a CDN host.
#[derive(Default)]
pub(crate) struct RecordingPlugin {
    pub events: Mutex<Vec<&'static str>>,
}

impl BuildPlugin for RecordingPlugin {
    fn name(&self) -> &str {
        "recording"
    }

    fn on_event(&self, event: &mut BuildEvent<'_>) -> Result<()> {
        self.events.lock().unwrap().push(event.name());
        if let BuildEvent::BeforeAddManifestItem { item, .. } = event {
            item.thumbnail_url = Some(format!("https://cdn.test/{}", item.key));
        }
        Ok(())
    }
}

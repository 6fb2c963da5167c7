use std::sync::Arc;

use anyhow::Result;
use futures::future::BoxFuture;

use crate::config::{BuildOptions, BuilderConfig};
use crate::models::{ManifestItem, SharedBuildSnapshot, StorageObject, TaskOutcome};

/// Everything the per-item processor may look at for one task.
#[derive(Debug, Clone, Copy)]
pub struct ProcessInput<'a> {
    pub index: usize,
    pub worker_id: usize,
    pub object: &'a StorageObject,
    pub existing: Option<&'a ManifestItem>,
    pub live_photo: Option<&'a StorageObject>,
    pub options: &'a BuildOptions,
    pub config: &'a BuilderConfig,
}

/// Enriches one raw storage object into a manifest record.
///
/// An `Err` is a per-task failure. A panic is treated as a fault of the
/// hosting process by the cluster worker runtime.
pub trait PhotoProcessor: Send + Sync {
    fn process<'a>(&'a self, input: ProcessInput<'a>) -> BoxFuture<'a, Result<TaskOutcome>>;
}

/// Builds a processor from the shared snapshot. Called once in-process, and
/// once inside every worker process after `init`.
pub trait ProcessorFactory: Send + Sync {
    fn create(&self, snapshot: &SharedBuildSnapshot) -> Result<Arc<dyn PhotoProcessor>>;
}

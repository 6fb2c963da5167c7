use std::sync::Arc;

use anyhow::{Context, Result, anyhow};

use crate::config::BuildOptions;
use crate::interfaces::{PhotoProcessor, ProcessInput, ProcessorFactory};
use crate::models::{SharedBuildSnapshot, TaskOutcome};

/// The local orchestrator: resolves a task index against the shared snapshot
/// and hands the object to the per-item processor.
///
/// The builder owns one for in-process execution; every cluster worker builds
/// its own after `init`. Cloning is cheap.
#[derive(Clone)]
pub struct TaskRunner {
    snapshot: Arc<SharedBuildSnapshot>,
    processor: Arc<dyn PhotoProcessor>,
    options: Arc<BuildOptions>,
}

impl TaskRunner {
    pub fn new(
        snapshot: Arc<SharedBuildSnapshot>,
        factory: &dyn ProcessorFactory,
        options: BuildOptions,
    ) -> Result<Self> {
        let processor = factory
            .create(&snapshot)
            .context("failed to construct per-item processor")?;
        Ok(Self {
            snapshot,
            processor,
            options: Arc::new(options),
        })
    }

    pub fn total(&self) -> usize {
        self.snapshot.len()
    }

    pub async fn run(&self, index: usize, worker_id: usize) -> Result<TaskOutcome> {
        let object = self
            .snapshot
            .object(index)
            .ok_or_else(|| anyhow!("task index {index} is out of range"))?;

        let input = ProcessInput {
            index,
            worker_id,
            object,
            existing: self.snapshot.existing(&object.key),
            live_photo: self.snapshot.live_photo(&object.key),
            options: &self.options,
            config: self.snapshot.config(),
        };

        self.processor
            .process(input)
            .await
            .with_context(|| format!("failed to process {}", object.key))
    }
}

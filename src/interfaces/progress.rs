use crate::models::{BuildProgress, BuildSummary, ExecutionMode};

/// Observer for a single build. Every method defaults to a no-op.
pub trait ProgressListener: Send + Sync {
    fn on_start(&self, _total: usize, _mode: ExecutionMode, _concurrency: usize) {}

    /// Delivered in completion order, once per settled task.
    fn on_progress(&self, _progress: &BuildProgress) {}

    fn on_complete(&self, _summary: &BuildSummary) {}

    fn on_error(&self, _error: &anyhow::Error) {}
}

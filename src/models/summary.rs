use std::fmt;

use serde::{Deserialize, Serialize};

use super::outcome::{OutcomeKind, TaskOutcome};

/// Which engine executed the task set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    InProcess,
    Cluster,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::InProcess => f.write_str("in-process"),
            ExecutionMode::Cluster => f.write_str("cluster"),
        }
    }
}

/// Snapshot handed to `ProgressListener::on_progress` after every settled task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildProgress {
    pub total: usize,
    pub completed: usize,
    pub new_count: usize,
    pub processed_count: usize,
    pub skipped_count: usize,
    pub failed_count: usize,
    pub current_key: Option<String>,
}

impl BuildProgress {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    pub fn record(&mut self, outcome: &TaskOutcome, key: Option<&str>) {
        self.completed += 1;
        match outcome.kind {
            OutcomeKind::New => self.new_count += 1,
            OutcomeKind::Processed => self.processed_count += 1,
            OutcomeKind::Skipped => self.skipped_count += 1,
            OutcomeKind::Failed => self.failed_count += 1,
        }
        self.current_key = key.map(str::to_string);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSummary {
    pub has_updates: bool,
    pub new_count: usize,
    pub processed_count: usize,
    pub skipped_count: usize,
    pub failed_count: usize,
    pub deleted_count: usize,
    pub total_photos: usize,
    /// Engine that ran the task set; `None` when nothing needed processing.
    pub mode: Option<ExecutionMode>,
}

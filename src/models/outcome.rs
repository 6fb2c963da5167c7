use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::manifest::ManifestItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeKind {
    New,
    Processed,
    Skipped,
    Failed,
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutcomeKind::New => "new",
            OutcomeKind::Processed => "processed",
            OutcomeKind::Skipped => "skipped",
            OutcomeKind::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Result of one task. Failed outcomes never carry an item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutcome {
    pub item: Option<ManifestItem>,
    pub kind: OutcomeKind,
    #[serde(default)]
    pub plugin_data: BTreeMap<String, String>,
    pub error: Option<String>,
}

impl TaskOutcome {
    fn with_item(item: ManifestItem, kind: OutcomeKind) -> Self {
        Self {
            item: Some(item),
            kind,
            plugin_data: BTreeMap::new(),
            error: None,
        }
    }

    pub fn new(item: ManifestItem) -> Self {
        Self::with_item(item, OutcomeKind::New)
    }

    pub fn processed(item: ManifestItem) -> Self {
        Self::with_item(item, OutcomeKind::Processed)
    }

    pub fn skipped(item: ManifestItem) -> Self {
        Self::with_item(item, OutcomeKind::Skipped)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            item: None,
            kind: OutcomeKind::Failed,
            plugin_data: BTreeMap::new(),
            error: Some(message.into()),
        }
    }

    pub fn with_plugin_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.plugin_data.insert(key.into(), value.into());
        self
    }

    pub fn is_failed(&self) -> bool {
        self.kind == OutcomeKind::Failed
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Raw identity of one stored file, recreated on every listing call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageObject {
    pub key: String,
    pub size: Option<u64>,
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
}

impl StorageObject {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            size: None,
            last_modified: None,
            etag: None,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_last_modified(mut self, last_modified: DateTime<Utc>) -> Self {
        self.last_modified = Some(last_modified);
        self
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    pub fn size_or_zero(&self) -> u64 {
        self.size.unwrap_or(0)
    }

    /// Key without its extension, used to pair a still image with its motion clip.
    pub fn stem(&self) -> &str {
        match self.key.rfind('.') {
            Some(idx) if idx > self.key.rfind('/').map_or(0, |slash| slash + 1) => {
                &self.key[..idx]
            }
            _ => &self.key,
        }
    }
}

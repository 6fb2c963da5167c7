//! Seams to the collaborators the builder consumes but does not own:
//! storage, manifest persistence, per-item processing, plugins and progress.

pub mod manifest_store;
pub mod plugin;
pub mod processor;
pub mod progress;
pub mod storage;

pub use manifest_store::{ManifestStore, signature_changed};
pub use plugin::{BuildEvent, BuildPlugin, PluginRegistry};
pub use processor::{PhotoProcessor, ProcessInput, ProcessorFactory};
pub use progress::ProgressListener;
pub use storage::{ListingProgress, StorageProvider};

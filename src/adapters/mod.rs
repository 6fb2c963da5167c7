//! Filesystem-backed implementations of the storage and manifest seams.

pub mod json_store;
pub mod local_storage;

pub use json_store::JsonManifestStore;
pub use local_storage::LocalStorage;

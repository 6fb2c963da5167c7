pub mod manifest;
pub mod outcome;
pub mod snapshot;
pub mod storage_object;
pub mod summary;

pub use manifest::{CameraInfo, LensInfo, MANIFEST_VERSION, Manifest, ManifestItem, PhotoExif};
pub use outcome::{OutcomeKind, TaskOutcome};
pub use snapshot::SharedBuildSnapshot;
pub use storage_object::StorageObject;
pub use summary::{BuildProgress, BuildSummary, ExecutionMode};

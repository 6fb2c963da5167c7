pub mod errors;

use std::sync::LazyLock;
use std::time::Duration;

use tokio::runtime::{Builder, Runtime};

pub const ENV_PREFIX: &str = "GALLERY_";

pub const WORKER_ID_ENV: &str = "GALLERY_WORKER_ID";

pub const CLUSTER_WORKER_ENV: &str = "GALLERY_CLUSTER_WORKER";

pub const WORKER_CONCURRENCY_ENV: &str = "GALLERY_WORKER_CONCURRENCY";

pub const WORKER_START_TIMEOUT: Duration = Duration::from_secs(10);

pub const WORKER_RESPAWN_DELAY: Duration = Duration::from_millis(1000);

pub const WORKER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub const MAX_WORKER_RESTARTS: usize = 32;

pub const WORKER_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Upper bound for a single wire frame; the shared snapshot is the largest message.
pub const MAX_FRAME_LEN: u32 = 512 * 1024 * 1024;

pub const VALID_IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "jfif", "jpe", "png", "tif", "tiff", "webp", "bmp", "heic", "heif",
];

pub const VALID_LIVE_PHOTO_EXTENSIONS: &[&str] = &["mov", "mp4"];

pub static CURRENT_NUM_THREADS: LazyLock<usize> = LazyLock::new(|| {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
});

// Build-specific Tokio Runtime
// Drives the orchestrator, the cluster supervisor and, inside worker processes, the message loop.
pub static BUILD_RUNTIME: LazyLock<Runtime> = LazyLock::new(|| {
    Builder::new_multi_thread()
        .worker_threads(*CURRENT_NUM_THREADS)
        .thread_name("manifest-build-worker")
        .enable_all()
        .build()
        .expect("Failed to build manifest Tokio runtime")
});

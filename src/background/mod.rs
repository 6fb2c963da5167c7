pub mod cluster;
pub mod runner;
pub mod worker_pool;

pub use cluster::{ClusterPool, ClusterPoolOptions, ProcessLauncher, WorkerState};
pub use runner::TaskRunner;
pub use worker_pool::WorkerPool;

use std::io::IsTerminal;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::info;

use gallery_manifest::Builder;
use gallery_manifest::adapters::{JsonManifestStore, LocalStorage};
use gallery_manifest::background::cluster::serve_stdio;
use gallery_manifest::bootstrap::{initialize_folder, initialize_logger};
use gallery_manifest::cli::{TerminalProgress, render_summary};
use gallery_manifest::common::BUILD_RUNTIME;
use gallery_manifest::common::errors::handle_error;
use gallery_manifest::config::{BuildOptions, BuilderConfig, WorkerEnvironment};
use gallery_manifest::interfaces::StorageProvider;
use gallery_manifest::operations::indexation::PhotoIndexerFactory;

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let environment = WorkerEnvironment::from_env()?;

    // Cluster workers are this same binary, re-executed with the worker
    // environment set; stdout then belongs to the wire protocol.
    match environment.worker_id.filter(|_| environment.is_cluster_worker()) {
        Some(worker_id) => {
            initialize_logger(Some(worker_id));
            BUILD_RUNTIME.block_on(run_worker_process(worker_id))
        }
        None => {
            initialize_logger(None);
            BUILD_RUNTIME.block_on(run_build())
        }
    }
}

async fn run_worker_process(worker_id: usize) -> Result<()> {
    let options = BuildOptions::from_env()?;
    serve_stdio(worker_id, Arc::new(PhotoIndexerFactory), options)
        .await
        .map_err(handle_error)
}

async fn run_build() -> Result<()> {
    let config = BuilderConfig::from_env()?;
    let options = BuildOptions::from_env()?;
    initialize_folder(&config).context("failed to prepare output folders")?;
    info!(
        "building {} from {}",
        config.manifest_path.display(),
        config.storage_root.display()
    );

    let manifest_store = Arc::new(JsonManifestStore::from_config(&config));
    let builder = Builder::new(
        config,
        |config: &BuilderConfig| Ok(Arc::new(LocalStorage::from_config(config)) as Arc<dyn StorageProvider>),
        manifest_store,
        Arc::new(PhotoIndexerFactory),
    );

    let summary = builder
        .build(options, Some(Arc::new(TerminalProgress::new())))
        .await?;
    println!("{}", render_summary(&summary, std::io::stdout().is_terminal()));
    Ok(())
}

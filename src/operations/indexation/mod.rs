//! Indexation - turns one stored photo into a manifest record
//!
//! Includes:
//! - EXIF extraction
//! - Orientation correction
//! - Thumbnail and thumbhash generation

pub mod fix_orientation;
pub mod generate_exif;
pub mod generate_thumbnail;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use image::DynamicImage;
use log::debug;

use crate::adapters::LocalStorage;
use crate::config::BuilderConfig;
use crate::interfaces::{PhotoProcessor, ProcessInput, ProcessorFactory, StorageProvider, signature_changed};
use crate::models::{ManifestItem, PhotoExif, SharedBuildSnapshot, TaskOutcome};
use crate::utils::thumbnail_file_name;

use fix_orientation::{fix_image_orientation, fix_image_width_height};
use generate_exif::generate_exif;
use generate_thumbnail::{generate_thumbhash, generate_thumbnail};

/// Creates a [`PhotoIndexer`] reading from the configured storage root.
#[derive(Debug, Clone, Default)]
pub struct PhotoIndexerFactory;

impl ProcessorFactory for PhotoIndexerFactory {
    fn create(&self, snapshot: &SharedBuildSnapshot) -> Result<Arc<dyn PhotoProcessor>> {
        let config = snapshot.config();
        Ok(Arc::new(PhotoIndexer::new(
            Arc::new(LocalStorage::from_config(config)),
            config,
        )))
    }
}

pub struct PhotoIndexer {
    storage: Arc<dyn StorageProvider>,
    thumbnail_dir: PathBuf,
    thumbnail_url_prefix: String,
    thumbnail_size: u32,
    live_photo_detection: bool,
}

/// What the blocking half of the pipeline learns from the file.
struct ImageAnalysis {
    width: u32,
    height: u32,
    exif: Option<PhotoExif>,
    date_taken: Option<DateTime<Utc>>,
    thumbhash: Vec<u8>,
}

impl PhotoIndexer {
    pub fn new(storage: Arc<dyn StorageProvider>, config: &BuilderConfig) -> Self {
        Self {
            storage,
            thumbnail_dir: config.thumbnail_dir.clone(),
            thumbnail_url_prefix: config.thumbnail_url_prefix.trim_end_matches('/').to_string(),
            thumbnail_size: config.thumbnail_size,
            live_photo_detection: config.live_photo_detection,
        }
    }

    async fn index(&self, input: ProcessInput<'_>) -> Result<TaskOutcome> {
        let key = input.object.key.as_str();
        let thumbnail_name = thumbnail_file_name(key);
        let thumbnail_path = self.thumbnail_dir.join(&thumbnail_name);

        if let Some(existing) = input.existing {
            let current = !input.options.force_any()
                && !signature_changed(existing, input.object)
                && existing.thumbnail_url.is_some()
                && thumbnail_path.is_file();
            if current {
                return Ok(TaskOutcome::skipped(existing.clone()));
            }
        }

        let start_time = Instant::now();
        let bytes = self
            .storage
            .get_file(key)
            .await?
            .ok_or_else(|| anyhow!("{key} is no longer in storage"))?;

        let max_side = self.thumbnail_size;
        let analysis = tokio::task::spawn_blocking(move || analyse_image(&bytes, &thumbnail_path, max_side))
            .await
            .map_err(|e| anyhow!("image analysis panicked: {e}"))?
            .with_context(|| format!("failed to index {key}"))?;

        let mut item = ManifestItem::from_object(input.object);
        item.set_dimensions(analysis.width, analysis.height);
        item.thumbnail_url = Some(format!("{}/{}", self.thumbnail_url_prefix, thumbnail_name));
        item.thumbhash = Some(analysis.thumbhash);
        item.date_taken = analysis.date_taken;
        item.exif = analysis.exif;
        item.tags = ManifestItem::tags_from_key(key);
        if self.live_photo_detection {
            item.live_photo_video_key = input.live_photo.map(|video| video.key.clone());
        }

        debug!(
            duration = &*format!("{:?}", start_time.elapsed());
            "worker {} indexed {key}", input.worker_id
        );

        Ok(match input.existing {
            None => TaskOutcome::new(item),
            Some(_) => TaskOutcome::processed(item),
        })
    }
}

impl PhotoProcessor for PhotoIndexer {
    fn process<'a>(&'a self, input: ProcessInput<'a>) -> BoxFuture<'a, Result<TaskOutcome>> {
        Box::pin(self.index(input))
    }
}

fn analyse_image(bytes: &[u8], thumbnail_path: &Path, max_side: u32) -> Result<ImageAnalysis> {
    // EXIF metadata extraction (non-fallible)
    let exif = generate_exif(bytes);
    let orientation = exif.as_ref().and_then(|summary| summary.orientation);

    let mut dynamic_image = decode_image(bytes)?;

    let (mut width, mut height) = (dynamic_image.width(), dynamic_image.height());
    fix_image_width_height(orientation, &mut width, &mut height);
    fix_image_orientation(orientation, &mut dynamic_image);

    let thumbhash = generate_thumbhash(&dynamic_image);
    generate_thumbnail(&dynamic_image, thumbnail_path, max_side)
        .context("failed to generate JPEG thumbnail for image")?;

    Ok(ImageAnalysis {
        width,
        height,
        date_taken: exif.as_ref().and_then(|summary| summary.date_taken()),
        exif: exif.map(|summary| summary.exif),
        thumbhash,
    })
}

fn decode_image(bytes: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory(bytes).context("image crate failed to decode image from memory")
}

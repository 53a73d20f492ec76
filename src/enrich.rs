//! Image enrichment.
//!
//! Walks `<image_root>/<channel>/`, runs the configured [`Detector`] on every
//! image, and for each channel:
//!
//! 1. writes `<predictions_dir>/<channel>.json` (atomically replaced),
//! 2. records the run against every processed image in `raw_detection_runs`
//!    and appends one `raw_detections` row per accepted box.
//!
//! Failures are isolated per image and per channel. A bad image is recorded
//! in the [`BatchReport`] and skipped; a channel that cannot be processed is
//! recorded and the next channel proceeds. Images are processed one at a
//! time.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::Config;
use crate::db;
use crate::detect::{self, accept_detections, categorize, Detector, ImageInput};
use crate::files;
use crate::loader::insert_prediction;
use crate::manifest::{resolve_message_id, ImageManifest, MANIFEST_FILE};
use crate::models::ImagePrediction;
use crate::progress::{EnrichProgressEvent, ProgressMode, ProgressReporter};
use crate::report::{BatchReport, UnitOutcome};

pub async fn run_enrich(config: &Config, progress: Option<ProgressMode>) -> Result<()> {
    let detector = detect::create_detector(&config.enrichment)?;
    let reporter = progress.unwrap_or_else(ProgressMode::default_for_tty);
    let run_id = uuid::Uuid::new_v4().to_string();

    let pool = db::connect(config).await?;
    let result = enrich_images(config, &pool, detector.as_ref(), &reporter, &run_id).await;
    pool.close().await;
    let report = result?;

    let saved = report.save(&config.paths.reports_dir)?;
    report.print_summary();
    println!("  report: {}", saved.display());
    println!("ok");
    Ok(())
}

/// Runs the detector over every channel directory under the image root.
pub async fn enrich_images(
    config: &Config,
    pool: &SqlitePool,
    detector: &dyn Detector,
    progress: &dyn ProgressReporter,
    run_id: &str,
) -> Result<BatchReport> {
    let root = &config.paths.image_root;
    if !root.is_dir() {
        bail!("Image root does not exist: {}", root.display());
    }

    let include_set = build_globset(&config.enrichment.include_globs)?;

    let mut channels: Vec<PathBuf> = std::fs::read_dir(root)
        .with_context(|| format!("Failed to read image root: {}", root.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_dir())
        .collect();
    channels.sort();

    tracing::info!(detector = detector.name(), channels = channels.len(), %run_id, "enrichment started");

    let mut report = BatchReport::new("enrich", run_id);
    for channel_dir in &channels {
        let channel = channel_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        match enrich_channel(
            config,
            pool,
            detector,
            progress,
            &include_set,
            &channel,
            channel_dir,
            run_id,
            &mut report,
        )
        .await
        {
            Ok(rows) => tracing::info!(%channel, rows, "channel enriched"),
            Err(e) => report.record(UnitOutcome::failed(&channel, format!("{:#}", e))),
        }
    }

    report.finish();
    Ok(report)
}

#[allow(clippy::too_many_arguments)]
async fn enrich_channel(
    config: &Config,
    pool: &SqlitePool,
    detector: &dyn Detector,
    progress: &dyn ProgressReporter,
    include_set: &GlobSet,
    channel: &str,
    channel_dir: &Path,
    run_id: &str,
    report: &mut BatchReport,
) -> Result<u64> {
    let manifest = ImageManifest::load(channel_dir)?;
    let images = list_images(channel_dir, include_set)?;
    let total = images.len() as u64;
    progress.report(EnrichProgressEvent::ChannelStarted {
        channel: channel.to_string(),
        images: total,
    });

    let mut predictions = Vec::new();
    for (i, path) in images.iter().enumerate() {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let unit = format!("{}/{}", channel, file_name);

        let ok = match detect_image(config, detector, manifest.as_ref(), channel, path).await {
            Ok(prediction) => {
                report.record(UnitOutcome::succeeded(
                    &unit,
                    prediction.detections.len() as u64,
                ));
                predictions.push(prediction);
                true
            }
            Err(reason) => {
                report.record(UnitOutcome::failed(&unit, reason));
                false
            }
        };

        progress.report(EnrichProgressEvent::ImageDone {
            channel: channel.to_string(),
            file_name,
            n: i as u64 + 1,
            total,
            ok,
        });
    }

    let out = config.paths.predictions_dir.join(format!("{}.json", channel));
    files::write_json_atomic(&out, &predictions)?;

    let mut rows = 0u64;
    let mut tx = pool.begin().await?;
    for prediction in &predictions {
        rows += insert_prediction(&mut tx, channel, prediction, run_id).await?;
    }
    tx.commit().await?;

    Ok(rows)
}

/// Processes one image. The error is the reason recorded for it.
async fn detect_image(
    config: &Config,
    detector: &dyn Detector,
    manifest: Option<&ImageManifest>,
    channel: &str,
    path: &Path,
) -> std::result::Result<ImagePrediction, String> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let message_id = resolve_message_id(manifest, &file_name)?;

    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| format!("unreadable image: {}", e))?;
    let digest = format!("{:x}", Sha256::digest(&bytes));

    let input = ImageInput {
        channel,
        path,
        bytes: &bytes,
    };
    let raw = detector
        .detect(&input)
        .await
        .map_err(|e| format!("detector failed: {:#}", e))?;

    let categories = &config.enrichment.categories;
    let detections = accept_detections(raw, config.enrichment.min_confidence, categories)
        .map_err(|e| format!("invalid detection: {:#}", e))?;
    let category = categorize(&detections, categories);

    Ok(ImagePrediction {
        file_name,
        message_id,
        image_sha256: Some(digest),
        image_category: category.as_str().to_string(),
        detections,
    })
}

fn list_images(channel_dir: &Path, include_set: &GlobSet) -> Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    for entry in WalkDir::new(channel_dir).min_depth(1) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(channel_dir).unwrap_or(path);
        let rel_str = relative.to_string_lossy().to_string();

        if rel_str == MANIFEST_FILE || !include_set.is_match(&rel_str) {
            continue;
        }
        images.push(path.to_path_buf());
    }

    // Sort for deterministic ordering
    images.sort();
    Ok(images)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

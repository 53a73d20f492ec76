//! Image → message mapping.
//!
//! Each channel directory under the image root may carry a `manifest.json`
//! listing which message every downloaded image belongs to:
//!
//! ```json
//! [{ "message_id": 11, "file_name": "11.jpg", "message_date": "2024-01-01T08:00:00Z" }]
//! ```
//!
//! Enrichment resolves message ids from the manifest first. Images missing
//! from it fall back to the filename convention (`11.jpg`, `CheMed123_11.jpg`);
//! a name that does not follow the convention is an error for that image,
//! never a guessed id.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::files;

pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub message_id: i64,
    pub file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_date: Option<String>,
}

#[derive(Debug, Default)]
pub struct ImageManifest {
    by_file: HashMap<String, i64>,
}

impl ImageManifest {
    /// Reads `<channel_dir>/manifest.json`. Returns `None` when the channel
    /// has no manifest.
    pub fn load(channel_dir: &Path) -> Result<Option<Self>> {
        let path = channel_dir.join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read manifest: {}", path.display()))?;
        let entries: Vec<ManifestEntry> = serde_json::from_str(&content)
            .with_context(|| format!("Invalid manifest: {}", path.display()))?;
        Ok(Some(Self::from_entries(&entries)))
    }

    pub fn from_entries(entries: &[ManifestEntry]) -> Self {
        Self {
            by_file: entries
                .iter()
                .map(|e| (e.file_name.clone(), e.message_id))
                .collect(),
        }
    }

    pub fn message_id(&self, file_name: &str) -> Option<i64> {
        self.by_file.get(file_name).copied()
    }

    pub fn len(&self) -> usize {
        self.by_file.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_file.is_empty()
    }
}

/// Resolves the message an image belongs to.
///
/// The error string is the reason recorded in the batch report.
pub fn resolve_message_id(
    manifest: Option<&ImageManifest>,
    file_name: &str,
) -> std::result::Result<i64, String> {
    if let Some(id) = manifest.and_then(|m| m.message_id(file_name)) {
        return Ok(id);
    }
    message_id_from_file_name(file_name)
}

/// `11.jpg` and `CheMed123_11.jpg` both map to message 11.
pub fn message_id_from_file_name(file_name: &str) -> std::result::Result<i64, String> {
    let stem = Path::new(file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();

    let candidate = stem.rsplit('_').next().unwrap_or("");
    if candidate.is_empty() || !candidate.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!(
            "no manifest entry and file name '{}' does not end in a numeric message id",
            file_name
        ));
    }
    candidate
        .parse::<i64>()
        .map_err(|e| format!("message id in '{}' out of range: {}", file_name, e))
}

/// Scraper metadata record as written per channel by the image downloader.
#[derive(Debug, Deserialize)]
struct DownloadRecord {
    id: i64,
    #[serde(default)]
    date: Option<String>,
    image_path: String,
}

/// Builds channel manifests from the downloader's per-channel metadata files
/// (`<metadata_dir>/<channel>.json`). Returns the channels written.
pub fn build_manifests(metadata_dir: &Path, image_root: &Path) -> Result<Vec<(String, usize)>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(metadata_dir)
        .with_context(|| format!("Failed to read {}", metadata_dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().map(|e| e == "json").unwrap_or(false))
        .collect();
    files.sort();

    let mut written = Vec::new();
    for file in files {
        let channel = file
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let content = std::fs::read_to_string(&file)?;
        let records: Vec<DownloadRecord> = serde_json::from_str(&content)
            .with_context(|| format!("Invalid download metadata: {}", file.display()))?;

        let entries: Vec<ManifestEntry> = records
            .into_iter()
            .filter_map(|r| {
                let file_name = Path::new(&r.image_path)
                    .file_name()?
                    .to_string_lossy()
                    .to_string();
                Some(ManifestEntry {
                    message_id: r.id,
                    file_name,
                    message_date: r.date,
                })
            })
            .collect();

        let path = image_root.join(&channel).join(MANIFEST_FILE);
        files::write_json_atomic(&path, &entries)?;
        written.push((channel, entries.len()));
    }
    Ok(written)
}

pub fn run_build_manifests(config: &Config, metadata_dir: &Path) -> Result<()> {
    let written = build_manifests(metadata_dir, &config.paths.image_root)?;
    println!("manifest {}", metadata_dir.display());
    for (channel, count) in &written {
        println!("  {}: {} images", channel, count);
    }
    println!("ok");
    Ok(())
}

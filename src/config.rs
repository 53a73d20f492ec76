//! TOML configuration.
//!
//! Every component receives the parsed [`Config`] explicitly; nothing reads
//! process-wide settings except the detector API key, whose environment
//! variable name is itself part of the configuration.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub server: ServerConfig,
    pub paths: PathsConfig,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

/// Local file layout shared with the external scraper.
#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    /// Flat scrape snapshot loaded by `mart load messages` when no path is given.
    pub messages: PathBuf,
    /// Root of the `<channel>/<image>` tree.
    pub image_root: PathBuf,
    /// Per-channel prediction files written by enrichment.
    pub predictions_dir: PathBuf,
    /// Batch reports, one JSON file per step run.
    pub reports_dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EnrichmentConfig {
    /// `disabled`, `http`, or `predictions`.
    #[serde(default = "default_detector")]
    pub detector: String,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_image_globs")]
    pub include_globs: Vec<String>,
    /// Inference endpoint for the `http` detector.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Name of the environment variable holding the endpoint's bearer token.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Precomputed prediction files for the `predictions` detector.
    #[serde(default)]
    pub predictions_source: Option<PathBuf>,
    #[serde(default)]
    pub categories: CategoryConfig,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            detector: default_detector(),
            min_confidence: default_min_confidence(),
            include_globs: default_image_globs(),
            endpoint: None,
            api_key_env: None,
            timeout_secs: default_timeout_secs(),
            predictions_source: None,
            categories: CategoryConfig::default(),
        }
    }
}

fn default_detector() -> String {
    "disabled".to_string()
}
fn default_min_confidence() -> f64 {
    0.25
}
fn default_image_globs() -> Vec<String> {
    vec![
        "**/*.jpg".to_string(),
        "**/*.jpeg".to_string(),
        "**/*.png".to_string(),
    ]
}
fn default_timeout_secs() -> u64 {
    30
}

/// Class ids used to derive an image category from its detections.
#[derive(Debug, Deserialize, Clone)]
pub struct CategoryConfig {
    #[serde(default = "default_person_class")]
    pub person_class_id: i64,
    #[serde(default = "default_product_classes")]
    pub product_class_ids: Vec<i64>,
    /// Optional display names keyed by class id, used when the detector
    /// does not report one.
    #[serde(default)]
    pub class_names: BTreeMap<String, String>,
}

impl Default for CategoryConfig {
    fn default() -> Self {
        Self {
            person_class_id: default_person_class(),
            product_class_ids: default_product_classes(),
            class_names: BTreeMap::new(),
        }
    }
}

fn default_person_class() -> i64 {
    0
}
fn default_product_classes() -> Vec<i64> {
    // bottle, wine glass, cup, bowl, toothbrush
    vec![39, 40, 41, 45, 79]
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryConfig {
    #[serde(default = "default_top_terms_limit")]
    pub top_terms_limit: i64,
    #[serde(default = "default_search_limit")]
    pub search_limit: i64,
    #[serde(default = "default_max_limit")]
    pub max_limit: i64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            top_terms_limit: default_top_terms_limit(),
            search_limit: default_search_limit(),
            max_limit: default_max_limit(),
        }
    }
}

fn default_top_terms_limit() -> i64 {
    10
}
fn default_search_limit() -> i64 {
    20
}
fn default_max_limit() -> i64 {
    1000
}

/// External commands run by `mart run` around the built-in steps.
///
/// Each command is an argv list; an empty list skips the step.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct PipelineConfig {
    #[serde(default)]
    pub scrape_command: Vec<String>,
    #[serde(default)]
    pub download_command: Vec<String>,
    #[serde(default)]
    pub transform_command: Vec<String>,
}

impl EnrichmentConfig {
    pub fn is_enabled(&self) -> bool {
        self.detector != "disabled"
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if !(0.0..=1.0).contains(&config.enrichment.min_confidence) {
        anyhow::bail!("enrichment.min_confidence must be in [0.0, 1.0]");
    }

    if config.enrichment.include_globs.is_empty() {
        anyhow::bail!("enrichment.include_globs must not be empty");
    }

    match config.enrichment.detector.as_str() {
        "disabled" => {}
        "http" => {
            if config.enrichment.endpoint.is_none() {
                anyhow::bail!("enrichment.endpoint must be specified when detector is 'http'");
            }
        }
        "predictions" => {
            if config.enrichment.predictions_source.is_none() {
                anyhow::bail!(
                    "enrichment.predictions_source must be specified when detector is 'predictions'"
                );
            }
        }
        other => anyhow::bail!(
            "Unknown detector: '{}'. Must be disabled, http, or predictions.",
            other
        ),
    }

    // Validate query limits
    if config.query.max_limit < 1 {
        anyhow::bail!("query.max_limit must be >= 1");
    }
    if config.query.top_terms_limit < 0 || config.query.search_limit < 0 {
        anyhow::bail!("query default limits must be >= 0");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[db]
path = "data/mart.sqlite"

[server]
bind = "127.0.0.1:8000"

[paths]
messages = "data/raw/csv/messages.csv"
image_root = "data/raw/images"
predictions_dir = "data/enriched/predictions"
reports_dir = "data/reports"
"#;

    fn write_config(body: &str) -> (tempfile::TempDir, PathBuf) {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("mart.toml");
        std::fs::write(&path, body).unwrap();
        (tmp, path)
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let (_tmp, path) = write_config(MINIMAL);
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.enrichment.detector, "disabled");
        assert!(!cfg.enrichment.is_enabled());
        assert_eq!(cfg.query.top_terms_limit, 10);
        assert_eq!(cfg.query.search_limit, 20);
        assert_eq!(cfg.enrichment.categories.person_class_id, 0);
        assert!(cfg.pipeline.scrape_command.is_empty());
    }

    #[test]
    fn http_detector_requires_endpoint() {
        let body = format!("{}\n[enrichment]\ndetector = \"http\"\n", MINIMAL);
        let (_tmp, path) = write_config(&body);
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("enrichment.endpoint"));
    }

    #[test]
    fn unknown_detector_rejected() {
        let body = format!("{}\n[enrichment]\ndetector = \"yolo\"\n", MINIMAL);
        let (_tmp, path) = write_config(&body);
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("Unknown detector"));
    }

    #[test]
    fn confidence_threshold_bounded() {
        let body = format!("{}\n[enrichment]\nmin_confidence = 1.5\n", MINIMAL);
        let (_tmp, path) = write_config(&body);
        assert!(load_config(&path).is_err());
    }
}

//! Object detector abstraction and implementations.
//!
//! The detection model itself lives outside this crate. A [`Detector`]
//! turns one image into a list of [`Detection`]s:
//!
//! - **[`DisabledDetector`]**: always errors; used when enrichment is not configured.
//! - **[`HttpDetector`]**: posts the image to an inference service.
//! - **[`PredictionsDetector`]**: reads per-image predictions produced by an
//!   earlier, external model run (`<dir>/<channel>_<stem>.json`).
//!
//! Use [`create_detector`] to pick the implementation from configuration.
//! Detectors are called once per image and are never retried.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{CategoryConfig, EnrichmentConfig};
use crate::models::{Detection, ImageCategory};

/// One image handed to a detector.
pub struct ImageInput<'a> {
    pub channel: &'a str,
    pub path: &'a Path,
    pub bytes: &'a [u8],
}

impl ImageInput<'_> {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

#[async_trait]
pub trait Detector: Send + Sync {
    /// Short identifier recorded in logs.
    fn name(&self) -> &str;

    async fn detect(&self, image: &ImageInput<'_>) -> Result<Vec<Detection>>;
}

// ============ Disabled ============

pub struct DisabledDetector;

#[async_trait]
impl Detector for DisabledDetector {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn detect(&self, _image: &ImageInput<'_>) -> Result<Vec<Detection>> {
        bail!("Detector is disabled. Set [enrichment] detector in config.")
    }
}

// ============ HTTP ============

/// Detector backed by an inference service.
///
/// Sends `POST <endpoint>` with
/// `{"file_name", "channel", "min_confidence", "image": <base64>}` and accepts
/// either `{"detections": [...]}` or a bare array of detections.
pub struct HttpDetector {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    min_confidence: f64,
}

impl HttpDetector {
    pub fn new(config: &EnrichmentConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| anyhow::anyhow!("enrichment.endpoint required for http detector"))?;

        let api_key = match &config.api_key_env {
            Some(var) => Some(
                std::env::var(var)
                    .map_err(|_| anyhow::anyhow!("{} environment variable not set", var))?,
            ),
            None => None,
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint,
            api_key,
            min_confidence: config.min_confidence,
        })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DetectResponse {
    Wrapped { detections: Vec<Detection> },
    Bare(Vec<Detection>),
}

#[async_trait]
impl Detector for HttpDetector {
    fn name(&self) -> &str {
        "http"
    }

    async fn detect(&self, image: &ImageInput<'_>) -> Result<Vec<Detection>> {
        let body = serde_json::json!({
            "file_name": image.file_name(),
            "channel": image.channel,
            "min_confidence": self.min_confidence,
            "image": base64::engine::general_purpose::STANDARD.encode(image.bytes),
        });

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("Detector API error {}: {}", status, body_text);
        }

        let parsed: DetectResponse = response
            .json()
            .await
            .context("Invalid detector response")?;
        Ok(match parsed {
            DetectResponse::Wrapped { detections } => detections,
            DetectResponse::Bare(detections) => detections,
        })
    }
}

// ============ Precomputed predictions ============

/// Reads `<dir>/<channel>_<stem>.json`, one file per image, each a JSON
/// array of `{"class_id", "confidence", "bbox"}` objects.
pub struct PredictionsDetector {
    dir: PathBuf,
}

impl PredictionsDetector {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn prediction_path(&self, image: &ImageInput<'_>) -> PathBuf {
        let stem = image
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        self.dir.join(format!("{}_{}.json", image.channel, stem))
    }
}

#[async_trait]
impl Detector for PredictionsDetector {
    fn name(&self) -> &str {
        "predictions"
    }

    async fn detect(&self, image: &ImageInput<'_>) -> Result<Vec<Detection>> {
        let path = self.prediction_path(image);
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("No prediction file: {}", path.display()))?;
        let detections: Vec<Detection> = serde_json::from_str(&content)
            .with_context(|| format!("Invalid prediction file: {}", path.display()))?;
        Ok(detections)
    }
}

/// Create the [`Detector`] named by `enrichment.detector`.
pub fn create_detector(config: &EnrichmentConfig) -> Result<Box<dyn Detector>> {
    match config.detector.as_str() {
        "disabled" => Ok(Box::new(DisabledDetector)),
        "http" => Ok(Box::new(HttpDetector::new(config)?)),
        "predictions" => {
            let dir = config.predictions_source.clone().ok_or_else(|| {
                anyhow::anyhow!("enrichment.predictions_source required for predictions detector")
            })?;
            Ok(Box::new(PredictionsDetector::new(dir)))
        }
        other => bail!("Unknown detector: {}", other),
    }
}

// ============ Post-processing ============

/// Drops detections below the threshold and validates the rest.
pub fn accept_detections(
    detections: Vec<Detection>,
    min_confidence: f64,
    categories: &CategoryConfig,
) -> Result<Vec<Detection>> {
    let mut kept = Vec::with_capacity(detections.len());
    for mut det in detections {
        if !(0.0..=1.0).contains(&det.confidence) {
            bail!(
                "confidence {} for class {} outside [0, 1]",
                det.confidence,
                det.class_id
            );
        }
        if det.confidence < min_confidence {
            continue;
        }
        if det.class_name.is_none() {
            det.class_name = categories.class_names.get(&det.class_id.to_string()).cloned();
        }
        kept.push(det);
    }
    Ok(kept)
}

/// Labels an image from the set of classes detected in it.
///
/// | person | product | category |
/// |--------|---------|----------|
/// | yes    | yes     | `promotional` |
/// | no     | yes     | `product_display` |
/// | yes    | no      | `lifestyle` |
/// | no     | no      | `other` |
pub fn categorize(detections: &[Detection], categories: &CategoryConfig) -> ImageCategory {
    let has_person = detections
        .iter()
        .any(|d| d.class_id == categories.person_class_id);
    let has_product = detections
        .iter()
        .any(|d| categories.product_class_ids.contains(&d.class_id));

    match (has_person, has_product) {
        (true, true) => ImageCategory::Promotional,
        (false, true) => ImageCategory::ProductDisplay,
        (true, false) => ImageCategory::Lifestyle,
        (false, false) => ImageCategory::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BoundingBox;
    use axum::{http::HeaderMap, routing::post, Json, Router};

    fn det(class_id: i64, confidence: f64) -> Detection {
        Detection {
            class_id,
            class_name: None,
            confidence,
            bbox: BoundingBox::from([0.0, 0.0, 10.0, 10.0]),
        }
    }

    #[test]
    fn categories_from_classes() {
        let cfg = CategoryConfig::default();
        assert_eq!(categorize(&[det(0, 0.9), det(39, 0.8)], &cfg), ImageCategory::Promotional);
        assert_eq!(categorize(&[det(41, 0.8)], &cfg), ImageCategory::ProductDisplay);
        assert_eq!(categorize(&[det(0, 0.8)], &cfg), ImageCategory::Lifestyle);
        assert_eq!(categorize(&[det(2, 0.8)], &cfg), ImageCategory::Other);
        assert_eq!(categorize(&[], &cfg), ImageCategory::Other);
    }

    #[test]
    fn threshold_and_names_applied() {
        let mut cfg = CategoryConfig::default();
        cfg.class_names.insert("39".into(), "bottle".into());
        let kept = accept_detections(vec![det(39, 0.9), det(0, 0.1)], 0.25, &cfg).unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].class_name.as_deref(), Some("bottle"));

        assert!(accept_detections(vec![det(39, 1.5)], 0.25, &cfg).is_err());
    }

    #[tokio::test]
    async fn predictions_detector_reads_per_image_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("CheMed123_11.json"),
            r#"[{"class_id": 39, "confidence": 0.87, "bbox": [1.5, 2.0, 30.0, 40.0]}]"#,
        )
        .unwrap();

        let detector = PredictionsDetector::new(tmp.path());
        let path = Path::new("images/CheMed123/11.jpg");
        let input = ImageInput {
            channel: "CheMed123",
            path,
            bytes: b"",
        };
        let found = detector.detect(&input).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].class_id, 39);

        let missing = ImageInput {
            channel: "CheMed123",
            path: Path::new("images/CheMed123/12.jpg"),
            bytes: b"",
        };
        assert!(detector.detect(&missing).await.is_err());
    }

    #[tokio::test]
    async fn disabled_detector_errors() {
        let input = ImageInput {
            channel: "c",
            path: Path::new("1.jpg"),
            bytes: b"",
        };
        let err = DisabledDetector.detect(&input).await.unwrap_err();
        assert!(err.to_string().contains("disabled"));
    }

    #[tokio::test]
    async fn http_detector_posts_image() {
        async fn handler(
            headers: HeaderMap,
            Json(body): Json<serde_json::Value>,
        ) -> Json<serde_json::Value> {
            assert_eq!(
                headers.get("authorization").unwrap().to_str().unwrap(),
                "Bearer secret-token"
            );
            assert_eq!(body["file_name"], "7.jpg");
            assert_eq!(body["image"], "aW1n");
            Json(serde_json::json!({
                "detections": [{"class_id": 0, "class_name": "person", "confidence": 0.66, "bbox": [0, 0, 5, 5]}]
            }))
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, Router::new().route("/detect", post(handler)))
                .await
                .unwrap();
        });

        std::env::set_var("CHANNEL_MART_TEST_DETECTOR_KEY", "secret-token");
        let config = EnrichmentConfig {
            detector: "http".into(),
            endpoint: Some(format!("http://{}/detect", addr)),
            api_key_env: Some("CHANNEL_MART_TEST_DETECTOR_KEY".into()),
            ..EnrichmentConfig::default()
        };
        let detector = create_detector(&config).unwrap();
        assert_eq!(detector.name(), "http");

        let input = ImageInput {
            channel: "c",
            path: Path::new("c/7.jpg"),
            bytes: b"img",
        };
        let found = detector.detect(&input).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].class_name.as_deref(), Some("person"));
    }
}

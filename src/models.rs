//! Core data models shared by the loader, enrichment, and query layers.
//!
//! Raw records mirror the `raw_*` tables; prediction records mirror the
//! per-channel JSON files written next to the image tree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A scraped message as stored in `raw_messages`.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub message_id: i64,
    pub channel_name: String,
    pub message_date: DateTime<Utc>,
    pub message_text: Option<String>,
    pub views: Option<i64>,
    pub forwards: Option<i64>,
    pub media_type: Option<String>,
}

impl Message {
    /// Scrapers tag photo posts with the client's media class name.
    pub fn has_image(&self) -> bool {
        self.media_type
            .as_deref()
            .map(|m| m.to_ascii_lowercase().contains("photo"))
            .unwrap_or(false)
    }
}

/// Axis-aligned box in pixel coordinates: `[x1, y1, x2, y2]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 4]", into = "[f64; 4]")]
pub struct BoundingBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl From<[f64; 4]> for BoundingBox {
    fn from(v: [f64; 4]) -> Self {
        Self {
            x1: v[0],
            y1: v[1],
            x2: v[2],
            y2: v[3],
        }
    }
}

impl From<BoundingBox> for [f64; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

impl BoundingBox {
    /// Serialized form stored in `raw_detections.bbox`.
    pub fn to_text(&self) -> String {
        serde_json::to_string(&<[f64; 4]>::from(*self)).unwrap_or_else(|_| "[]".to_string())
    }
}

/// One object found by the detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    pub confidence: f64,
    pub bbox: BoundingBox,
}

/// All detections for one image, as written to `<predictions_dir>/<channel>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImagePrediction {
    pub file_name: String,
    pub message_id: i64,
    #[serde(default)]
    pub image_sha256: Option<String>,
    pub image_category: String,
    pub detections: Vec<Detection>,
}

/// Coarse label for an image derived from the classes detected in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageCategory {
    Promotional,
    ProductDisplay,
    Lifestyle,
    Other,
}

impl ImageCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageCategory::Promotional => "promotional",
            ImageCategory::ProductDisplay => "product_display",
            ImageCategory::Lifestyle => "lifestyle",
            ImageCategory::Other => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bbox_serializes_as_four_numbers() {
        let b = BoundingBox::from([1.0, 2.5, 30.0, 40.25]);
        assert_eq!(b.to_text(), "[1.0,2.5,30.0,40.25]");
        let back: BoundingBox = serde_json::from_str("[1.0,2.5,30.0,40.25]").unwrap();
        assert_eq!(back, b);
    }

    #[test]
    fn photo_media_counts_as_image() {
        let mut m = Message {
            message_id: 1,
            channel_name: "c".into(),
            message_date: Utc::now(),
            message_text: None,
            views: None,
            forwards: None,
            media_type: Some("MessageMediaPhoto".into()),
        };
        assert!(m.has_image());
        m.media_type = Some("MessageMediaDocument".into());
        assert!(!m.has_image());
        m.media_type = None;
        assert!(!m.has_image());
    }
}

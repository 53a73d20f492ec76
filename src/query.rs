//! Read-only queries behind the HTTP API.
//!
//! The `/api` surface reads the marts; the legacy surface reads the raw
//! tables directly. Every function takes a pool it does not own and performs
//! no writes.

use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

/// Tokens must be longer than this to count as terms.
const MIN_TERM_CHARS: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("channel not found: {0}")]
    ChannelNotFound(String),
    #[error("{0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Applies the default to a missing limit, rejects negatives and clamps to `max`.
pub fn normalize_limit(limit: Option<i64>, default: i64, max: i64) -> Result<i64, QueryError> {
    match limit {
        None => Ok(default.min(max)),
        Some(n) if n < 0 => Err(QueryError::InvalidArgument(format!(
            "limit must be non-negative, got {}",
            n
        ))),
        Some(n) => Ok(n.min(max)),
    }
}

// ============ Mart queries ============

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopTerm {
    pub term: String,
    pub frequency: i64,
}

/// Most frequent terms across message bodies.
///
/// Bodies are split on whitespace and lower-cased; tokens of four characters
/// or fewer are dropped. Ties are ordered by term.
pub async fn top_terms(pool: &SqlitePool, limit: i64) -> Result<Vec<TopTerm>, QueryError> {
    let bodies: Vec<String> = sqlx::query_scalar(
        "SELECT message_text FROM fct_messages WHERE message_text IS NOT NULL AND message_text != ''",
    )
    .fetch_all(pool)
    .await?;

    Ok(rank_terms(bodies.iter().map(String::as_str), limit))
}

fn rank_terms<'a>(bodies: impl Iterator<Item = &'a str>, limit: i64) -> Vec<TopTerm> {
    let mut counts: HashMap<String, i64> = HashMap::new();
    for body in bodies {
        for token in body.split_whitespace() {
            let token = token.to_lowercase();
            if token.chars().count() > MIN_TERM_CHARS {
                *counts.entry(token).or_insert(0) += 1;
            }
        }
    }

    let mut terms: Vec<TopTerm> = counts
        .into_iter()
        .map(|(term, frequency)| TopTerm { term, frequency })
        .collect();
    terms.sort_by(|a, b| b.frequency.cmp(&a.frequency).then_with(|| a.term.cmp(&b.term)));
    terms.truncate(limit.max(0) as usize);
    terms
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelActivity {
    pub channel_name: String,
    pub date: String,
    pub message_count: i64,
}

/// Messages per calendar day for one channel, oldest day first.
///
/// An unknown channel is [`QueryError::ChannelNotFound`]; a known channel
/// without messages yields an empty list.
pub async fn channel_activity(
    pool: &SqlitePool,
    channel: &str,
) -> Result<Vec<ChannelActivity>, QueryError> {
    let channel_key: Option<i64> =
        sqlx::query_scalar("SELECT channel_key FROM dim_channels WHERE channel_name = ?")
            .bind(channel)
            .fetch_optional(pool)
            .await?;
    let Some(channel_key) = channel_key else {
        return Err(QueryError::ChannelNotFound(channel.to_string()));
    };

    let rows = sqlx::query(
        r#"
        SELECT d.full_date AS date, COUNT(*) AS message_count
        FROM fct_messages f
        JOIN dim_dates d ON d.date_key = f.date_key
        WHERE f.channel_key = ?
        GROUP BY d.full_date
        ORDER BY d.full_date ASC
        "#,
    )
    .bind(channel_key)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| ChannelActivity {
            channel_name: channel.to_string(),
            date: row.get("date"),
            message_count: row.get("message_count"),
        })
        .collect())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageSearchResult {
    pub message_id: i64,
    pub channel_name: String,
    pub message_text: String,
    /// Calendar day of the message (`YYYY-MM-DD`).
    pub message_date: String,
}

/// Case-insensitive substring search over message bodies, newest first.
///
/// Results carry the message's calendar day from `dim_dates`; the full
/// timestamp only orders them. Case folding is SQLite's `lower()`, which only folds ASCII letters.
pub async fn search_messages(
    pool: &SqlitePool,
    query: &str,
    limit: i64,
) -> Result<Vec<MessageSearchResult>, QueryError> {
    if query.trim().is_empty() {
        return Err(QueryError::InvalidArgument(
            "query must not be empty".to_string(),
        ));
    }

    let rows = sqlx::query(
        r#"
        SELECT f.message_id, c.channel_name, f.message_text, d.full_date AS message_date
        FROM fct_messages f
        JOIN dim_channels c ON c.channel_key = f.channel_key
        JOIN dim_dates d ON d.date_key = f.date_key
        WHERE f.message_text IS NOT NULL
          AND instr(lower(f.message_text), lower(?)) > 0
        ORDER BY f.message_date DESC, f.message_id DESC
        LIMIT ?
        "#,
    )
    .bind(query)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| MessageSearchResult {
            message_id: row.get("message_id"),
            channel_name: row.get("channel_name"),
            message_text: row.get("message_text"),
            message_date: row.get("message_date"),
        })
        .collect())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VisualContentStat {
    pub channel_name: String,
    pub total_images: i64,
    pub avg_confidence: Option<f64>,
}

/// Detection count and mean confidence per channel, busiest first.
///
/// Every channel is listed. Channels without detections report a null
/// average.
pub async fn visual_content_stats(pool: &SqlitePool) -> Result<Vec<VisualContentStat>, QueryError> {
    let rows = sqlx::query(
        r#"
        SELECT c.channel_name,
               COUNT(f.detection_id) AS total_images,
               ROUND(AVG(f.confidence), 4) AS avg_confidence
        FROM dim_channels c
        LEFT JOIN fct_image_detections f ON f.channel_key = c.channel_key
        GROUP BY c.channel_key, c.channel_name
        ORDER BY total_images DESC, c.channel_name ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| VisualContentStat {
            channel_name: row.get("channel_name"),
            total_images: row.get("total_images"),
            avg_confidence: row.get("avg_confidence"),
        })
        .collect())
}

// ============ Legacy raw-table queries ============

#[derive(Debug, Clone, Serialize)]
pub struct MessageRow {
    pub message_id: i64,
    pub channel_name: String,
    pub message_date: String,
    pub message_text: Option<String>,
    pub views: Option<i64>,
    pub forwards: Option<i64>,
    pub media_type: Option<String>,
}

pub async fn list_messages(pool: &SqlitePool, limit: i64) -> Result<Vec<MessageRow>, QueryError> {
    let rows = sqlx::query(
        r#"
        SELECT message_id, channel_name, message_date, message_text, views, forwards, media_type
        FROM raw_messages
        ORDER BY message_id DESC
        LIMIT ?
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| MessageRow {
            message_id: row.get("message_id"),
            channel_name: row.get("channel_name"),
            message_date: row.get("message_date"),
            message_text: row.get("message_text"),
            views: row.get("views"),
            forwards: row.get("forwards"),
            media_type: row.get("media_type"),
        })
        .collect())
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectionRow {
    pub id: i64,
    pub message_id: i64,
    pub channel_name: String,
    pub file_name: String,
    pub class_id: i64,
    pub class_name: Option<String>,
    pub confidence: f64,
    pub bbox: String,
    pub image_category: String,
}

pub async fn list_detections(pool: &SqlitePool, limit: i64) -> Result<Vec<DetectionRow>, QueryError> {
    let rows = sqlx::query(
        r#"
        SELECT id, message_id, channel_name, file_name, class_id, class_name, confidence, bbox, image_category
        FROM raw_detections
        ORDER BY confidence DESC, id ASC
        LIMIT ?
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| DetectionRow {
            id: row.get("id"),
            message_id: row.get("message_id"),
            channel_name: row.get("channel_name"),
            file_name: row.get("file_name"),
            class_id: row.get("class_id"),
            class_name: row.get("class_name"),
            confidence: row.get("confidence"),
            bbox: row.get("bbox"),
            image_category: row.get("image_category"),
        })
        .collect())
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelAnalytics {
    pub channel_name: String,
    pub total_messages: i64,
    pub avg_views: Option<f64>,
    pub last_message_date: String,
}

pub async fn channel_analytics(pool: &SqlitePool) -> Result<Vec<ChannelAnalytics>, QueryError> {
    let rows = sqlx::query(
        r#"
        SELECT channel_name,
               COUNT(*) AS total_messages,
               ROUND(AVG(views), 2) AS avg_views,
               MAX(message_date) AS last_message_date
        FROM raw_messages
        GROUP BY channel_name
        ORDER BY total_messages DESC, channel_name ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| ChannelAnalytics {
            channel_name: row.get("channel_name"),
            total_messages: row.get("total_messages"),
            avg_views: row.get("avg_views"),
            last_message_date: row.get("last_message_date"),
        })
        .collect())
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectionAnalytics {
    pub image_category: String,
    pub total_detections: i64,
    pub avg_confidence: Option<f64>,
}

pub async fn detection_analytics(pool: &SqlitePool) -> Result<Vec<DetectionAnalytics>, QueryError> {
    let rows = sqlx::query(
        r#"
        SELECT image_category,
               COUNT(*) AS total_detections,
               ROUND(AVG(confidence), 4) AS avg_confidence
        FROM raw_detections
        GROUP BY image_category
        ORDER BY total_detections DESC, image_category ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| DetectionAnalytics {
            image_category: row.get("image_category"),
            total_detections: row.get("total_detections"),
            avg_confidence: row.get("avg_confidence"),
        })
        .collect())
}

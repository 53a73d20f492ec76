//! Raw store loading.
//!
//! Reads scrape snapshots from disk and writes them into the raw tables:
//!
//! - [`load_messages`] replaces the whole of `raw_messages` with the rows of a
//!   CSV file, a JSON array, or a directory of per-channel JSON files. There
//!   is no incremental mode; every run reprocesses the full snapshot.
//! - [`load_detections`] appends per-channel prediction files to
//!   `raw_detections`.
//!
//! Both loads run inside one transaction, so a failed load leaves the
//! previous table contents in place.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde_json::Value;
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::Config;
use crate::db;
use crate::models::{ImagePrediction, Message};

const ID_COLUMNS: &[&str] = &["message_id", "id"];
const CHANNEL_COLUMNS: &[&str] = &["channel_username", "channel_name", "channel"];
const DATE_COLUMNS: &[&str] = &["date", "message_date"];
const TEXT_COLUMNS: &[&str] = &["text", "message_text"];

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}: missing required column(s): {}", .path.display(), .missing.join(", "))]
    Schema { path: PathBuf, missing: Vec<String> },

    #[error("{}, record {record}: {message}", .path.display())]
    Parse {
        path: PathBuf,
        record: usize,
        message: String,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Row counts written by one load.
#[derive(Debug, Default, Clone)]
pub struct LoadSummary {
    pub rows: u64,
    pub per_channel: BTreeMap<String, u64>,
}

/// A snapshot record before column resolution: field name → text value.
type Record = HashMap<String, Option<String>>;

/// Which physical column carries each logical field.
struct Columns {
    id: String,
    channel: Option<String>,
    date: String,
    text: String,
}

// ============ Messages ============

/// Replaces `raw_messages` with the contents of `path`.
pub async fn load_messages(pool: &SqlitePool, path: &Path) -> Result<LoadSummary, LoadError> {
    let messages = read_messages(path)?;

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM raw_messages")
        .execute(&mut *tx)
        .await?;

    let mut summary = LoadSummary::default();
    for msg in &messages {
        insert_message(&mut tx, msg).await?;
        summary.rows += 1;
        *summary
            .per_channel
            .entry(msg.channel_name.clone())
            .or_default() += 1;
    }
    tx.commit().await?;

    tracing::info!(path = %path.display(), rows = summary.rows, "raw messages replaced");
    Ok(summary)
}

/// Parses a snapshot without touching the store.
pub fn read_messages(path: &Path) -> Result<Vec<Message>, LoadError> {
    let meta = std::fs::metadata(path).map_err(|e| io_error(path, e))?;

    if meta.is_dir() {
        return read_channel_dir(path);
    }

    let records = match extension(path).as_str() {
        // A CSV without a header row is malformed and falls through to the
        // schema check below.
        "csv" => read_csv_records(path)?,
        "json" => {
            let records = read_json_records(path)?;
            // `[]` has no keys to check; it is an empty snapshot.
            if records.1.is_empty() {
                return Ok(Vec::new());
            }
            records
        }
        other => {
            return Err(LoadError::Parse {
                path: path.to_path_buf(),
                record: 0,
                message: format!("unsupported snapshot format '{}', expected csv or json", other),
            })
        }
    };

    let header = header_of(&records.0, &records.1);
    let columns = resolve_columns(path, &header, false)?;
    records_to_messages(path, &records.1, &columns, None)
}

/// Loads every `<channel>.json` in `dir`; the file stem names the channel
/// for rows that do not carry one.
fn read_channel_dir(dir: &Path) -> Result<Vec<Message>, LoadError> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|e| io_error(dir, e))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && extension(p) == "json")
        .collect();
    files.sort();

    let mut messages = Vec::new();
    for file in files {
        let channel = file
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let (keys, records) = read_json_records(&file)?;
        if records.is_empty() {
            continue;
        }
        let header = header_of(&keys, &records);
        let columns = resolve_columns(&file, &header, true)?;
        messages.extend(records_to_messages(&file, &records, &columns, Some(&channel))?);
    }
    Ok(messages)
}

fn read_csv_records(path: &Path) -> Result<(Vec<String>, Vec<Record>), LoadError> {
    let mut reader = csv::Reader::from_path(path).map_err(|e| csv_error(path, e))?;
    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| csv_error(path, e))?
        .iter()
        .map(|h| h.trim().trim_start_matches('\u{feff}').to_string())
        .collect();

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.map_err(|e| csv_error(path, e))?;
        let record: Record = headers
            .iter()
            .zip(row.iter())
            .map(|(h, v)| (h.clone(), non_empty(v)))
            .collect();
        records.push(record);
    }
    Ok((headers, records))
}

fn read_json_records(path: &Path) -> Result<(Vec<String>, Vec<Record>), LoadError> {
    let content = std::fs::read_to_string(path).map_err(|e| io_error(path, e))?;
    let value: Value = serde_json::from_str(&content).map_err(|e| LoadError::Parse {
        path: path.to_path_buf(),
        record: 0,
        message: e.to_string(),
    })?;

    let items = value.as_array().ok_or_else(|| LoadError::Parse {
        path: path.to_path_buf(),
        record: 0,
        message: "expected a JSON array of message objects".to_string(),
    })?;

    let mut records = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let obj = item.as_object().ok_or_else(|| LoadError::Parse {
            path: path.to_path_buf(),
            record: i + 1,
            message: "expected an object".to_string(),
        })?;
        let record: Record = obj
            .iter()
            .map(|(k, v)| {
                let text = match v {
                    Value::Null => None,
                    Value::String(s) => non_empty(s),
                    other => Some(other.to_string()),
                };
                (k.clone(), text)
            })
            .collect();
        records.push(record);
    }
    Ok((Vec::new(), records))
}

/// Column names present in a snapshot. CSV has a header row; for JSON the
/// header is the union of keys across records.
fn header_of(explicit: &[String], records: &[Record]) -> Vec<String> {
    if !explicit.is_empty() {
        return explicit.to_vec();
    }
    let mut keys: Vec<String> = records.iter().flat_map(|r| r.keys().cloned()).collect();
    keys.sort();
    keys.dedup();
    keys
}

fn resolve_columns(path: &Path, header: &[String], channel_optional: bool) -> Result<Columns, LoadError> {
    let find = |aliases: &[&str]| {
        aliases
            .iter()
            .find(|a| header.iter().any(|h| h.as_str() == **a))
            .map(|a| a.to_string())
    };

    let id = find(ID_COLUMNS);
    let channel = find(CHANNEL_COLUMNS);
    let date = find(DATE_COLUMNS);
    let text = find(TEXT_COLUMNS);

    let mut missing = Vec::new();
    if id.is_none() {
        missing.push("message_id".to_string());
    }
    if channel.is_none() && !channel_optional {
        missing.push("channel_username".to_string());
    }
    if date.is_none() {
        missing.push("date".to_string());
    }
    if text.is_none() {
        missing.push("text".to_string());
    }

    match (id, date, text) {
        (Some(id), Some(date), Some(text)) if missing.is_empty() => Ok(Columns {
            id,
            channel,
            date,
            text,
        }),
        _ => Err(LoadError::Schema {
            path: path.to_path_buf(),
            missing,
        }),
    }
}

fn records_to_messages(
    path: &Path,
    records: &[Record],
    columns: &Columns,
    fallback_channel: Option<&str>,
) -> Result<Vec<Message>, LoadError> {
    let mut messages = Vec::with_capacity(records.len());

    for (i, record) in records.iter().enumerate() {
        let n = i + 1;
        let parse_err = |message: String| LoadError::Parse {
            path: path.to_path_buf(),
            record: n,
            message,
        };
        let field = |name: &str| record.get(name).cloned().flatten();

        let id_text = field(&columns.id).ok_or_else(|| parse_err("missing message id".into()))?;
        let message_id =
            parse_integer(&id_text).ok_or_else(|| parse_err(format!("invalid message id '{}'", id_text)))?;

        let channel_name = columns
            .channel
            .as_deref()
            .and_then(|c| field(c))
            .or_else(|| fallback_channel.map(str::to_string))
            .ok_or_else(|| parse_err("missing channel".into()))?;

        let date_text = field(&columns.date).ok_or_else(|| parse_err("missing date".into()))?;
        let message_date =
            parse_timestamp(&date_text).ok_or_else(|| parse_err(format!("invalid date '{}'", date_text)))?;

        let optional_int = |name: &str| -> Result<Option<i64>, LoadError> {
            match field(name) {
                None => Ok(None),
                Some(v) => parse_integer(&v)
                    .map(Some)
                    .ok_or_else(|| parse_err(format!("invalid {} '{}'", name, v))),
            }
        };

        messages.push(Message {
            message_id,
            channel_name,
            message_date,
            message_text: field(&columns.text),
            views: optional_int("views")?,
            forwards: optional_int("forwards")?,
            media_type: field("media_type").filter(|m| m != "None"),
        });
    }

    Ok(messages)
}

async fn insert_message(tx: &mut Transaction<'_, Sqlite>, msg: &Message) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO raw_messages (message_id, channel_name, message_date, message_text, views, forwards, media_type, has_image)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(msg.message_id)
    .bind(&msg.channel_name)
    .bind(msg.message_date.to_rfc3339_opts(SecondsFormat::Secs, true))
    .bind(&msg.message_text)
    .bind(msg.views)
    .bind(msg.forwards)
    .bind(&msg.media_type)
    .bind(msg.has_image())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

// ============ Detections ============

/// Appends every `<channel>.json` prediction file in `dir` to `raw_detections`.
pub async fn load_detections(pool: &SqlitePool, dir: &Path, run_id: &str) -> Result<LoadSummary, LoadError> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|e| io_error(dir, e))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && extension(p) == "json")
        .collect();
    files.sort();

    let mut batches = Vec::new();
    for file in files {
        let channel = file
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let content = std::fs::read_to_string(&file).map_err(|e| io_error(&file, e))?;
        let predictions: Vec<ImagePrediction> =
            serde_json::from_str(&content).map_err(|e| LoadError::Parse {
                path: file.clone(),
                record: e.line(),
                message: e.to_string(),
            })?;
        batches.push((channel, predictions));
    }

    let mut summary = LoadSummary::default();
    let mut tx = pool.begin().await?;
    for (channel, predictions) in &batches {
        for prediction in predictions {
            let n = insert_prediction(&mut tx, channel, prediction, run_id).await?;
            summary.rows += n;
            *summary.per_channel.entry(channel.clone()).or_default() += n;
        }
    }
    tx.commit().await?;

    tracing::info!(dir = %dir.display(), rows = summary.rows, "raw detections appended");
    Ok(summary)
}

/// Records that `run_id` processed the image, then writes one row per
/// detection. An image with no boxes still gets its run row, so a newer
/// empty result supersedes older boxes. Returns the detection count.
pub async fn insert_prediction(
    tx: &mut Transaction<'_, Sqlite>,
    channel: &str,
    prediction: &ImagePrediction,
    run_id: &str,
) -> Result<u64, sqlx::Error> {
    let now = Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO raw_detection_runs (channel_name, file_name, message_id, run_id, box_count, processed_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(channel)
    .bind(&prediction.file_name)
    .bind(prediction.message_id)
    .bind(run_id)
    .bind(prediction.detections.len() as i64)
    .bind(now)
    .execute(&mut **tx)
    .await?;

    for det in &prediction.detections {
        sqlx::query(
            r#"
            INSERT INTO raw_detections (message_id, class_id, class_name, confidence, bbox, channel_name, image_category, file_name, image_sha256, run_id, detected_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(prediction.message_id)
        .bind(det.class_id)
        .bind(&det.class_name)
        .bind(det.confidence)
        .bind(det.bbox.to_text())
        .bind(channel)
        .bind(&prediction.image_category)
        .bind(&prediction.file_name)
        .bind(&prediction.image_sha256)
        .bind(run_id)
        .bind(now)
        .execute(&mut **tx)
        .await?;
    }
    Ok(prediction.detections.len() as u64)
}

// ============ CLI entry points ============

pub async fn run_load_messages(config: &Config, path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = path.unwrap_or_else(|| config.paths.messages.clone());
    let pool = db::connect(config).await?;
    let result = load_messages(&pool, &path).await;
    pool.close().await;
    let summary = result?;

    println!("load messages {}", path.display());
    for (channel, rows) in &summary.per_channel {
        println!("  {}: {} rows", channel, rows);
    }
    println!("  total rows: {}", summary.rows);
    println!("ok");
    Ok(())
}

pub async fn run_load_detections(config: &Config, dir: Option<PathBuf>) -> anyhow::Result<()> {
    let dir = dir.unwrap_or_else(|| config.paths.predictions_dir.clone());
    let run_id = uuid::Uuid::new_v4().to_string();
    let pool = db::connect(config).await?;
    let result = load_detections(&pool, &dir, &run_id).await;
    pool.close().await;
    let summary = result?;

    println!("load detections {}", dir.display());
    for (channel, rows) in &summary.per_channel {
        println!("  {}: {} rows", channel, rows);
    }
    println!("  total rows: {}", summary.rows);
    println!("ok");
    Ok(())
}

// ============ Field parsing ============

fn non_empty(v: &str) -> Option<String> {
    let t = v.trim();
    if t.is_empty() {
        None
    } else {
        Some(v.to_string())
    }
}

/// Integers may arrive as `"11"` or, from dataframe exports, `"11.0"`.
fn parse_integer(v: &str) -> Option<i64> {
    let t = v.trim();
    if let Ok(n) = t.parse::<i64>() {
        return Some(n);
    }
    let f = t.parse::<f64>().ok()?;
    if f.is_finite() && f.fract() == 0.0 {
        Some(f as i64)
    } else {
        None
    }
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[+HH:MM]`, and bare dates.
/// Naive values are taken as UTC.
pub fn parse_timestamp(v: &str) -> Option<DateTime<Utc>> {
    let t = v.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(t) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(t, "%Y-%m-%d %H:%M:%S%:z") {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(t, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(t, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn extension(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

fn io_error(path: &Path, source: std::io::Error) -> LoadError {
    LoadError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn csv_error(path: &Path, err: csv::Error) -> LoadError {
    let record = err.position().map(|p| p.record() as usize).unwrap_or(0);
    match err.into_kind() {
        csv::ErrorKind::Io(source) => io_error(path, source),
        other => LoadError::Parse {
            path: path.to_path_buf(),
            record,
            message: format!("{:?}", other),
        },
    }
}

//! Mart building and checks.
//!
//! [`build_marts`] rebuilds the dimensional tables from the raw layer in a
//! single transaction:
//!
//! | Table | Grain | Source |
//! |-------|-------|--------|
//! | `dim_channels` | one row per channel | `raw_messages` |
//! | `dim_dates` | one row per calendar day with posts | `raw_messages` |
//! | `fct_messages` | one row per message | `raw_messages` ⋈ dims |
//! | `fct_image_detections` | one row per box from the latest run per image | `raw_detections` ⋈ `fct_messages` |
//!
//! Facts are produced by inner joins to the freshly built dimensions, so every
//! fact row resolves to exactly one row per dimension key. Detections whose
//! message is not loaded cannot be dated; they are left out and counted in
//! [`MartSummary::unresolved_detections`]. [`check_marts`] verifies the keys
//! and a few other invariants after the fact.

use anyhow::Result;
use chrono::{Datelike, NaiveDate, Weekday};
use serde::Serialize;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use crate::config::Config;
use crate::db;

/// Row counts after a rebuild.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MartSummary {
    pub channels: i64,
    pub dates: i64,
    pub messages: i64,
    pub detections: i64,
    /// Latest-run detections with no loaded message to attach to.
    pub unresolved_detections: i64,
}

/// Selects the run that most recently processed each image.
const LATEST_RUN: &str = r#"
    r.run_id = (
        SELECT ru.run_id
        FROM raw_detection_runs ru
        WHERE ru.channel_name = r.channel_name AND ru.file_name = r.file_name
        ORDER BY ru.id DESC
        LIMIT 1
    )
"#;

pub async fn build_marts(pool: &SqlitePool) -> Result<MartSummary> {
    let mut tx = pool.begin().await?;

    for table in [
        "fct_image_detections",
        "fct_messages",
        "dim_dates",
        "dim_channels",
    ] {
        sqlx::query(&format!("DELETE FROM {}", table))
            .execute(&mut *tx)
            .await?;
    }

    build_dim_channels(&mut tx).await?;
    build_dim_dates(&mut tx).await?;

    sqlx::query(
        r#"
        INSERT INTO fct_messages (message_id, channel_key, date_key, message_date, message_text, message_length, view_count, forward_count, has_image)
        SELECT
            m.message_id,
            c.channel_key,
            d.date_key,
            m.message_date,
            m.message_text,
            length(COALESCE(m.message_text, '')),
            m.views,
            m.forwards,
            m.has_image
        FROM raw_messages m
        JOIN dim_channels c ON c.channel_name = m.channel_name
        JOIN dim_dates d ON d.full_date = substr(m.message_date, 1, 10)
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Raw detections accumulate across runs; the mart keeps the most recent
    // run for each image and takes its date from the message fact.
    sqlx::query(&format!(
        r#"
        INSERT INTO fct_image_detections (detection_id, message_id, channel_key, date_key, class_id, confidence, image_category)
        SELECT
            r.id,
            r.message_id,
            fm.channel_key,
            fm.date_key,
            r.class_id,
            r.confidence,
            r.image_category
        FROM raw_detections r
        JOIN dim_channels c ON c.channel_name = r.channel_name
        JOIN (
            SELECT channel_key, message_id, MIN(date_key) AS date_key
            FROM fct_messages
            GROUP BY channel_key, message_id
        ) fm ON fm.channel_key = c.channel_key AND fm.message_id = r.message_id
        WHERE {}
        "#,
        LATEST_RUN
    ))
    .execute(&mut *tx)
    .await?;

    let latest: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM raw_detections r WHERE {}",
        LATEST_RUN
    ))
    .fetch_one(&mut *tx)
    .await?;

    let detections = count(&mut tx, "fct_image_detections").await?;
    let summary = MartSummary {
        channels: count(&mut tx, "dim_channels").await?,
        dates: count(&mut tx, "dim_dates").await?,
        messages: count(&mut tx, "fct_messages").await?,
        detections,
        unresolved_detections: latest - detections,
    };

    tx.commit().await?;
    if summary.unresolved_detections > 0 {
        tracing::warn!(
            unresolved = summary.unresolved_detections,
            "detections without a loaded message left out of fct_image_detections"
        );
    }
    tracing::info!(?summary, "marts rebuilt");
    Ok(summary)
}

async fn build_dim_channels(tx: &mut Transaction<'_, Sqlite>) -> Result<()> {
    let rows = sqlx::query(
        r#"
        SELECT channel_name,
               MIN(substr(message_date, 1, 10)) AS first_post_date,
               MAX(substr(message_date, 1, 10)) AS last_post_date,
               COUNT(*) AS total_posts,
               AVG(views) AS avg_views
        FROM raw_messages
        GROUP BY channel_name
        ORDER BY channel_name
        "#,
    )
    .fetch_all(&mut **tx)
    .await?;

    for (i, row) in rows.iter().enumerate() {
        let name: String = row.get("channel_name");
        sqlx::query(
            r#"
            INSERT INTO dim_channels (channel_key, channel_name, channel_type, first_post_date, last_post_date, total_posts, avg_views)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(i as i64 + 1)
        .bind(&name)
        .bind(channel_type(&name))
        .bind(row.get::<Option<String>, _>("first_post_date"))
        .bind(row.get::<Option<String>, _>("last_post_date"))
        .bind(row.get::<i64, _>("total_posts"))
        .bind(row.get::<Option<f64>, _>("avg_views"))
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn build_dim_dates(tx: &mut Transaction<'_, Sqlite>) -> Result<()> {
    let days: Vec<String> = sqlx::query_scalar(
        "SELECT DISTINCT substr(message_date, 1, 10) FROM raw_messages ORDER BY 1",
    )
    .fetch_all(&mut **tx)
    .await?;

    for day in days {
        let Ok(date) = NaiveDate::parse_from_str(&day, "%Y-%m-%d") else {
            tracing::warn!(%day, "skipping unparseable message date");
            continue;
        };
        let row = DateRow::from_date(date);
        sqlx::query(
            r#"
            INSERT INTO dim_dates (date_key, full_date, day_of_week, day_name, week_of_year, month, month_name, quarter, year, is_weekend)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(row.date_key)
        .bind(&day)
        .bind(row.day_of_week)
        .bind(row.day_name)
        .bind(row.week_of_year)
        .bind(row.month)
        .bind(row.month_name)
        .bind(row.quarter)
        .bind(row.year)
        .bind(row.is_weekend)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

/// Calendar attributes of one `dim_dates` row.
#[derive(Debug, PartialEq)]
struct DateRow {
    date_key: i64,
    /// ISO weekday, Monday = 1.
    day_of_week: i64,
    day_name: &'static str,
    week_of_year: i64,
    month: i64,
    month_name: &'static str,
    quarter: i64,
    year: i64,
    is_weekend: bool,
}

impl DateRow {
    fn from_date(date: NaiveDate) -> Self {
        const MONTHS: [&str; 12] = [
            "January", "February", "March", "April", "May", "June", "July", "August",
            "September", "October", "November", "December",
        ];
        let weekday = date.weekday();
        Self {
            date_key: date.year() as i64 * 10_000 + date.month() as i64 * 100 + date.day() as i64,
            day_of_week: weekday.number_from_monday() as i64,
            day_name: match weekday {
                Weekday::Mon => "Monday",
                Weekday::Tue => "Tuesday",
                Weekday::Wed => "Wednesday",
                Weekday::Thu => "Thursday",
                Weekday::Fri => "Friday",
                Weekday::Sat => "Saturday",
                Weekday::Sun => "Sunday",
            },
            week_of_year: date.iso_week().week() as i64,
            month: date.month() as i64,
            month_name: MONTHS[date.month0() as usize],
            quarter: (date.month0() / 3 + 1) as i64,
            year: date.year() as i64,
            is_weekend: matches!(weekday, Weekday::Sat | Weekday::Sun),
        }
    }
}

/// Coarse channel classification from its name.
fn channel_type(name: &str) -> &'static str {
    let lower = name.to_lowercase();
    if lower.contains("pharma") || lower.contains("med") {
        "pharmaceutical"
    } else if lower.contains("cosmetic") {
        "cosmetics"
    } else {
        "general"
    }
}

async fn count(tx: &mut Transaction<'_, Sqlite>, table: &str) -> Result<i64> {
    let n: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
        .fetch_one(&mut **tx)
        .await?;
    Ok(n)
}

// ============ Checks ============

/// One failed mart check.
#[derive(Debug, Clone, Serialize)]
pub struct CheckFailure {
    pub check: &'static str,
    pub failing_rows: i64,
}

/// Named checks, each a query counting offending rows.
const CHECKS: &[(&str, &str)] = &[
    (
        "fct_messages.channel_key resolves to dim_channels",
        "SELECT COUNT(*) FROM fct_messages f LEFT JOIN dim_channels c ON f.channel_key = c.channel_key WHERE c.channel_key IS NULL",
    ),
    (
        "fct_messages.date_key resolves to dim_dates",
        "SELECT COUNT(*) FROM fct_messages f LEFT JOIN dim_dates d ON f.date_key = d.date_key WHERE d.date_key IS NULL",
    ),
    (
        "fct_image_detections.channel_key resolves to dim_channels",
        "SELECT COUNT(*) FROM fct_image_detections f LEFT JOIN dim_channels c ON f.channel_key = c.channel_key WHERE c.channel_key IS NULL",
    ),
    (
        "fct_image_detections.date_key resolves to dim_dates",
        "SELECT COUNT(*) FROM fct_image_detections f LEFT JOIN dim_dates d ON f.date_key = d.date_key WHERE d.date_key IS NULL",
    ),
    (
        "fct_messages unique per channel and message id",
        "SELECT COUNT(*) FROM (SELECT channel_key, message_id FROM fct_messages GROUP BY channel_key, message_id HAVING COUNT(*) > 1)",
    ),
    (
        "fct_image_detections.confidence within [0, 1]",
        "SELECT COUNT(*) FROM fct_image_detections WHERE confidence < 0 OR confidence > 1",
    ),
    (
        "fct_messages.message_length non-negative",
        "SELECT COUNT(*) FROM fct_messages WHERE message_length < 0",
    ),
];

pub async fn check_marts(pool: &SqlitePool) -> Result<Vec<CheckFailure>> {
    let mut failures = Vec::new();
    for (name, sql) in CHECKS {
        let n: i64 = sqlx::query_scalar(sql).fetch_one(pool).await?;
        if n > 0 {
            failures.push(CheckFailure {
                check: *name,
                failing_rows: n,
            });
        }
    }
    Ok(failures)
}

// ============ CLI entry points ============

pub async fn run_build(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let result = build_marts(&pool).await;
    pool.close().await;
    let summary = result?;

    println!("build marts");
    println!("  dim_channels: {}", summary.channels);
    println!("  dim_dates: {}", summary.dates);
    println!("  fct_messages: {}", summary.messages);
    println!("  fct_image_detections: {}", summary.detections);
    if summary.unresolved_detections > 0 {
        println!(
            "  unresolved detections (message not loaded): {}",
            summary.unresolved_detections
        );
    }
    println!("ok");
    Ok(())
}

pub async fn run_check(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let result = check_marts(&pool).await;
    pool.close().await;
    let failures = result?;

    println!("check marts: {} checks", CHECKS.len());
    if failures.is_empty() {
        println!("ok");
        return Ok(());
    }
    for f in &failures {
        println!("  FAIL {} ({} rows)", f.check, f.failing_rows);
    }
    anyhow::bail!("{} mart check(s) failed", failures.len())
}

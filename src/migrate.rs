use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let result = create_schema(&pool).await;
    pool.close().await;
    result
}

/// Creates raw and mart tables. Safe to run repeatedly.
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    // Raw layer: replaced wholesale by the loader
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS raw_messages (
            message_id INTEGER NOT NULL,
            channel_name TEXT NOT NULL,
            message_date TEXT NOT NULL,
            message_text TEXT,
            views INTEGER,
            forwards INTEGER,
            media_type TEXT,
            has_image INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Raw layer: append-only
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS raw_detections (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            message_id INTEGER NOT NULL,
            class_id INTEGER NOT NULL,
            class_name TEXT,
            confidence REAL NOT NULL,
            bbox TEXT NOT NULL,
            channel_name TEXT NOT NULL,
            image_category TEXT NOT NULL,
            file_name TEXT NOT NULL,
            image_sha256 TEXT,
            run_id TEXT NOT NULL,
            detected_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One row per image processed by a detection run, boxes or not
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS raw_detection_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            channel_name TEXT NOT NULL,
            file_name TEXT NOT NULL,
            message_id INTEGER NOT NULL,
            run_id TEXT NOT NULL,
            box_count INTEGER NOT NULL,
            processed_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dim_channels (
            channel_key INTEGER PRIMARY KEY,
            channel_name TEXT NOT NULL UNIQUE,
            channel_type TEXT NOT NULL,
            first_post_date TEXT,
            last_post_date TEXT,
            total_posts INTEGER NOT NULL,
            avg_views REAL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dim_dates (
            date_key INTEGER PRIMARY KEY,
            full_date TEXT NOT NULL UNIQUE,
            day_of_week INTEGER NOT NULL,
            day_name TEXT NOT NULL,
            week_of_year INTEGER NOT NULL,
            month INTEGER NOT NULL,
            month_name TEXT NOT NULL,
            quarter INTEGER NOT NULL,
            year INTEGER NOT NULL,
            is_weekend INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS fct_messages (
            message_id INTEGER NOT NULL,
            channel_key INTEGER NOT NULL,
            date_key INTEGER NOT NULL,
            message_date TEXT NOT NULL,
            message_text TEXT,
            message_length INTEGER NOT NULL,
            view_count INTEGER,
            forward_count INTEGER,
            has_image INTEGER NOT NULL,
            FOREIGN KEY (channel_key) REFERENCES dim_channels(channel_key),
            FOREIGN KEY (date_key) REFERENCES dim_dates(date_key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS fct_image_detections (
            detection_id INTEGER PRIMARY KEY,
            message_id INTEGER NOT NULL,
            channel_key INTEGER NOT NULL,
            date_key INTEGER NOT NULL,
            class_id INTEGER NOT NULL,
            confidence REAL NOT NULL,
            image_category TEXT NOT NULL,
            FOREIGN KEY (channel_key) REFERENCES dim_channels(channel_key),
            FOREIGN KEY (date_key) REFERENCES dim_dates(date_key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_raw_detections_image ON raw_detections(channel_name, file_name)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_raw_detection_runs_image ON raw_detection_runs(channel_name, file_name, id DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_fct_messages_channel ON fct_messages(channel_key)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_fct_messages_date ON fct_messages(date_key DESC)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_fct_detections_channel ON fct_image_detections(channel_key)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

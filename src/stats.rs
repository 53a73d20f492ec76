//! Store statistics.
//!
//! Summarizes what has been loaded and built: raw row counts, mart row
//! counts, and a per-channel breakdown. Used by `mart stats` to confirm that
//! loads, enrichment and rebuilds did what was expected.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;

#[derive(Debug, Clone, Default, Serialize)]
pub struct TableCounts {
    pub raw_messages: i64,
    pub raw_detections: i64,
    pub detection_runs: i64,
    pub dim_channels: i64,
    pub dim_dates: i64,
    pub fct_messages: i64,
    pub fct_image_detections: i64,
}

/// Per-channel breakdown across the raw and mart layers.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStats {
    pub channel_name: String,
    pub messages: i64,
    pub with_image: i64,
    pub raw_detections: i64,
    pub mart_detections: i64,
    pub last_message_date: Option<String>,
}

pub async fn table_counts(pool: &SqlitePool) -> Result<TableCounts> {
    async fn count(pool: &SqlitePool, sql: &str) -> Result<i64> {
        Ok(sqlx::query_scalar(sql).fetch_one(pool).await?)
    }

    Ok(TableCounts {
        raw_messages: count(pool, "SELECT COUNT(*) FROM raw_messages").await?,
        raw_detections: count(pool, "SELECT COUNT(*) FROM raw_detections").await?,
        detection_runs: count(pool, "SELECT COUNT(DISTINCT run_id) FROM raw_detection_runs").await?,
        dim_channels: count(pool, "SELECT COUNT(*) FROM dim_channels").await?,
        dim_dates: count(pool, "SELECT COUNT(*) FROM dim_dates").await?,
        fct_messages: count(pool, "SELECT COUNT(*) FROM fct_messages").await?,
        fct_image_detections: count(pool, "SELECT COUNT(*) FROM fct_image_detections").await?,
    })
}

pub async fn channel_stats(pool: &SqlitePool) -> Result<Vec<ChannelStats>> {
    let rows = sqlx::query(
        r#"
        SELECT
            ch.channel_name,
            (SELECT COUNT(*) FROM raw_messages m WHERE m.channel_name = ch.channel_name) AS messages,
            (SELECT COUNT(*) FROM raw_messages m WHERE m.channel_name = ch.channel_name AND m.has_image = 1) AS with_image,
            (SELECT MAX(message_date) FROM raw_messages m WHERE m.channel_name = ch.channel_name) AS last_message_date,
            (SELECT COUNT(*) FROM raw_detections r WHERE r.channel_name = ch.channel_name) AS raw_detections,
            (SELECT COUNT(*) FROM fct_image_detections f
                JOIN dim_channels c ON c.channel_key = f.channel_key
                WHERE c.channel_name = ch.channel_name) AS mart_detections
        FROM (
            SELECT channel_name FROM raw_messages
            UNION
            SELECT channel_name FROM raw_detections
        ) ch
        ORDER BY messages DESC, ch.channel_name ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| ChannelStats {
            channel_name: row.get("channel_name"),
            messages: row.get("messages"),
            with_image: row.get("with_image"),
            raw_detections: row.get("raw_detections"),
            mart_detections: row.get("mart_detections"),
            last_message_date: row.get("last_message_date"),
        })
        .collect())
}

/// Run the stats command: query the store and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let result = async {
        let counts = table_counts(&pool).await?;
        let channels = channel_stats(&pool).await?;
        anyhow::Ok((counts, channels))
    }
    .await;
    pool.close().await;
    let (counts, channels) = result?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Channel Mart — Store Stats");
    println!("==========================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Raw messages:        {}", counts.raw_messages);
    println!(
        "  Raw detections:      {} ({} run{})",
        counts.raw_detections,
        counts.detection_runs,
        if counts.detection_runs == 1 { "" } else { "s" }
    );
    println!("  dim_channels:        {}", counts.dim_channels);
    println!("  dim_dates:           {}", counts.dim_dates);
    println!("  fct_messages:        {}", counts.fct_messages);
    println!("  fct_image_detections: {}", counts.fct_image_detections);

    if !channels.is_empty() {
        println!();
        println!("  By channel:");
        println!(
            "  {:<24} {:>8} {:>7} {:>9} {:>9}   {}",
            "CHANNEL", "MESSAGES", "IMAGES", "RAW DET", "MART DET", "LAST MESSAGE"
        );
        println!("  {}", "-".repeat(84));

        for c in &channels {
            println!(
                "  {:<24} {:>8} {:>7} {:>9} {:>9}   {}",
                c.channel_name,
                c.messages,
                c.with_image,
                c.raw_detections,
                c.mart_detections,
                c.last_message_date.as_deref().unwrap_or("never")
            );
        }
    }

    println!();
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marts::build_marts;
    use crate::migrate::create_schema;

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[tokio::test]
    async fn counts_cover_both_layers() {
        let tmp = tempfile::TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("mart.sqlite")).await.unwrap();
        create_schema(&pool).await.unwrap();

        sqlx::query(
            "INSERT INTO raw_messages (message_id, channel_name, message_date, message_text, has_image) VALUES (1, 'a', '2024-01-01T00:00:00Z', 'x', 1), (2, 'a', '2024-01-02T00:00:00Z', 'y', 0)",
        )
        .execute(&pool)
        .await
        .unwrap();
        for (message_id, channel, file) in [(1, "a", "1.jpg"), (5, "imgonly", "5.jpg")] {
            sqlx::query(
                "INSERT INTO raw_detection_runs (channel_name, file_name, message_id, run_id, box_count, processed_at) VALUES (?, ?, ?, 'r1', 1, 0)",
            )
            .bind(channel)
            .bind(file)
            .bind(message_id)
            .execute(&pool)
            .await
            .unwrap();
            sqlx::query(
                "INSERT INTO raw_detections (message_id, class_id, confidence, bbox, channel_name, image_category, file_name, run_id, detected_at) VALUES (?, 0, 0.9, '[0,0,1,1]', ?, 'lifestyle', ?, 'r1', 0)",
            )
            .bind(message_id)
            .bind(channel)
            .bind(file)
            .execute(&pool)
            .await
            .unwrap();
        }
        build_marts(&pool).await.unwrap();

        let counts = table_counts(&pool).await.unwrap();
        assert_eq!(counts.raw_messages, 2);
        assert_eq!(counts.raw_detections, 2);
        assert_eq!(counts.detection_runs, 1);
        assert_eq!(counts.dim_channels, 1);
        assert_eq!(counts.fct_image_detections, 1);

        let channels = channel_stats(&pool).await.unwrap();
        assert_eq!(channels[0].channel_name, "a");
        assert_eq!(channels[0].with_image, 1);
        assert_eq!(channels[0].mart_detections, 1);
        // Detections without a loaded message stay in the raw layer only
        assert_eq!(channels[1].channel_name, "imgonly");
        assert_eq!(channels[1].raw_detections, 1);
        assert_eq!(channels[1].mart_detections, 0);
        assert_eq!(channels[1].last_message_date, None);
    }
}

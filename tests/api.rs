use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

use channel_mart::config::{
    Config, DbConfig, EnrichmentConfig, PathsConfig, PipelineConfig, QueryConfig, ServerConfig,
};
use channel_mart::{db, loader, marts, migrate, server};

fn test_config(root: &Path) -> Config {
    Config {
        db: DbConfig {
            path: root.join("mart.sqlite"),
        },
        server: ServerConfig {
            bind: "127.0.0.1:0".into(),
        },
        paths: PathsConfig {
            messages: root.join("messages.csv"),
            image_root: root.join("images"),
            predictions_dir: root.join("predictions"),
            reports_dir: root.join("reports"),
        },
        enrichment: EnrichmentConfig::default(),
        query: QueryConfig::default(),
        pipeline: PipelineConfig::default(),
    }
}

/// Seeds raw messages from `csv`, rebuilds the marts and returns the config.
async fn seeded(tmp: &TempDir, csv: &str) -> Arc<Config> {
    let config = test_config(tmp.path());
    std::fs::write(&config.paths.messages, csv).unwrap();

    migrate::run_migrations(&config).await.unwrap();
    let pool = db::connect(&config).await.unwrap();
    loader::load_messages(&pool, &config.paths.messages)
        .await
        .unwrap();
    sqlx::query(
        "INSERT INTO raw_detection_runs (channel_name, file_name, message_id, run_id, box_count, processed_at) VALUES ('demoChan', '1.jpg', 1, 'r1', 1, 0)",
    )
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query(
        "INSERT INTO raw_detections (message_id, class_id, class_name, confidence, bbox, channel_name, image_category, file_name, run_id, detected_at) VALUES (1, 39, 'bottle', 0.8, '[0,0,1,1]', 'demoChan', 'product_display', '1.jpg', 'r1', 0)",
    )
    .execute(&pool)
    .await
    .unwrap();
    marts::build_marts(&pool).await.unwrap();
    pool.close().await;

    Arc::new(config)
}

const DEMO_CSV: &str = "\
message_id,channel_name,date,text,views
1,demoChan,2024-01-01T08:00:00Z,Paracetamol tablets available,10
2,demoChan,2024-01-01T17:00:00Z,Vitamin tablets restocked,20
3,demoChan,2024-01-02T09:00:00Z,PARACETAMOL syrup,30
4,quietChan,2024-01-03T09:00:00Z,hello,5
";

async fn get(config: Arc<Config>, uri: &str) -> (StatusCode, Value) {
    let response = server::router(config)
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

#[tokio::test]
async fn channel_activity_groups_by_day() {
    let tmp = TempDir::new().unwrap();
    let config = seeded(&tmp, DEMO_CSV).await;

    let (status, body) = get(config, "/api/channels/demoChan/activity").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!([
            {"channel_name": "demoChan", "date": "2024-01-01", "message_count": 2},
            {"channel_name": "demoChan", "date": "2024-01-02", "message_count": 1}
        ])
    );
}

#[tokio::test]
async fn unknown_channel_is_404() {
    let tmp = TempDir::new().unwrap();
    let config = seeded(&tmp, DEMO_CSV).await;

    let (status, body) = get(config, "/api/channels/nobody/activity").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn top_products_respects_limit() {
    let tmp = TempDir::new().unwrap();
    let config = seeded(&tmp, DEMO_CSV).await;

    let (status, body) = get(config.clone(), "/api/reports/top-products?limit=2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!([
            {"term": "paracetamol", "frequency": 2},
            {"term": "tablets", "frequency": 2}
        ])
    );

    let (status, body) = get(config, "/api/reports/top-products?limit=-3").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn search_is_case_insensitive_and_limited() {
    let tmp = TempDir::new().unwrap();
    let config = seeded(&tmp, DEMO_CSV).await;

    let (status, body) = get(config.clone(), "/api/search/messages?query=paracetamol&limit=5").await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<i64> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["message_id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![3, 1]);
    assert_eq!(body[0]["channel_name"], "demoChan");
    assert_eq!(body[0]["message_date"], "2024-01-02");
    assert_eq!(body[1]["message_date"], "2024-01-01");

    let (_, body) = get(config.clone(), "/api/search/messages?query=tablets&limit=1").await;
    assert_eq!(body.as_array().unwrap().len(), 1);

    let (status, _) = get(config, "/api/search/messages").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn visual_content_nulls_channels_without_detections() {
    let tmp = TempDir::new().unwrap();
    let config = seeded(&tmp, DEMO_CSV).await;

    let (status, body) = get(config, "/api/reports/visual-content").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!([
            {"channel_name": "demoChan", "total_images": 1, "avg_confidence": 0.8},
            {"channel_name": "quietChan", "total_images": 0, "avg_confidence": null}
        ])
    );
}

#[tokio::test]
async fn legacy_endpoints_read_raw_tables() {
    let tmp = TempDir::new().unwrap();
    let config = seeded(&tmp, DEMO_CSV).await;

    let (status, body) = get(config.clone(), "/messages?limit=2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 2);
    assert_eq!(body[0]["message_id"], 4);

    let (_, body) = get(config.clone(), "/image-detections").await;
    assert_eq!(body[0]["class_name"], "bottle");

    let (_, body) = get(config.clone(), "/analytics/channels").await;
    assert_eq!(body[0]["channel_name"], "demoChan");
    assert_eq!(body[0]["total_messages"], 3);
    assert_eq!(body[0]["avg_views"], 20.0);

    let (_, body) = get(config.clone(), "/analytics/image-detections").await;
    assert_eq!(body[0]["image_category"], "product_display");

    let (status, body) = get(config, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn malformed_limit_is_json_bad_request() {
    let tmp = TempDir::new().unwrap();
    let config = seeded(&tmp, DEMO_CSV).await;

    for uri in [
        "/api/reports/top-products?limit=abc",
        "/api/search/messages?query=x&limit=1.5",
        "/messages?limit=ten",
    ] {
        let (status, body) = get(config.clone(), uri).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", uri);
        assert_eq!(body["error"]["code"], "bad_request", "{}", uri);
        assert!(body["error"]["message"].is_string(), "{}", uri);
    }
}

#[tokio::test]
async fn absent_store_is_not_created() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(tmp.path());
    config.db.path = tmp.path().join("nested/dir/absent.sqlite");
    let config = Arc::new(config);

    let (status, body) = get(config.clone(), "/api/reports/visual-content").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"]["code"], "internal");
    assert!(!tmp.path().join("nested").exists());

    // An existing directory without the file stays empty too
    std::fs::create_dir_all(tmp.path().join("nested/dir")).unwrap();
    let (status, _) = get(config, "/api/search/messages?query=x").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        std::fs::read_dir(tmp.path().join("nested/dir")).unwrap().count(),
        0
    );
}

#[tokio::test]
async fn server_does_not_write_to_the_store() {
    let tmp = TempDir::new().unwrap();
    let config = seeded(&tmp, DEMO_CSV).await;

    let (status, _) = get(config.clone(), "/api/reports/top-products").await;
    assert_eq!(status, StatusCode::OK);

    let pool = db::connect_read_only(&config).await.unwrap();
    let err = sqlx::query("DELETE FROM raw_messages")
        .execute(&pool)
        .await
        .unwrap_err();
    pool.close().await;
    assert!(err.to_string().to_lowercase().contains("readonly"), "{}", err);
}

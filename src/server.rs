//! Read-only HTTP API over the marts.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/api/reports/top-products?limit=` | Most frequent terms in message bodies |
//! | `GET`  | `/api/channels/{channel_name}/activity` | Messages per day for one channel |
//! | `GET`  | `/api/search/messages?query=&limit=` | Substring search, newest first |
//! | `GET`  | `/api/reports/visual-content` | Detections and mean confidence per channel |
//! | `GET`  | `/messages?limit=` | Raw messages (legacy) |
//! | `GET`  | `/image-detections?limit=` | Raw detections (legacy) |
//! | `GET`  | `/analytics/channels` | Per-channel message analytics (legacy) |
//! | `GET`  | `/analytics/image-detections` | Per-category detection analytics (legacy) |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "channel not found: ghost" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `internal` (500).
//!
//! Malformed query strings and path segments are `bad_request` in the same
//! shape.
//!
//! Each request opens its own read-only store handle and closes it before
//! responding, whether the query succeeded or not. The server never creates
//! or migrates the store.

use axum::{
    extract::{
        rejection::{PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::db;
use crate::query::{self, QueryError};

/// Legacy listings default to this many rows.
const LEGACY_DEFAULT_LIMIT: i64 = 20;

/// Builds the router. The configuration is the only shared state.
pub fn router(config: Arc<Config>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/reports/top-products", get(handle_top_products))
        .route("/api/channels/{channel_name}/activity", get(handle_channel_activity))
        .route("/api/search/messages", get(handle_search_messages))
        .route("/api/reports/visual-content", get(handle_visual_content))
        .route("/messages", get(handle_messages))
        .route("/image-detections", get(handle_image_detections))
        .route("/analytics/channels", get(handle_channel_analytics))
        .route("/analytics/image-detections", get(handle_detection_analytics))
        .route("/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(config)
}

/// Binds to `[server].bind` and serves until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let app = router(Arc::new(config.clone()));

    println!("mart API listening on http://{}", bind_addr);
    tracing::info!(%bind_addr, db = %config.db.path.display(), "serving");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Runs one query against a fresh pool and closes the pool on every path.
async fn with_pool<T, F, Fut>(config: &Config, f: F) -> Result<T, AppError>
where
    F: FnOnce(SqlitePool) -> Fut,
    Fut: Future<Output = (SqlitePool, Result<T, QueryError>)>,
{
    let pool = db::connect_read_only(config).await.map_err(internal)?;
    let (pool, result) = f(pool).await;
    pool.close().await;
    result.map_err(AppError::from)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(message = %self.message, "request failed");
        }
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<QueryError> for AppError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::ChannelNotFound(_) => AppError {
                status: StatusCode::NOT_FOUND,
                code: "not_found",
                message: err.to_string(),
            },
            QueryError::InvalidArgument(_) => bad_request(err.to_string()),
            QueryError::Database(_) => internal(err),
        }
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        bad_request(rejection.body_text())
    }
}

impl From<PathRejection> for AppError {
    fn from(rejection: PathRejection) -> Self {
        bad_request(rejection.body_text())
    }
}

fn bad_request(message: String) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message,
    }
}

fn internal(err: impl std::fmt::Display) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: err.to_string(),
    }
}

// ============ Parameters ============

#[derive(Debug, Deserialize)]
struct LimitParams {
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    query: Option<String>,
    limit: Option<i64>,
}

// ============ Mart endpoints ============

async fn handle_top_products(
    State(config): State<Arc<Config>>,
    params: Result<Query<LimitParams>, QueryRejection>,
) -> Result<Json<Vec<query::TopTerm>>, AppError> {
    let Query(params) = params?;
    let limit = query::normalize_limit(
        params.limit,
        config.query.top_terms_limit,
        config.query.max_limit,
    )?;
    let terms = with_pool(&config, |pool| async move {
        let r = query::top_terms(&pool, limit).await;
        (pool, r)
    })
    .await?;
    Ok(Json(terms))
}

async fn handle_channel_activity(
    State(config): State<Arc<Config>>,
    channel_name: Result<Path<String>, PathRejection>,
) -> Result<Json<Vec<query::ChannelActivity>>, AppError> {
    let Path(channel_name) = channel_name?;
    let activity = with_pool(&config, |pool| async move {
        let r = query::channel_activity(&pool, &channel_name).await;
        (pool, r)
    })
    .await?;
    Ok(Json(activity))
}

async fn handle_search_messages(
    State(config): State<Arc<Config>>,
    params: Result<Query<SearchParams>, QueryRejection>,
) -> Result<Json<Vec<query::MessageSearchResult>>, AppError> {
    let Query(params) = params?;
    let limit = query::normalize_limit(
        params.limit,
        config.query.search_limit,
        config.query.max_limit,
    )?;
    let needle = params.query.unwrap_or_default();
    let results = with_pool(&config, |pool| async move {
        let r = query::search_messages(&pool, &needle, limit).await;
        (pool, r)
    })
    .await?;
    Ok(Json(results))
}

async fn handle_visual_content(
    State(config): State<Arc<Config>>,
) -> Result<Json<Vec<query::VisualContentStat>>, AppError> {
    let stats = with_pool(&config, |pool| async move {
        let r = query::visual_content_stats(&pool).await;
        (pool, r)
    })
    .await?;
    Ok(Json(stats))
}

// ============ Legacy endpoints ============

async fn handle_messages(
    State(config): State<Arc<Config>>,
    params: Result<Query<LimitParams>, QueryRejection>,
) -> Result<Json<Vec<query::MessageRow>>, AppError> {
    let Query(params) = params?;
    let limit = query::normalize_limit(params.limit, LEGACY_DEFAULT_LIMIT, config.query.max_limit)?;
    let rows = with_pool(&config, |pool| async move {
        let r = query::list_messages(&pool, limit).await;
        (pool, r)
    })
    .await?;
    Ok(Json(rows))
}

async fn handle_image_detections(
    State(config): State<Arc<Config>>,
    params: Result<Query<LimitParams>, QueryRejection>,
) -> Result<Json<Vec<query::DetectionRow>>, AppError> {
    let Query(params) = params?;
    let limit = query::normalize_limit(params.limit, LEGACY_DEFAULT_LIMIT, config.query.max_limit)?;
    let rows = with_pool(&config, |pool| async move {
        let r = query::list_detections(&pool, limit).await;
        (pool, r)
    })
    .await?;
    Ok(Json(rows))
}

async fn handle_channel_analytics(
    State(config): State<Arc<Config>>,
) -> Result<Json<Vec<query::ChannelAnalytics>>, AppError> {
    let rows = with_pool(&config, |pool| async move {
        let r = query::channel_analytics(&pool).await;
        (pool, r)
    })
    .await?;
    Ok(Json(rows))
}

async fn handle_detection_analytics(
    State(config): State<Arc<Config>>,
) -> Result<Json<Vec<query::DetectionAnalytics>>, AppError> {
    let rows = with_pool(&config, |pool| async move {
        let r = query::detection_analytics(&pool).await;
        (pool, r)
    })
    .await?;
    Ok(Json(rows))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

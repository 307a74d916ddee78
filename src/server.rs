//! HTTP search API.
//!
//! Exposes the embedding-cache search over JSON, plus a health check.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/search/{corpus}` | Rank a query against a corpus cache |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404),
//! `embeddings_disabled` (400), `internal` (500).
//!
//! # Warm-up
//!
//! Boot launches one fire-and-forget warm-up task per configured corpus, so
//! caches are usually hot before the first request. The search handler
//! re-triggers warm-up defensively (a no-op once warming or warmed) and
//! serves from whatever is currently published; it never blocks a request
//! on a build.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser-based
//! clients.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::blobstore::{self, BlobStore};
use crate::cache;
use crate::config::Config;
use crate::db;
use crate::embedding;
use crate::models::SearchResponse;
use crate::search;
use crate::warmup::CacheManager;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    pool: SqlitePool,
    store: Arc<dyn BlobStore>,
    manager: Arc<CacheManager>,
}

/// Starts the HTTP search server.
///
/// Binds to `[server].bind`, spawns a warm-up task per corpus, and serves
/// until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let config = Arc::new(config.clone());

    let pool = db::connect(&config).await?;
    let store = blobstore::create_store(&config.storage, &config.cache)?;
    let manager = Arc::new(CacheManager::new(&config.corpora));

    let state = AppState {
        config: config.clone(),
        pool,
        store,
        manager,
    };

    for corpus in &config.corpora {
        spawn_warmup(&state, corpus);
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/search/{corpus}", post(handle_search))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    println!("Search server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Fire-and-forget warm-up for one corpus. Failures are logged, never
/// propagated; the guard is released inside `ensure_warm` so a later
/// trigger retries.
fn spawn_warmup(state: &AppState, corpus: &str) {
    let manager = state.manager.clone();
    let cache_cfg = state.config.cache.clone();
    let pool = state.pool.clone();
    let store = state.store.clone();
    let corpus = corpus.to_string();

    tokio::spawn(async move {
        let result = manager
            .ensure_warm(&corpus, || {
                cache::build_cache(&cache_cfg, &pool, store, &corpus)
            })
            .await;
        match result {
            Ok(true) => tracing::info!(corpus, "cache warmed"),
            Ok(false) => {}
            Err(e) => tracing::warn!(corpus, error = %e, "cache warm-up failed"),
        }
    });
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

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(code: &str, message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: code.to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
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

// ============ POST /search/{corpus} ============

/// JSON request body for `POST /search/{corpus}`.
///
/// Exactly one of `query` (embedded server-side) or `vector` (pre-computed)
/// should be supplied; `vector` wins when both are present.
#[derive(Deserialize)]
struct SearchRequest {
    query: Option<String>,
    vector: Option<Vec<f32>>,
    limit: Option<i64>,
    threshold: Option<f32>,
}

async fn handle_search(
    State(state): State<AppState>,
    Path(corpus): Path<String>,
    payload: Result<Json<SearchRequest>, JsonRejection>,
) -> Result<Json<SearchResponse>, AppError> {
    // A malformed body must answer with the same error envelope as every
    // other failure, not axum's default rejection text.
    let Json(request) = payload.map_err(|e| bad_request("bad_request", e.body_text()))?;

    if state.config.corpus(&corpus).is_err() {
        return Err(not_found(format!("unknown corpus: {}", corpus)));
    }

    // Defensive re-trigger: a no-op unless boot warm-up was lost or failed.
    spawn_warmup(&state, &corpus);

    let raw = match (request.vector, request.query) {
        (Some(vector), _) => Some(vector),
        (None, Some(text)) if !text.trim().is_empty() => {
            if !state.config.embedding.is_enabled() {
                return Err(bad_request(
                    "embeddings_disabled",
                    "embeddings are disabled; send a pre-computed vector instead",
                ));
            }
            let vector = embedding::embed_query(&state.config.embedding, &text)
                .await
                .map_err(|e| internal(format!("embedding failed: {}", e)))?;
            Some(vector)
        }
        _ => None,
    };

    // An empty or zero-norm query is an empty result, not an error.
    let query = match raw.as_deref().and_then(embedding::normalize_l2) {
        Some(v) => v,
        None => return Ok(Json(SearchResponse::empty())),
    };

    let entries = state.manager.current(&corpus);
    let limit = request.limit.unwrap_or(state.config.search.default_limit);
    let threshold = request
        .threshold
        .unwrap_or(state.config.search.score_threshold);

    let response = search::search_corpus(&state.pool, &corpus, &entries, &query, limit, threshold)
        .await
        .map_err(|e| internal(format!("search failed: {}", e)))?;

    Ok(Json(response))
}

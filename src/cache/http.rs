//! Cache role HTTP surface

use crate::cache::server::CacheServer;
use crate::common::{Metrics, PeerSet};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Router;
use serde_json::json;
use std::sync::Arc;

/// Shared cache-role state for HTTP handlers.
#[derive(Clone)]
pub struct CacheHttpState {
    pub server: Arc<CacheServer>,
    pub peers: Arc<PeerSet>,
    pub metrics: Arc<Metrics>,
}

/// Creates the HTTP router with all cache endpoints.
pub fn create_router(state: CacheHttpState) -> Router {
    Router::new()
        .route("/cache/:key", axum::routing::get(get_key))
        .route("/cache/:key", axum::routing::put(put_key))
        .route("/cache/:key", axum::routing::delete(delete_key))
        .route("/cache/:key/status", axum::routing::get(key_status))
        .route("/cache-metrics", axum::routing::get(cache_metrics))
        .route("/health", axum::routing::get(health))
        .route("/status", axum::routing::get(node_status))
        .route("/metrics", axum::routing::get(metrics))
        .with_state(state)
}

async fn get_key(
    State(state): State<CacheHttpState>,
    Path(key): Path<String>,
) -> impl IntoResponse {
    match state.server.get(&key).await {
        Ok(result) => match result.value {
            Some(value) => (
                StatusCode::OK,
                axum::Json(json!({
                    "key": key,
                    "value": String::from_utf8_lossy(&value),
                    "state": result.state.map(|s| s.as_str()),
                    "miss": false,
                })),
            ),
            None => (
                StatusCode::NOT_FOUND,
                axum::Json(json!({ "key": key, "value": null, "miss": true })),
            ),
        },
        Err(e) => error_response(e),
    }
}

async fn put_key(
    State(state): State<CacheHttpState>,
    Path(key): Path<String>,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    match state.server.put(&key, body.to_vec()).await {
        Ok(()) => (
            StatusCode::OK,
            axum::Json(json!({ "ok": true, "key": key, "state": "M" })),
        ),
        Err(e) => error_response(e),
    }
}

async fn delete_key(
    State(state): State<CacheHttpState>,
    Path(key): Path<String>,
) -> impl IntoResponse {
    match state.server.delete(&key).await {
        Ok(found) => (
            StatusCode::OK,
            axum::Json(json!({ "ok": true, "key": key, "existed": found })),
        ),
        Err(e) => error_response(e),
    }
}

async fn key_status(
    State(state): State<CacheHttpState>,
    Path(key): Path<String>,
) -> impl IntoResponse {
    match state.server.state_of(&key) {
        Some(line_state) => axum::Json(json!({
            "key": key,
            "exists": true,
            "state": line_state.as_str(),
        })),
        None => axum::Json(json!({
            "key": key,
            "exists": false,
            "state": null,
        })),
    }
}

async fn cache_metrics(State(state): State<CacheHttpState>) -> impl IntoResponse {
    let view = state.server.metrics_view();
    axum::Json(json!({
        "node_id": state.server.node_id(),
        "hits": view.hits,
        "misses": view.misses,
        "hit_rate": view.hit_rate,
        "cache_size": view.size,
        "capacity": view.capacity,
        "evictions": view.evictions,
        "state_distribution": {
            "M": view.modified,
            "E": view.exclusive,
            "S": view.shared,
            "I": view.invalid,
        },
    }))
}

async fn health(State(state): State<CacheHttpState>) -> impl IntoResponse {
    axum::Json(json!({
        "ok": true,
        "node_id": state.server.node_id(),
        "role": "cache",
    }))
}

async fn node_status(State(state): State<CacheHttpState>) -> impl IntoResponse {
    axum::Json(json!({
        "node_id": state.server.node_id(),
        "role": "cache",
        "peers": state.peers.ids(),
        "partition_detected": false,
    }))
}

async fn metrics(State(state): State<CacheHttpState>) -> impl IntoResponse {
    (StatusCode::OK, state.metrics.render())
}

fn error_response(e: crate::Error) -> (StatusCode, axum::Json<serde_json::Value>) {
    (
        e.to_http_status(),
        axum::Json(json!({ "ok": false, "error": e.to_string() })),
    )
}

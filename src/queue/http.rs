//! Queue role HTTP surface

use crate::common::{Metrics, PeerSet};
use crate::queue::server::QueueServer;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

/// Shared queue-role state for HTTP handlers.
#[derive(Clone)]
pub struct QueueHttpState {
    pub server: Arc<QueueServer>,
    pub peers: Arc<PeerSet>,
    pub metrics: Arc<Metrics>,
}

/// Creates the HTTP router with all queue endpoints.
pub fn create_router(state: QueueHttpState) -> Router {
    Router::new()
        .route("/queue/enqueue", axum::routing::post(enqueue))
        .route("/queue/dequeue", axum::routing::post(dequeue))
        .route("/queue/ack", axum::routing::post(ack))
        .route("/queue/status/:name", axum::routing::get(queue_status))
        .route("/queue/all", axum::routing::get(all_queues))
        .route("/health", axum::routing::get(health))
        .route("/status", axum::routing::get(node_status))
        .route("/metrics", axum::routing::get(metrics))
        .with_state(state)
}

#[derive(Deserialize)]
struct EnqueueRequest {
    queue_name: String,
    message: serde_json::Value,
}

#[derive(Deserialize)]
struct DequeueRequest {
    queue_name: String,
}

#[derive(Deserialize)]
struct AckRequest {
    msg_id: String,
}

async fn enqueue(
    State(state): State<QueueHttpState>,
    axum::Json(req): axum::Json<EnqueueRequest>,
) -> impl IntoResponse {
    let payload = match serde_json::to_vec(&req.message) {
        Ok(bytes) => bytes,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                axum::Json(json!({ "success": false, "error": e.to_string() })),
            )
        }
    };

    match state.server.enqueue(&req.queue_name, payload).await {
        Ok(result) => (
            StatusCode::OK,
            axum::Json(json!({
                "success": true,
                "msg_id": result.msg_id,
                "queue_name": req.queue_name,
                "node_id": result.owner,
            })),
        ),
        Err(e) => error_response(e),
    }
}

async fn dequeue(
    State(state): State<QueueHttpState>,
    axum::Json(req): axum::Json<DequeueRequest>,
) -> impl IntoResponse {
    match state.server.dequeue(&req.queue_name) {
        Ok(Some(delivered)) => {
            // Payloads are JSON on this surface; fall back to a string for
            // anything that is not
            let message: serde_json::Value = serde_json::from_slice(&delivered.message.payload)
                .unwrap_or_else(|_| {
                    serde_json::Value::String(
                        String::from_utf8_lossy(&delivered.message.payload).to_string(),
                    )
                });
            (
                StatusCode::OK,
                axum::Json(json!({
                    "success": true,
                    "msg_id": delivered.message.msg_id,
                    "message": message,
                    "attempt_count": delivered.message.attempt_count,
                    "delivery_time": delivered.delivered_at_ms,
                })),
            )
        }
        Ok(None) => (
            StatusCode::OK,
            axum::Json(json!({
                "success": false,
                "message": null,
                "msg_id": null,
            })),
        ),
        Err(e) => error_response(e),
    }
}

async fn ack(
    State(state): State<QueueHttpState>,
    axum::Json(req): axum::Json<AckRequest>,
) -> impl IntoResponse {
    match state.server.ack(&req.msg_id) {
        Ok(true) => (
            StatusCode::OK,
            axum::Json(json!({
                "success": true,
                "message": format!("message {} acknowledged", req.msg_id),
            })),
        ),
        // Unknown id: a double-ack and an unknown id are indistinguishable
        // to the caller, so report success
        Ok(false) => (
            StatusCode::OK,
            axum::Json(json!({
                "success": true,
                "message": format!("message {} not found (already acknowledged?)", req.msg_id),
            })),
        ),
        Err(e) => error_response(e),
    }
}

async fn queue_status(
    State(state): State<QueueHttpState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.server.status(&name) {
        Ok(view) => (
            StatusCode::OK,
            axum::Json(json!({
                "queue_name": view.queue_name,
                "size": view.ready,
                "in_flight": view.in_flight,
                "node_id": state.server.node_id(),
            })),
        ),
        Err(e) => error_response(e),
    }
}

async fn all_queues(State(state): State<QueueHttpState>) -> impl IntoResponse {
    let views = state.server.all_queues();
    let total_queues = views.len();
    let total_messages: usize = views.iter().map(|v| v.ready).sum();
    let total_in_flight: usize = views.iter().map(|v| v.in_flight).sum();
    axum::Json(json!({
        "node_id": state.server.node_id(),
        "queues": views,
        "total_queues": total_queues,
        "total_messages": total_messages,
        "total_in_flight": total_in_flight,
    }))
}

async fn health(State(state): State<QueueHttpState>) -> impl IntoResponse {
    axum::Json(json!({
        "ok": !state.server.is_poisoned(),
        "node_id": state.server.node_id(),
        "role": "queue",
    }))
}

async fn node_status(State(state): State<QueueHttpState>) -> impl IntoResponse {
    axum::Json(json!({
        "node_id": state.server.node_id(),
        "role": "queue",
        "ring_nodes": state.server.ring().node_ids(),
        "peers": state.peers.ids(),
        "partition_detected": false,
    }))
}

async fn metrics(State(state): State<QueueHttpState>) -> impl IntoResponse {
    (StatusCode::OK, state.metrics.render())
}

fn error_response(e: crate::Error) -> (StatusCode, axum::Json<serde_json::Value>) {
    let body = match &e {
        crate::Error::WrongNode(owner) => json!({
            "success": false,
            "error": e.to_string(),
            "owner_hint": owner,
        }),
        _ => json!({ "success": false, "error": e.to_string() }),
    };
    (e.to_http_status(), axum::Json(body))
}

//! Lock role HTTP surface
//!
//! Thin translation layer: requests become engine operations, errors map to
//! HTTP statuses. A follower receiving a write forwards it to the known
//! leader over gRPC and relays the answer.

use crate::common::{Metrics, PeerSet};
use crate::lock::server::{AcquireOutcome, LockServer};
use crate::lock::state::LockMode;
use crate::proto::LockForwardRequest;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Shared lock-role state for HTTP handlers.
#[derive(Clone)]
pub struct LockHttpState {
    pub server: Arc<LockServer>,
    pub peers: Arc<PeerSet>,
    pub metrics: Arc<Metrics>,
}

/// Creates the HTTP router with all lock endpoints.
pub fn create_router(state: LockHttpState) -> Router {
    Router::new()
        .route("/locks/acquire", axum::routing::post(acquire_lock))
        .route("/locks/release", axum::routing::post(release_lock))
        .route("/locks/:resource", axum::routing::get(lock_status))
        .route("/locks", axum::routing::get(all_locks))
        .route("/health", axum::routing::get(health))
        .route("/status", axum::routing::get(node_status))
        .route("/metrics", axum::routing::get(metrics))
        .with_state(state)
}

#[derive(Deserialize)]
struct AcquireRequest {
    resource: String,
    client_id: String,
    #[serde(default = "default_mode")]
    mode: String,
    wait_timeout_ms: Option<u64>,
    ttl_ms: Option<u64>,
}

fn default_mode() -> String {
    "exclusive".to_string()
}

#[derive(Deserialize)]
struct ReleaseRequest {
    resource: String,
    client_id: String,
}

async fn acquire_lock(
    State(state): State<LockHttpState>,
    axum::Json(req): axum::Json<AcquireRequest>,
) -> impl IntoResponse {
    let mode: LockMode = match req.mode.parse() {
        Ok(mode) => mode,
        Err(e) => return error_response(e),
    };
    let wait_timeout = req.wait_timeout_ms.map(Duration::from_millis);
    let ttl = req.ttl_ms.map(Duration::from_millis);

    let started = std::time::Instant::now();
    let result = state
        .server
        .acquire(&req.resource, &req.client_id, mode, wait_timeout, ttl)
        .await;
    state
        .metrics
        .histogram("minicoord_lock_acquire_ms")
        .observe(started.elapsed().as_secs_f64() * 1000.0);

    match result {
        Ok(outcome) => outcome_response(outcome),
        Err(crate::Error::NotLeader(hint)) => {
            forward_to_leader(
                &state,
                &hint,
                LockForwardRequest {
                    op: "acquire".to_string(),
                    resource: req.resource,
                    client_id: req.client_id,
                    mode: req.mode,
                    wait_timeout_ms: req.wait_timeout_ms.unwrap_or(0),
                    ttl_ms: req.ttl_ms.unwrap_or(0),
                },
            )
            .await
        }
        Err(e) => error_response(e),
    }
}

async fn release_lock(
    State(state): State<LockHttpState>,
    axum::Json(req): axum::Json<ReleaseRequest>,
) -> impl IntoResponse {
    match state.server.release(&req.resource, &req.client_id).await {
        Ok(()) => (
            StatusCode::OK,
            axum::Json(json!({ "success": true, "message": "lock released" })),
        ),
        Err(crate::Error::NotLeader(hint)) => {
            forward_to_leader(
                &state,
                &hint,
                LockForwardRequest {
                    op: "release".to_string(),
                    resource: req.resource,
                    client_id: req.client_id,
                    mode: String::new(),
                    wait_timeout_ms: 0,
                    ttl_ms: 0,
                },
            )
            .await
        }
        Err(e) => error_response(e),
    }
}

/// Relay a write to the leader; without a reachable leader the caller gets
/// the redirect hint and retries itself.
async fn forward_to_leader(
    state: &LockHttpState,
    hint: &str,
    req: LockForwardRequest,
) -> (StatusCode, axum::Json<serde_json::Value>) {
    let Some(peer) = state.peers.get(hint) else {
        return (
            StatusCode::TEMPORARY_REDIRECT,
            axum::Json(json!({
                "success": false,
                "error": "not leader",
                "leader_hint": hint,
            })),
        );
    };

    match peer.lock_forward(req).await {
        Ok(resp) => {
            let success = resp.status == "granted" || resp.status == "ok";
            let code = if success || resp.status == "waiting" {
                StatusCode::OK
            } else {
                StatusCode::CONFLICT
            };
            (
                code,
                axum::Json(json!({
                    "success": success,
                    "status": resp.status,
                    "message": resp.message,
                    "lock_id": if resp.lock_id.is_empty() { None } else { Some(resp.lock_id) },
                    "leader_hint": if resp.leader_hint.is_empty() { None } else { Some(resp.leader_hint) },
                })),
            )
        }
        Err(e) => error_response(e),
    }
}

fn outcome_response(outcome: AcquireOutcome) -> (StatusCode, axum::Json<serde_json::Value>) {
    match outcome {
        AcquireOutcome::Granted { lock_id } => (
            StatusCode::OK,
            axum::Json(json!({
                "success": true,
                "status": "granted",
                "message": "lock acquired",
                "lock_id": lock_id,
            })),
        ),
        AcquireOutcome::Waiting { position } => (
            StatusCode::OK,
            axum::Json(json!({
                "success": false,
                "status": "waiting",
                "message": "request queued",
                "position": position,
            })),
        ),
        AcquireOutcome::Denied { reason } => (
            StatusCode::CONFLICT,
            axum::Json(json!({
                "success": false,
                "status": "denied",
                "message": reason,
            })),
        ),
    }
}

fn error_response(e: crate::Error) -> (StatusCode, axum::Json<serde_json::Value>) {
    (
        e.to_http_status(),
        axum::Json(json!({ "success": false, "error": e.to_string() })),
    )
}

async fn lock_status(
    State(state): State<LockHttpState>,
    Path(resource): Path<String>,
) -> impl IntoResponse {
    let view = state.server.status(&resource);
    axum::Json(json!({
        "resource": view.resource,
        "mode": view.mode,
        "holders": view.holders,
        "acquired_at_ms": view.acquired_at_ms,
        "queue_len": view.queue_len,
    }))
}

async fn all_locks(State(state): State<LockHttpState>) -> impl IntoResponse {
    axum::Json(json!({ "locks": state.server.all_locks() }))
}

/// Health check endpoint with role and leadership.
async fn health(State(state): State<LockHttpState>) -> impl IntoResponse {
    let raft = state.server.raft();
    axum::Json(json!({
        "ok": true,
        "node_id": state.server.node_id(),
        "role": "lock",
        "is_leader": raft.is_leader(),
    }))
}

/// Raft-level status for operators.
async fn node_status(State(state): State<LockHttpState>) -> impl IntoResponse {
    let status = state.server.raft().status();
    axum::Json(json!({
        "node_id": state.server.node_id(),
        "role": "lock",
        "state": status.role.to_string(),
        "is_leader": status.role == crate::raft::RaftRole::Leader,
        "term": status.term,
        "leader_id": status.leader_id,
        "commit_index": status.commit_index,
        "last_applied": status.last_applied,
        "peers": state.peers.ids(),
        "partition_detected": status.partition_detected,
    }))
}

/// Prometheus metrics endpoint.
async fn metrics(State(state): State<LockHttpState>) -> impl IntoResponse {
    (StatusCode::OK, state.metrics.render())
}

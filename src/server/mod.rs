// Copyright (c) The LedgerMirror Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! HTTP read/write surface.
//!
//! Reads are served from the mirror (cache via the syncer) or joined
//! through the ops tables; writes flow through the rejecting dedup
//! table. Before the first successful sync cycle the contract routes
//! answer 503 with a typed body instead of blocking.

use crate::error::MirrorError;
use crate::gateway::LedgerGateway;
use crate::metrics::MirrorMetrics;
use crate::ops::ContractOps;
use crate::syncer::StateSyncer;
use crate::types::{now_ms, LedgerEvent, SnapshotSet, SyncStatus, TxReceipt};
use axum::extract::{MatchedPath, Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use prometheus::{Registry, TextEncoder};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

const DEFAULT_EVENT_LIMIT: usize = 50;

pub struct AppState {
    pub syncer: Arc<StateSyncer>,
    pub ops: Arc<ContractOps>,
    pub gateway: Arc<dyn LedgerGateway>,
    pub metrics: Arc<MirrorMetrics>,
    pub registry: Registry,
    /// Default age cutoff for `DELETE /api/events/cleanup`
    pub retention_days: u64,
}

pub async fn run_server(
    socket_address: SocketAddr,
    state: Arc<AppState>,
) -> Result<JoinHandle<()>, MirrorError> {
    let listener = tokio::net::TcpListener::bind(socket_address)
        .await
        .map_err(|e| MirrorError::Generic(format!("Failed to bind {}: {}", socket_address, e)))?;
    info!("HTTP server listening on {}", socket_address);
    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, make_router(state).into_make_service()).await {
            error!("HTTP server exited: {}", e);
        }
    }))
}

pub(crate) fn make_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/contracts", get(get_contracts))
        .route("/api/contracts/status", get(get_sync_status))
        .route("/api/contracts/sync", post(trigger_sync))
        .route("/api/events", get(get_events))
        .route("/api/events/stats", get(get_event_stats))
        .route("/api/events/cleanup", delete(cleanup_events))
        .route("/api/todos", get(get_todos).post(add_todo))
        .route("/api/todos/:index/complete", post(complete_todo))
        .route("/api/counter", get(get_counter))
        .route("/api/counter/:action", post(counter_action))
        .route("/api/greeting", get(get_greeting).put(set_greeting))
        .route("/api/pending", get(get_pending).delete(clear_pending))
        .route("/metrics", get(export_metrics))
        .route_layer(middleware::from_fn_with_state(state.clone(), track_requests))
        .with_state(state)
}

async fn track_requests(
    State(state): State<Arc<AppState>>,
    matched_path: Option<MatchedPath>,
    request: Request,
    next: Next,
) -> Response {
    let route = matched_path
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    state.metrics.requests_received.with_label_values(&[&route]).inc();
    let response = next.run(request).await;
    if response.status().is_client_error() || response.status().is_server_error() {
        state
            .metrics
            .err_requests
            .with_label_values(&[&route, response.status().as_str()])
            .inc();
    }
    response
}

impl IntoResponse for MirrorError {
    fn into_response(self) -> Response {
        let status = match &self {
            MirrorError::NotYetSynced => StatusCode::SERVICE_UNAVAILABLE,
            MirrorError::DuplicateOperation(_) => StatusCode::CONFLICT,
            MirrorError::Gateway { .. } => StatusCode::BAD_GATEWAY,
            MirrorError::Cache(_) | MirrorError::Generic(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({
            "error": self.to_string(),
            "type": self.error_type(),
        }));
        (status, body).into_response()
    }
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let connectivity = state.gateway.check_connectivity().await;
    let sync = state.syncer.status().await;
    let status = if connectivity.connected { "ok" } else { "degraded" };
    Json(json!({
        "status": status,
        "connectivity": connectivity,
        "sync": sync,
    }))
}

async fn get_contracts(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SnapshotSet>, MirrorError> {
    Ok(Json(state.syncer.snapshots().await?))
}

async fn get_sync_status(State(state): State<Arc<AppState>>) -> Json<SyncStatus> {
    Json(state.syncer.status().await)
}

async fn trigger_sync(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SnapshotSet>, MirrorError> {
    Ok(Json(state.syncer.sync_now().await?))
}

#[derive(Deserialize)]
struct EventsQuery {
    limit: Option<usize>,
    contract: Option<String>,
}

async fn get_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Json<Vec<LedgerEvent>> {
    let limit = query.limit.unwrap_or(DEFAULT_EVENT_LIMIT);
    Json(state.syncer.events(limit, query.contract.as_deref()).await)
}

async fn get_event_stats(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let events = state.syncer.events(usize::MAX, None).await;
    let day_ago = now_ms().saturating_sub(24 * 60 * 60 * 1_000);

    let mut by_event_type: BTreeMap<String, u64> = BTreeMap::new();
    let mut by_contract: BTreeMap<String, u64> = BTreeMap::new();
    let mut recent_24h = 0u64;
    for event in &events {
        let type_key = format!("{}.{}", event.contract, event.event_name);
        *by_event_type.entry(type_key).or_default() += 1;
        *by_contract.entry(event.contract.clone()).or_default() += 1;
        if event.timestamp_ms >= day_ago {
            recent_24h += 1;
        }
    }

    // Log is newest first
    Json(json!({
        "total": events.len(),
        "recent_24h": recent_24h,
        "by_event_type": by_event_type,
        "by_contract": by_contract,
        "latest_event": events.first(),
        "oldest_event": events.last(),
    }))
}

#[derive(Deserialize)]
struct CleanupQuery {
    days: Option<u64>,
}

async fn cleanup_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CleanupQuery>,
) -> Result<Json<serde_json::Value>, MirrorError> {
    let days = query.days.unwrap_or(state.retention_days);
    let removed = state.syncer.purge_events(days).await?;
    Ok(Json(json!({ "removed": removed, "days": days })))
}

async fn get_todos(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, MirrorError> {
    Ok(Json(state.ops.todo_list().await?))
}

#[derive(Deserialize)]
struct AddTodoRequest {
    content: String,
}

async fn add_todo(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AddTodoRequest>,
) -> Result<Json<TxReceipt>, MirrorError> {
    Ok(Json(state.ops.add_todo(&body.content).await?))
}

async fn complete_todo(
    State(state): State<Arc<AppState>>,
    Path(index): Path<u64>,
) -> Result<Json<TxReceipt>, MirrorError> {
    Ok(Json(state.ops.complete_todo(index).await?))
}

async fn get_counter(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, MirrorError> {
    Ok(Json(state.ops.counter().await?))
}

async fn counter_action(
    State(state): State<Arc<AppState>>,
    Path(action): Path<String>,
) -> Response {
    let result = match action.as_str() {
        "increment" => state.ops.increment_counter().await,
        "decrement" => state.ops.decrement_counter().await,
        "reset" => state.ops.reset_counter().await,
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("unknown counter action {}", action) })),
            )
                .into_response();
        }
    };
    match result {
        Ok(receipt) => Json(receipt).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn get_greeting(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, MirrorError> {
    Ok(Json(state.ops.greeting().await?))
}

#[derive(Deserialize)]
struct SetGreetingRequest {
    greeting: String,
}

async fn set_greeting(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SetGreetingRequest>,
) -> Result<Json<TxReceipt>, MirrorError> {
    Ok(Json(state.ops.set_greeting(&body.greeting).await?))
}

async fn get_pending(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({ "pending": state.ops.pending_keys() }))
}

async fn clear_pending(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({ "cleared": state.ops.clear_all_pending() }))
}

async fn export_metrics(State(state): State<Arc<AppState>>) -> Response {
    match TextEncoder::new().encode_to_string(&state.registry.gather()) {
        Ok(text) => text.into_response(),
        Err(e) => MirrorError::Generic(format!("Failed to encode metrics: {}", e)).into_response(),
    }
}

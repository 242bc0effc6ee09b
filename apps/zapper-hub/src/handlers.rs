//! HTTP surface: health probe, debug stats, Prometheus scrape endpoint,
//! and the websocket mount point.

use std::sync::Arc;

use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::arbiter::RoleArbiter;
use crate::broadcast::ChannelBroadcaster;
use crate::gateway;

#[derive(Clone)]
pub struct AppState {
    pub arbiter: Arc<RoleArbiter>,
    pub broadcaster: Arc<ChannelBroadcaster>,
    pub metrics: PrometheusHandle,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws/:account_id", get(gateway::ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    active_accounts: usize,
    active_connections: usize,
    accounts: Vec<AccountStatsEntry>,
}

#[derive(Debug, Serialize)]
struct AccountStatsEntry {
    account_id: String,
    connections: usize,
}

async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mut accounts: Vec<AccountStatsEntry> = state
        .broadcaster
        .connection_counts()
        .into_iter()
        .map(|(account_id, connections)| AccountStatsEntry {
            account_id,
            connections,
        })
        .collect();
    accounts.sort_by(|a, b| a.account_id.cmp(&b.account_id));
    let active_connections = accounts.iter().map(|entry| entry.connections).sum();
    Json(StatsResponse {
        active_accounts: accounts.len(),
        active_connections,
        accounts,
    })
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let body = state.metrics.render();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

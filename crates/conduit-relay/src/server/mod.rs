//! HTTP and WebSocket surface of the relay.

pub mod agent;
pub mod auth;
pub mod error;
pub mod events;
pub mod rpc;
pub mod socket;

#[cfg(test)]
mod routes_tests;

use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::routing::{get, post};
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;

use crate::directory::ServerDirectory;
use crate::registry::ConnectionHub;

pub use error::{ApiError, ApiResult};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub hub: ConnectionHub,
    pub directory: Arc<dyn ServerDirectory>,
    pub operator_token: Arc<str>,
    /// Deadline for one proxied RPC.
    pub request_timeout: Duration,
}

impl AppState {
    /// State whose directory is the one the hub reports to.
    pub fn new(hub: ConnectionHub, operator_token: &str, request_timeout: Duration) -> Self {
        Self {
            directory: Arc::clone(hub.directory()),
            hub,
            operator_token: Arc::from(operator_token),
            request_timeout,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/agent/connect", get(agent::agent_connect))
        .route("/ws/servers/{id}/events", get(events::server_events))
        .route("/v1/servers/{id}/rpc", post(rpc::server_rpc))
        .route("/v1/servers/{id}/schema", get(rpc::server_schema))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `GET /health`
async fn health(State(state): State<AppState>) -> Json<Value> {
    let connected = state.hub.connected_servers().await.len();
    Json(json!({ "status": "ok", "connected_servers": connected }))
}

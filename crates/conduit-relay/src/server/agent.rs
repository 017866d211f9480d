//! `GET /agent/connect`: management sockets opened by agents.

use axum::extract::State;
use axum::extract::ws::{WebSocketUpgrade, rejection::WebSocketUpgradeRejection};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use tracing::{info, warn};

use super::AppState;
use super::auth;
use super::error::ApiError;
use super::socket;

/// Authenticate the agent token, then hand the upgraded socket to the hub.
///
/// The upgrade task lives as long as the management connection does.
pub async fn agent_connect(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(token) = auth::bearer_token(&headers) else {
        return ApiError::Unauthorized("authorization required".into()).into_response();
    };
    let server_id = match state.directory.server_for_agent_token(token).await {
        Ok(Some(id)) => id,
        Ok(None) => return ApiError::Unauthorized("invalid token".into()).into_response(),
        Err(e) => return ApiError::from(e).into_response(),
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            warn!(server_id = %server_id, error = %rejection, "Agent request was not a WebSocket upgrade");
            return rejection.into_response();
        }
    };

    info!(server_id = %server_id, "Agent connecting");
    let hub = state.hub;
    ws.on_upgrade(move |socket| async move {
        let conn = hub
            .register_management(&server_id, socket::into_transport(socket))
            .await;
        conn.closed().await;
        info!(server_id = %server_id, "Agent session ended");
    })
}

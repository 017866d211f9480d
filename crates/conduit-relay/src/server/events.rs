//! `GET /ws/servers/{id}/events`: viewer notification sockets.

use axum::extract::ws::{WebSocketUpgrade, rejection::WebSocketUpgradeRejection};
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use tracing::debug;

use super::AppState;
use super::auth::{self, TOKEN_SUBPROTOCOL};
use super::socket;

pub async fn server_events(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if let Err(e) = auth::require_operator(&headers, &state.operator_token) {
        return e.into_response();
    }
    let mut ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };
    // Browsers that sent the token as a subprotocol expect it echoed back.
    if auth::subprotocol_token(&headers).is_some() {
        ws = ws.protocols([TOKEN_SUBPROTOCOL]);
    }

    debug!(server_id = %server_id, "Viewer connecting");
    let hub = state.hub;
    ws.on_upgrade(move |socket| async move {
        hub.run_viewer(&server_id, socket::into_transport(socket))
            .await;
        debug!(server_id = %server_id, "Viewer disconnected");
    })
}

//! RPC proxy and schema lookup for operators.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use tracing::info;

use conduit_core::Frame;

use super::AppState;
use super::auth;
use super::error::{ApiError, ApiResult};

/// `POST /v1/servers/{id}/rpc`
///
/// Forwards one JSON-RPC request to the server's agent and returns the
/// agent's response body unchanged.
pub async fn server_rpc(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    auth::require_operator(&headers, &state.operator_token)?;

    let frame: Frame =
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let Some(method) = frame.method.clone() else {
        return Err(ApiError::BadRequest("method is required".into()));
    };

    let conn = state
        .hub
        .lookup_management(&server_id)
        .await
        .ok_or_else(|| ApiError::ServiceUnavailable("agent not connected".into()))?;

    let response = conn.call(frame, state.request_timeout).await;
    info!(
        server_id = %server_id,
        method = %method,
        ok = response.is_ok(),
        "Proxied RPC"
    );
    Ok(([(CONTENT_TYPE, "application/json")], response?).into_response())
}

/// `GET /v1/servers/{id}/schema`
///
/// Last schema the server's agent announced, or `null` before the first one.
pub async fn server_schema(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    auth::require_operator(&headers, &state.operator_token)?;
    let schema = state.directory.schema(&server_id).await?;
    Ok(Json(schema.unwrap_or(Value::Null)))
}

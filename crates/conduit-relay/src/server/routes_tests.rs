use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use conduit_core::Frame;
use conduit_core::transport::memory::{self, MemoryPeer};

use super::{AppState, build_router};
use crate::directory::ServerDirectory;
use crate::registry::test_helpers::RecordingDirectory;
use crate::registry::{ConnectionHub, HubSettings};
use crate::storage::RelayDatabase;

const OPERATOR: &str = "operator-secret";

fn state_with(directory: Arc<dyn ServerDirectory>, request_timeout: Duration) -> AppState {
    let hub = ConnectionHub::new(directory, HubSettings::default());
    AppState::new(hub, OPERATOR, request_timeout)
}

fn default_state() -> AppState {
    state_with(
        Arc::new(RecordingDirectory::default().with_agent_token("agent-tok", "s1")),
        Duration::from_secs(5),
    )
}

async fn send(state: &AppState, request: Request<Body>) -> (StatusCode, String) {
    let resp = build_router(state.clone()).oneshot(request).await.unwrap();
    let status = resp.status();
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8_lossy(&body).into_owned())
}

fn rpc_request(server_id: &str, body: &str) -> Request<Body> {
    Request::post(format!("/v1/servers/{server_id}/rpc"))
        .header("authorization", format!("Bearer {OPERATOR}"))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

/// Answer the next request the agent receives with `result`.
fn answer_next(mut agent: MemoryPeer, result: Value) -> tokio::task::JoinHandle<MemoryPeer> {
    tokio::spawn(async move {
        let text = agent.recv().await.unwrap();
        let request: Frame = serde_json::from_str(&text).unwrap();
        let response = Frame::response(request.id.unwrap(), result);
        agent.send(serde_json::to_string(&response).unwrap());
        agent
    })
}

#[tokio::test]
async fn health_reports_connected_servers() {
    let state = default_state();
    let req = || Request::get("/health").body(Body::empty()).unwrap();

    let (status, body) = send(&state, req()).await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["connected_servers"], 0);

    let (transport, _agent) = memory::pair();
    state.hub.register_management("s1", transport).await;
    let (_, body) = send(&state, req()).await;
    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["connected_servers"], 1);
}

#[tokio::test]
async fn rpc_requires_operator_token() {
    let state = default_state();
    let req = Request::post("/v1/servers/s1/rpc")
        .body(Body::from(r#"{"jsonrpc":"2.0","id":1,"method":"m"}"#))
        .unwrap();
    let (status, _) = send(&state, req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn rpc_rejects_undecodable_body() {
    let state = default_state();
    let (status, _) = send(&state, rpc_request("s1", "not json")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&state, rpc_request("s1", r#"{"jsonrpc":"2.0","id":1}"#)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn rpc_to_offline_server_is_unavailable() {
    let state = default_state();
    let (status, body) = send(
        &state,
        rpc_request("s1", r#"{"jsonrpc":"2.0","id":1,"method":"players.list"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body.contains("agent not connected"), "body: {body}");
}

#[tokio::test]
async fn rpc_returns_agent_response_verbatim() {
    let state = default_state();
    let (transport, agent) = memory::pair();
    state.hub.register_management("s1", transport).await;
    let responder = answer_next(agent, json!({"players": ["alex", "steve"]}));

    let (status, body) = send(
        &state,
        rpc_request("s1", r#"{"jsonrpc":"2.0","id":"42","method":"players.list"}"#),
    )
    .await;
    responder.await.unwrap();

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        r#"{"jsonrpc":"2.0","id":"42","result":{"players":["alex","steve"]}}"#
    );
}

#[tokio::test]
async fn rpc_without_id_gets_generated_one() {
    let state = default_state();
    let (transport, agent) = memory::pair();
    state.hub.register_management("s1", transport).await;
    let responder = answer_next(agent, json!(true));

    let (status, body) = send(
        &state,
        rpc_request("s1", r#"{"jsonrpc":"2.0","method":"server.save"}"#),
    )
    .await;
    responder.await.unwrap();

    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_str(&body).unwrap();
    assert!(body["id"].is_string());
    assert_eq!(body["result"], true);
}

#[tokio::test]
async fn rpc_timeout_is_bad_gateway() {
    let state = state_with(
        Arc::new(RecordingDirectory::default()),
        Duration::from_millis(50),
    );
    let (transport, _agent) = memory::pair();
    let conn = state.hub.register_management("s1", transport).await;

    let (status, body) = send(
        &state,
        rpc_request("s1", r#"{"jsonrpc":"2.0","id":5,"method":"slow"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(body.contains("timed out"), "body: {body}");
    assert_eq!(conn.pending_calls(), 0);
}

#[tokio::test]
async fn rpc_to_dropped_agent_is_bad_gateway() {
    let state = default_state();
    let (transport, mut agent) = memory::pair();
    state.hub.register_management("s1", transport).await;
    let dropper = tokio::spawn(async move {
        agent.recv().await.unwrap();
        drop(agent);
    });

    let (status, body) = send(
        &state,
        rpc_request("s1", r#"{"jsonrpc":"2.0","id":5,"method":"m"}"#),
    )
    .await;
    dropper.await.unwrap();
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(body.contains("Agent disconnected"), "body: {body}");
}

#[tokio::test]
async fn rpc_reusing_in_flight_id_is_conflict() {
    let state = default_state();
    let (transport, mut agent) = memory::pair();
    state.hub.register_management("s1", transport).await;

    let first = {
        let state = state.clone();
        tokio::spawn(async move {
            send(
                &state,
                rpc_request("s1", r#"{"jsonrpc":"2.0","id":7,"method":"first"}"#),
            )
            .await
        })
    };
    let text = agent.recv().await.unwrap();

    let (status, body) = send(
        &state,
        rpc_request("s1", r#"{"jsonrpc":"2.0","id":7,"method":"second"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["code"], "CONFLICT");

    let request: Frame = serde_json::from_str(&text).unwrap();
    let response = Frame::response(request.id.unwrap(), json!("done"));
    agent.send(serde_json::to_string(&response).unwrap());
    let (status, _) = first.await.unwrap();
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn schema_is_null_until_announced() {
    let db = RelayDatabase::open_in_memory().await.unwrap();
    db.create_server("s1", "Survival", "tok").await.unwrap();
    let state = state_with(Arc::new(db.clone()), Duration::from_secs(5));
    let req = |id: &str| {
        Request::get(format!("/v1/servers/{id}/schema"))
            .header("authorization", format!("Bearer {OPERATOR}"))
            .body(Body::empty())
            .unwrap()
    };

    let (status, body) = send(&state, req("s1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "null");

    db.set_server_schema("s1", r#"{"methods":[]}"#).await.unwrap();
    let (_, body) = send(&state, req("s1")).await;
    assert_eq!(serde_json::from_str::<Value>(&body).unwrap(), json!({"methods": []}));

    let (status, _) = send(&state, req("ghost")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn agent_connect_rejects_bad_tokens() {
    let state = default_state();

    let (status, _) = send(
        &state,
        Request::get("/agent/connect").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        &state,
        Request::get("/agent/connect")
            .header("authorization", "Bearer wrong")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn agent_connect_with_valid_token_requires_upgrade() {
    let state = default_state();
    let (status, _) = send(
        &state,
        Request::get("/agent/connect")
            .header("authorization", "Bearer agent-tok")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert!(status.is_client_error());
    assert_ne!(status, StatusCode::UNAUTHORIZED);
    assert!(!state.hub.is_connected("s1").await);
}

#[tokio::test]
async fn viewer_socket_requires_operator_token() {
    let state = default_state();
    let (status, _) = send(
        &state,
        Request::get("/ws/servers/s1/events")
            .header("sec-websocket-protocol", "jwt, wrong")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

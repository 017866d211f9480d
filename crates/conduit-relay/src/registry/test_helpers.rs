//! Shared test helpers for registry and server test modules.
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::directory::{DirectoryError, ServerDirectory};

#[derive(Debug, Clone, PartialEq)]
pub enum DirectoryEvent {
    Connected(String),
    Disconnected(String),
    Schema(String, Value),
}

/// In-memory [`ServerDirectory`] that records every side effect.
#[derive(Default)]
pub struct RecordingDirectory {
    events: Mutex<Vec<DirectoryEvent>>,
    tokens: Mutex<Vec<(String, String)>>,
    fail: bool,
}

impl RecordingDirectory {
    /// A directory whose every call fails with a backend error.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Accept `token` as the agent token of `server_id`.
    pub fn with_agent_token(self, token: &str, server_id: &str) -> Self {
        self.tokens
            .lock()
            .unwrap()
            .push((token.to_string(), server_id.to_string()));
        self
    }

    pub fn events(&self) -> Vec<DirectoryEvent> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: DirectoryEvent) -> Result<(), DirectoryError> {
        if self.fail {
            return Err(DirectoryError::Backend("unavailable".into()));
        }
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

#[async_trait]
impl ServerDirectory for RecordingDirectory {
    async fn mark_connected(&self, server_id: &str) -> Result<(), DirectoryError> {
        self.record(DirectoryEvent::Connected(server_id.to_string()))
    }

    async fn mark_disconnected(&self, server_id: &str) -> Result<(), DirectoryError> {
        self.record(DirectoryEvent::Disconnected(server_id.to_string()))
    }

    async fn persist_schema(&self, server_id: &str, schema: &Value) -> Result<(), DirectoryError> {
        self.record(DirectoryEvent::Schema(
            server_id.to_string(),
            schema.clone(),
        ))
    }

    async fn server_for_agent_token(&self, token: &str) -> Result<Option<String>, DirectoryError> {
        Ok(self
            .tokens
            .lock()
            .unwrap()
            .iter()
            .find(|(t, _)| t == token)
            .map(|(_, id)| id.clone()))
    }

    async fn schema(&self, server_id: &str) -> Result<Option<Value>, DirectoryError> {
        Ok(self.events().into_iter().rev().find_map(|e| match e {
            DirectoryEvent::Schema(id, schema) if id == server_id => Some(schema),
            _ => None,
        }))
    }
}

/// Poll `condition` until it holds, failing the test after two seconds.
pub async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let poll = async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(2), poll)
        .await
        .unwrap();
}

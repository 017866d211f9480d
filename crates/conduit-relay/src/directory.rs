//! Server directory: the persistence collaborator the hub reports to.
//!
//! The hub only needs a handful of side effects (connection state and the
//! announced schema); the HTTP layer additionally resolves agent tokens and
//! reads schemas back. Failures are reported to the caller, which logs them.

use async_trait::async_trait;
use serde_json::Value;

use crate::storage::{DatabaseError, RelayDatabase};

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Directory backend error: {0}")]
    Backend(String),
}

impl From<DatabaseError> for DirectoryError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::NotFound(what) => Self::NotFound(what),
            other => Self::Backend(other.to_string()),
        }
    }
}

#[async_trait]
pub trait ServerDirectory: Send + Sync {
    /// Record that the server's agent is connected.
    async fn mark_connected(&self, server_id: &str) -> Result<(), DirectoryError>;

    /// Record that the server's agent went away.
    async fn mark_disconnected(&self, server_id: &str) -> Result<(), DirectoryError>;

    /// Store the capability schema the server's agent discovered.
    async fn persist_schema(&self, server_id: &str, schema: &Value) -> Result<(), DirectoryError>;

    /// Server id an agent token belongs to.
    async fn server_for_agent_token(&self, token: &str) -> Result<Option<String>, DirectoryError>;

    /// Persisted schema of a server; `Ok(None)` if none was announced yet.
    async fn schema(&self, server_id: &str) -> Result<Option<Value>, DirectoryError>;
}

#[async_trait]
impl ServerDirectory for RelayDatabase {
    async fn mark_connected(&self, server_id: &str) -> Result<(), DirectoryError> {
        Ok(self.set_server_connected(server_id, true).await?)
    }

    async fn mark_disconnected(&self, server_id: &str) -> Result<(), DirectoryError> {
        Ok(self.set_server_connected(server_id, false).await?)
    }

    async fn persist_schema(&self, server_id: &str, schema: &Value) -> Result<(), DirectoryError> {
        Ok(self.set_server_schema(server_id, &schema.to_string()).await?)
    }

    async fn server_for_agent_token(&self, token: &str) -> Result<Option<String>, DirectoryError> {
        Ok(self
            .get_server_by_agent_token(token)
            .await?
            .map(|server| server.id))
    }

    async fn schema(&self, server_id: &str) -> Result<Option<Value>, DirectoryError> {
        let server = self.get_server(server_id).await?;
        server
            .schema_json
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(|e| DirectoryError::Backend(format!("Corrupt schema for {server_id}: {e}")))
    }
}

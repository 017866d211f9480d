//! Data models for relay storage.

/// A managed game server and the credentials its agent connects with.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Server {
    pub id: String,
    pub name: String,
    pub agent_token: String,
    /// Unix time of the current agent connection, `None` while offline.
    pub connected_at: Option<i64>,
    pub schema_json: Option<String>,
    pub created_at: i64,
}

impl Server {
    pub const fn is_connected(&self) -> bool {
        self.connected_at.is_some()
    }
}

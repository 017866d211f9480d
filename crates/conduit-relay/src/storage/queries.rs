//! Database queries for the relay server.

use super::db::{DatabaseError, RelayDatabase, unix_timestamp};
use super::models::Server;

impl RelayDatabase {
    /// Create a server record with the token its agent will present.
    pub async fn create_server(
        &self,
        id: &str,
        name: &str,
        agent_token: &str,
    ) -> Result<Server, DatabaseError> {
        sqlx::query("INSERT INTO servers (id, name, agent_token, created_at) VALUES (?, ?, ?, ?)")
            .bind(id)
            .bind(name)
            .bind(agent_token)
            .bind(unix_timestamp())
            .execute(self.pool())
            .await?;

        self.get_server(id).await
    }

    /// Get a server by ID.
    pub async fn get_server(&self, id: &str) -> Result<Server, DatabaseError> {
        sqlx::query_as::<_, Server>("SELECT * FROM servers WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Server {id}")))
    }

    /// Look up the server an agent token belongs to.
    pub async fn get_server_by_agent_token(
        &self,
        agent_token: &str,
    ) -> Result<Option<Server>, DatabaseError> {
        Ok(
            sqlx::query_as::<_, Server>("SELECT * FROM servers WHERE agent_token = ?")
                .bind(agent_token)
                .fetch_optional(self.pool())
                .await?,
        )
    }

    /// Stamp or clear the server's connection time.
    pub async fn set_server_connected(&self, id: &str, connected: bool) -> Result<(), DatabaseError> {
        let connected_at = connected.then(unix_timestamp);
        let result = sqlx::query("UPDATE servers SET connected_at = ? WHERE id = ?")
            .bind(connected_at)
            .bind(id)
            .execute(self.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Server {id}")));
        }
        Ok(())
    }

    /// Store the capability schema announced by the server's agent.
    pub async fn set_server_schema(&self, id: &str, schema_json: &str) -> Result<(), DatabaseError> {
        let result = sqlx::query("UPDATE servers SET schema_json = ? WHERE id = ?")
            .bind(schema_json)
            .bind(id)
            .execute(self.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Server {id}")));
        }
        Ok(())
    }
}

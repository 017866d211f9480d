//! Server provisioning: creates a server record and its agent token.

use rand::RngExt;

use crate::storage::{DatabaseError, RelayDatabase, Server};

/// Length of generated agent tokens.
pub const AGENT_TOKEN_LEN: usize = 40;

fn generate_token(len: usize) -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| {
            let idx = rng.random_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}

/// Register a new server named `name` and return it with its fresh agent token.
pub async fn provision_server(db: &RelayDatabase, name: &str) -> Result<Server, DatabaseError> {
    let id = uuid::Uuid::new_v4().to_string();
    let token = generate_token(AGENT_TOKEN_LEN);
    db.create_server(&id, name, &token).await
}

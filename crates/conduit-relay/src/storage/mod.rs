//! SQLite storage for the Conduit relay.
//!
//! Persists server records: agent tokens, connection state and the
//! capability schema last announced by each server's agent.

mod db;
mod models;
mod queries;


pub use db::{DatabaseError, RelayDatabase};
pub use models::Server;

//! Conduit Relay Server Library
//!
//! Control-plane side of Conduit:
//! - Connection hub holding one management connection per server and its viewers
//! - Correlated RPC calls to agents and notification fan-out to viewers
//! - SQLite server directory (agent tokens, connection state, schemas)
//! - axum HTTP/WebSocket surface

pub mod directory;
pub mod provision;
pub mod registry;
pub mod server;
pub mod storage;

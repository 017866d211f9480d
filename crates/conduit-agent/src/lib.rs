//! Conduit Agent Library
//!
//! Runs next to a game server and keeps one bridge open between the relay's
//! agent socket (the control plane) and the server's management endpoint:
//! - Dialing both sides with bearer auth and optional custom endpoint TLS
//! - Frame passthrough with one-shot capability discovery
//! - Reconnect supervision with jittered exponential backoff
//! - Cumulative telemetry logged on a fixed interval

pub mod backoff;
pub mod bridge;
pub mod config;
pub mod dial;
pub mod error;
pub mod supervisor;
pub mod telemetry;
pub mod tls;

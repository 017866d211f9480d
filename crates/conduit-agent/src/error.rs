//! Agent error types.

use std::time::Duration;

use conduit_core::TransportError;

use crate::dial::DialTarget;

/// Invalid startup configuration. Fatal.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required settings: {0}")]
    Missing(String),

    #[error("Invalid MC_TLS_MODE {0:?}")]
    InvalidTlsMode(String),

    #[error("Failed to read MC_TLS_ROOT_CA {path}: {reason}")]
    RootCa { path: String, reason: String },

    #[error("Invalid TLS server name {0:?}")]
    ServerName(String),

    #[error("TLS configuration error: {0}")]
    Tls(String),
}

/// A transport that could not be established.
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

/// Why a bridge session ended.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("{0} closed the connection")]
    Closed(DialTarget),

    #[error("Reading from {side} failed: {source}")]
    Read {
        side: DialTarget,
        source: TransportError,
    },

    #[error("Writing to {side} failed: {source}")]
    Write {
        side: DialTarget,
        source: TransportError,
    },

    #[error("Bridge task failed: {0}")]
    Task(String),
}

/// A failed supervisor attempt.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Dialing {target} failed: {source}")]
    Dial {
        target: DialTarget,
        source: DialError,
    },

    #[error("Bridge ended after {bridged_for:?}: {source}")]
    Bridge {
        bridged_for: Duration,
        source: BridgeError,
    },
}

impl SessionError {
    /// How long the bridge ran before failing; zero for dial failures.
    pub const fn bridged_for(&self) -> Duration {
        match self {
            Self::Dial { .. } => Duration::ZERO,
            Self::Bridge { bridged_for, .. } => *bridged_for,
        }
    }
}

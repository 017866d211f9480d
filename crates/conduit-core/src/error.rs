//! Error types shared by the relay and the agent.

use std::time::Duration;

use thiserror::Error;

/// A frame that could not be decoded or classified.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame is neither a request, a notification nor a response")]
    Malformed,

    #[error("Control type must be a string")]
    InvalidControl,
}

/// Failures of the underlying duplex transport.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,

    #[error("Write timed out after {0:?}")]
    WriteTimeout(Duration),

    #[error("Transport error: {0}")]
    Io(String),
}

/// Errors returned to the issuer of a correlated call.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Agent disconnected")]
    Disconnected,

    #[error("Failed to encode frame: {0}")]
    Encode(serde_json::Error),

    #[error("Failed to send frame: {0}")]
    Send(TransportError),

    #[error("Id {0} already has a call in flight")]
    DuplicateId(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(FrameError),

    #[error("Remote error {code}: {message}")]
    Remote { code: i64, message: String },
}

impl CallError {
    /// Whether the connection the call was issued on is gone.
    pub const fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Self::Disconnected | Self::Send(TransportError::Closed)
        )
    }
}

//! Transport seam shared by both sides of the relay.
//!
//! A [`Transport`] is a duplex text-message channel split into a sending
//! half ([`FrameSink`]) and a receiving half ([`FrameSource`]). Concrete
//! transports (server-side WebSockets, client-side WebSockets, in-memory
//! pairs) only have to implement these two traits.

#[cfg(any(test, feature = "test-utils"))]
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::error::TransportError;

/// Why a transport is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Orderly shutdown or end of session.
    Normal,
    /// A newer connection replaced this one for the same identity.
    Superseded,
    /// The read side failed.
    ReadError,
    /// A write to this peer failed or timed out.
    SendFailed,
}

impl CloseReason {
    /// WebSocket close code sent to the peer.
    pub const fn code(self) -> u16 {
        match self {
            Self::Normal | Self::ReadError => 1000,
            Self::Superseded => 1008,
            Self::SendFailed => 1011,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "closed",
            Self::Superseded => "superseded",
            Self::ReadError => "read error",
            Self::SendFailed => "send error",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sending half of a transport.
#[async_trait]
pub trait FrameSink: Send {
    /// Send one text message.
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Tell the peer the connection is closing.
    async fn close(&mut self, reason: CloseReason) -> Result<(), TransportError>;
}

/// Receiving half of a transport.
#[async_trait]
pub trait FrameSource: Send {
    /// Next text message, or `Ok(None)` once the peer has closed the stream.
    async fn next_text(&mut self) -> Result<Option<String>, TransportError>;
}

/// A connected duplex transport.
pub struct Transport {
    pub sink: Box<dyn FrameSink>,
    pub source: Box<dyn FrameSource>,
}

impl Transport {
    pub fn new(sink: impl FrameSink + 'static, source: impl FrameSource + 'static) -> Self {
        Self {
            sink: Box::new(sink),
            source: Box::new(source),
        }
    }
}

/// Serializes writes to one sink and bounds each by a deadline.
///
/// The sink lives behind an async mutex so only one frame is in flight at a
/// time. Closing takes the sink out; every later send fails with
/// [`TransportError::Closed`].
pub struct FrameWriter {
    sink: Mutex<Option<Box<dyn FrameSink>>>,
    write_timeout: Duration,
}

impl FrameWriter {
    pub fn new(sink: Box<dyn FrameSink>, write_timeout: Duration) -> Self {
        Self {
            sink: Mutex::new(Some(sink)),
            write_timeout,
        }
    }

    /// Send one message within the writer's default deadline.
    pub async fn send(&self, text: String) -> Result<(), TransportError> {
        self.send_within(text, self.write_timeout).await
    }

    /// Send one message; `deadline` covers both waiting for the write lock
    /// and the write itself.
    pub async fn send_within(&self, text: String, deadline: Duration) -> Result<(), TransportError> {
        let write = async {
            let mut guard = self.sink.lock().await;
            let sink = guard.as_mut().ok_or(TransportError::Closed)?;
            sink.send_text(text).await
        };
        timeout(deadline, write)
            .await
            .unwrap_or(Err(TransportError::WriteTimeout(deadline)))
    }

    /// Close the sink. Returns `true` only for the call that actually closed it.
    pub async fn close(&self, reason: CloseReason) -> bool {
        let Some(mut sink) = self.sink.lock().await.take() else {
            return false;
        };
        match timeout(self.write_timeout, sink.close(reason)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(error = %e, "Close handshake failed"),
            Err(_) => tracing::debug!("Close handshake timed out"),
        }
        true
    }

    pub async fn is_closed(&self) -> bool {
        self.sink.lock().await.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_after_close_fails() {
        let (ours, mut theirs) = memory::pair();
        let writer = FrameWriter::new(ours.sink, Duration::from_secs(1));

        writer.send("hello".into()).await.unwrap();
        assert_eq!(theirs.recv().await.as_deref(), Some("hello"));

        assert!(writer.close(CloseReason::Normal).await);
        assert!(!writer.close(CloseReason::Normal).await);
        assert!(writer.is_closed().await);
        assert!(matches!(
            writer.send("late".into()).await,
            Err(TransportError::Closed)
        ));
        assert!(theirs.recv().await.is_none());
        assert_eq!(theirs.close_reason(), Some(CloseReason::Normal));
    }

    #[tokio::test]
    async fn send_to_vanished_peer_fails() {
        let (ours, theirs) = memory::pair();
        drop(theirs);
        let writer = FrameWriter::new(ours.sink, Duration::from_secs(1));
        assert!(writer.send("x".into()).await.is_err());
    }

    #[tokio::test]
    async fn stalled_write_hits_deadline() {
        let (ours, _theirs) = memory::stalled_pair();
        let writer = FrameWriter::new(ours.sink, Duration::from_secs(5));
        let result = writer.send_within("x".into(), Duration::from_millis(20)).await;
        assert!(matches!(result, Err(TransportError::WriteTimeout(_))));
    }
}

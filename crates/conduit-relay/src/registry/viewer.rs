//! A subscriber to one server's notification stream.

use std::time::Duration;

use tokio::sync::watch;

use conduit_core::{CloseReason, FrameSink, FrameWriter, TransportError};

/// Receive-only subscriber; the relay only ever writes to it.
pub struct ViewerConnection {
    id: u64,
    server_id: String,
    writer: FrameWriter,
    closed: watch::Sender<bool>,
}

impl ViewerConnection {
    pub(crate) fn new(
        id: u64,
        server_id: String,
        sink: Box<dyn FrameSink>,
        write_timeout: Duration,
    ) -> Self {
        Self {
            id,
            server_id,
            writer: FrameWriter::new(sink, write_timeout),
            closed: watch::Sender::new(false),
        }
    }

    /// Hub-assigned slot number.
    pub const fn id(&self) -> u64 {
        self.id
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Deliver one payload, giving up after `deadline`.
    pub async fn send(&self, payload: String, deadline: Duration) -> Result<(), TransportError> {
        self.writer.send_within(payload, deadline).await
    }

    /// Close the socket. Idempotent.
    pub async fn close(&self, reason: CloseReason) {
        self.closed.send_replace(true);
        self.writer.close(reason).await;
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

//! In-memory transports for tests.
//!
//! [`pair`] returns a [`Transport`] to hand to the code under test and a
//! [`MemoryPeer`] the test drives as the remote end.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{CloseReason, FrameSink, FrameSource, Transport};
use crate::error::TransportError;

#[derive(Debug)]
enum Message {
    Text(String),
    Close(CloseReason),
    Error(String),
}

pub struct MemorySink {
    tx: mpsc::UnboundedSender<Message>,
    stalled: bool,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        if self.stalled {
            std::future::pending::<()>().await;
        }
        self.tx
            .send(Message::Text(text))
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self, reason: CloseReason) -> Result<(), TransportError> {
        self.tx
            .send(Message::Close(reason))
            .map_err(|_| TransportError::Closed)
    }
}

pub struct MemorySource {
    rx: mpsc::UnboundedReceiver<Message>,
    close_reason: Option<CloseReason>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn next_text(&mut self) -> Result<Option<String>, TransportError> {
        match self.rx.recv().await {
            Some(Message::Text(text)) => Ok(Some(text)),
            Some(Message::Close(reason)) => {
                self.close_reason = Some(reason);
                Ok(None)
            }
            Some(Message::Error(msg)) => Err(TransportError::Io(msg)),
            None => Ok(None),
        }
    }
}

/// The test-controlled remote end of an in-memory transport.
pub struct MemoryPeer {
    sink: MemorySink,
    source: MemorySource,
}

impl MemoryPeer {
    /// Send a text message to the code under test.
    pub fn send(&self, text: impl Into<String>) {
        let _ = self.sink.tx.send(Message::Text(text.into()));
    }

    /// Make the next read on the other side fail.
    pub fn inject_error(&self, message: &str) {
        let _ = self.sink.tx.send(Message::Error(message.to_string()));
    }

    /// Next message from the code under test, `None` once it closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.source.next_text().await.ok().flatten()
    }

    /// Reason the code under test gave when closing, if it did.
    pub const fn close_reason(&self) -> Option<CloseReason> {
        self.source.close_reason
    }

    /// Turn the peer into a regular transport.
    pub fn into_transport(self) -> Transport {
        Transport::new(self.sink, self.source)
    }
}

/// Create a connected transport/peer pair.
pub fn pair() -> (Transport, MemoryPeer) {
    build(false)
}

/// Like [`pair`], but writes from the transport side never complete.
pub fn stalled_pair() -> (Transport, MemoryPeer) {
    build(true)
}

fn build(stalled: bool) -> (Transport, MemoryPeer) {
    let (to_peer, from_local) = mpsc::unbounded_channel();
    let (to_local, from_peer) = mpsc::unbounded_channel();
    let local = Transport::new(
        MemorySink {
            tx: to_peer,
            stalled,
        },
        MemorySource {
            rx: from_peer,
            close_reason: None,
        },
    );
    let peer = MemoryPeer {
        sink: MemorySink {
            tx: to_local,
            stalled: false,
        },
        source: MemorySource {
            rx: from_local,
            close_reason: None,
        },
    };
    (local, peer)
}

//! The relay's end of one agent's management connection.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use conduit_core::frame::{self, ControlMessage, FrameKind, Inbound};
use conduit_core::{
    CallError, CloseReason, Frame, FrameSink, FrameSource, FrameWriter, RequestCorrelator,
};

use super::hub::ConnectionHub;

/// Authoritative relay link to one server's agent.
///
/// Owns the correlator for calls issued to the agent and a one-shot
/// "closed" signal. The read loop runs on its own task; see
/// [`ConnectionHub::register_management`].
pub struct ManagementConnection {
    server_id: String,
    correlator: RequestCorrelator,
    closed: watch::Sender<bool>,
}

impl ManagementConnection {
    pub(crate) fn new(server_id: String, sink: Box<dyn FrameSink>, write_timeout: Duration) -> Self {
        let writer = Arc::new(FrameWriter::new(sink, write_timeout));
        Self {
            server_id,
            correlator: RequestCorrelator::new(writer),
            closed: watch::Sender::new(false),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Send `frame` to the agent and wait up to `deadline` for its response.
    ///
    /// Returns the raw response text exactly as the agent sent it.
    pub async fn call(&self, frame: Frame, deadline: Duration) -> Result<String, CallError> {
        self.correlator.issue(frame, deadline).await
    }

    /// Number of calls waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.correlator.pending_count()
    }

    /// Close the connection: signal "closed", fail every pending call and
    /// close the transport. Only the first call has any effect.
    pub async fn close(&self, reason: CloseReason) {
        if self.closed.send_replace(true) {
            return;
        }
        let failed = self.correlator.fail_all();
        info!(
            server_id = %self.server_id,
            reason = %reason,
            failed_calls = failed,
            "Management connection closing"
        );
        self.correlator.writer().close(reason).await;
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the connection is closed, for whatever reason.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Read frames until the transport fails or the connection is closed,
    /// then deregister from the hub.
    pub(crate) async fn read_loop(self: Arc<Self>, mut source: Box<dyn FrameSource>, hub: ConnectionHub) {
        let mut closed_rx = self.closed.subscribe();
        loop {
            let next = tokio::select! {
                next = source.next_text() => next,
                _ = closed_rx.wait_for(|closed| *closed) => break,
            };
            match next {
                Ok(Some(text)) => self.dispatch(&hub, text).await,
                Ok(None) => {
                    info!(server_id = %self.server_id, "Agent closed the connection");
                    break;
                }
                Err(e) => {
                    info!(server_id = %self.server_id, error = %e, "Agent connection read failed");
                    break;
                }
            }
        }

        self.close(CloseReason::ReadError).await;
        hub.management_closed(&self).await;
    }

    async fn dispatch(&self, hub: &ConnectionHub, text: String) {
        let frame = match frame::decode(&text) {
            Ok(Inbound::Control(control)) => {
                self.handle_control(hub, control).await;
                return;
            }
            Ok(Inbound::Frame(frame)) => frame,
            Err(e) => {
                warn!(server_id = %self.server_id, error = %e, "Invalid agent payload");
                return;
            }
        };

        match frame.kind() {
            Ok(FrameKind::Response) => {
                let Some(key) = frame.correlation_key() else {
                    return;
                };
                if !self.correlator.resolve(&key, text) {
                    debug!(server_id = %self.server_id, id = %key, "No pending call for response");
                }
            }
            Ok(FrameKind::Notification) => {
                let delivered = hub.broadcast(&self.server_id, &text).await;
                debug!(server_id = %self.server_id, delivered, "Notification fanned out");
            }
            Ok(FrameKind::Request) => {
                debug!(
                    server_id = %self.server_id,
                    method = frame.method.as_deref().unwrap_or_default(),
                    "Ignoring request sent by agent"
                );
            }
            Err(e) => warn!(server_id = %self.server_id, error = %e, "Invalid agent frame"),
        }
    }

    async fn handle_control(&self, hub: &ConnectionHub, control: ControlMessage) {
        match control {
            ControlMessage::Discover {
                schema: Some(schema),
            } => {
                if let Err(e) = hub.directory().persist_schema(&self.server_id, &schema).await {
                    warn!(server_id = %self.server_id, error = %e, "Failed to persist schema");
                } else {
                    info!(server_id = %self.server_id, "Persisted discovered schema");
                }
            }
            ControlMessage::Discover { schema: None } => {
                debug!(server_id = %self.server_id, "Discover control message without schema");
            }
            ControlMessage::Unknown(kind) => {
                info!(server_id = %self.server_id, control_type = %kind, "Unknown control message");
            }
        }
    }
}

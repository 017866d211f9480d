//! Dialing both sides of the bridge.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tracing::warn;

use conduit_core::{CloseReason, FrameSink, FrameSource, Transport, TransportError};

use crate::config::{AgentConfig, Peer};
use crate::error::{ConfigError, DialError};
use crate::tls;

/// Which side of the bridge a connection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DialTarget {
    /// The relay's agent socket.
    Control,
    /// The game server's management endpoint.
    Endpoint,
}

impl DialTarget {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Control => "control",
            Self::Endpoint => "endpoint",
        }
    }
}

impl fmt::Display for DialTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opens transports. The supervisor only sees this trait so tests can
/// substitute in-memory pairs.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, target: DialTarget) -> Result<Transport, DialError>;
}

/// Dials real WebSockets with bearer authentication.
pub struct WsDialer {
    config: AgentConfig,
    endpoint_tls: Option<Arc<rustls::ClientConfig>>,
}

impl WsDialer {
    pub fn new(config: AgentConfig) -> Result<Self, ConfigError> {
        let endpoint_tls = if config.endpoint_uses_tls() {
            tls::endpoint_client_config(&config.tls)?
        } else {
            None
        };
        Ok(Self {
            config,
            endpoint_tls,
        })
    }

    const fn peer(&self, target: DialTarget) -> &Peer {
        match target {
            DialTarget::Control => &self.config.control,
            DialTarget::Endpoint => &self.config.endpoint,
        }
    }
}

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(&self, target: DialTarget) -> Result<Transport, DialError> {
        let peer = self.peer(target);
        let mut request = peer
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| DialError::InvalidRequest(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", peer.token))
            .map_err(|e| DialError::InvalidRequest(e.to_string()))?;
        request.headers_mut().insert(header::AUTHORIZATION, bearer);

        let connector = match target {
            DialTarget::Endpoint => {
                if self.config.tls.insecure && self.config.endpoint_uses_tls() {
                    warn!("Endpoint TLS certificate verification is disabled");
                }
                self.endpoint_tls.clone().map(Connector::Rustls)
            }
            DialTarget::Control => None,
        };

        let deadline = self.config.handshake_timeout;
        let connect =
            tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector);
        let (stream, _response) = timeout(deadline, connect)
            .await
            .map_err(|_| DialError::Timeout(deadline))?
            .map_err(|e| DialError::Connection(e.to_string()))?;

        let (sink, source) = stream.split();
        Ok(Transport::new(TungsteniteSink(sink), TungsteniteSource(source)))
    }
}

type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TungsteniteSink(SplitSink<ClientStream, Message>);

pub struct TungsteniteSource(SplitStream<ClientStream>);

#[async_trait]
impl FrameSink for TungsteniteSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.0
            .send(Message::text(text))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn close(&mut self, reason: CloseReason) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: CloseCode::from(reason.code()),
            reason: reason.as_str().into(),
        };
        self.0
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }
}

#[async_trait]
impl FrameSource for TungsteniteSource {
    async fn next_text(&mut self) -> Result<Option<String>, TransportError> {
        while let Some(message) = self.0.next().await {
            match message.map_err(|e| TransportError::Io(e.to_string()))? {
                Message::Text(text) => return Ok(Some(text.to_string())),
                Message::Binary(bytes) => {
                    let text = String::from_utf8(bytes.to_vec())
                        .map_err(|e| TransportError::Io(format!("Non UTF-8 binary frame: {e}")))?;
                    return Ok(Some(text));
                }
                Message::Close(_) => return Ok(None),
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
        Ok(None)
    }
}

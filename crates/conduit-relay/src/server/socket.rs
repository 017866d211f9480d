//! Adapts accepted axum WebSockets to the frame transport traits.

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};

use conduit_core::{CloseReason, FrameSink, FrameSource, Transport, TransportError};

pub struct AxumSink(SplitSink<WebSocket, Message>);

pub struct AxumSource(SplitStream<WebSocket>);

/// Split an upgraded socket into a [`Transport`].
pub fn into_transport(socket: WebSocket) -> Transport {
    let (sink, stream) = socket.split();
    Transport::new(AxumSink(sink), AxumSource(stream))
}

#[async_trait]
impl FrameSink for AxumSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.0
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn close(&mut self, reason: CloseReason) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: reason.code(),
            reason: reason.as_str().into(),
        };
        self.0
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }
}

#[async_trait]
impl FrameSource for AxumSource {
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
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }
        Ok(None)
    }
}

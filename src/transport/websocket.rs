//! WebSocket transport using `tokio-tungstenite`.
//!
//! Only text frames carry protocol data. Binary frames are passed through as
//! (lossy) UTF-8 so that a misbehaving engine surfaces as a decode failure on
//! the awaiting request. Ping, pong and close frames are skipped; tungstenite
//! answers pings itself and ends the stream after a close.

use futures::future::{self, BoxFuture};
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use super::{Connection, Connector};
use crate::error::{DspError, Result};

/// Connects to `ws://` / `wss://` endpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    /// Create a new WebSocket connector.
    pub fn new() -> Self {
        Self
    }
}

impl Connector for WebSocketConnector {
    fn connect(&self, endpoint: &str) -> BoxFuture<'static, Result<Connection>> {
        let endpoint = endpoint.to_string();
        Box::pin(async move {
            let (ws, _response) = tokio_tungstenite::connect_async(endpoint.as_str())
                .await
                .map_err(|e| DspError::Transport(format!("{}: {}", endpoint, e)))?;

            tracing::debug!("WebSocket connected to {}", endpoint);

            let (sink, stream) = ws.split();

            let sink = sink
                .with(|frame: String| future::ready(Ok::<_, WsError>(Message::Text(frame))))
                .sink_map_err(DspError::from);

            let stream = stream.filter_map(|message| future::ready(inbound_frame(message)));

            Ok(Connection::new(sink, stream))
        })
    }
}

/// Map a raw WebSocket message to an inbound frame, or `None` to skip it.
fn inbound_frame(message: std::result::Result<Message, WsError>) -> Option<Result<String>> {
    match message {
        Ok(Message::Text(text)) => Some(Ok(text)),
        Ok(Message::Binary(data)) => Some(Ok(String::from_utf8_lossy(&data).into_owned())),
        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => None,
        Ok(Message::Close(_)) => None,
        Err(e) => Some(Err(DspError::from(e))),
    }
}

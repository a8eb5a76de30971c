//! Transport module - duplex text-frame connections.
//!
//! A [`Connector`] turns an endpoint URL into a [`Connection`]: a sink for
//! outbound text frames and a stream of inbound ones. The rest of the crate
//! never sees sockets directly.
//!
//! Provides:
//! - [`WebSocketConnector`] - `tokio-tungstenite` client (the default)
//! - [`MemoryConnector`] - in-process endpoints for tests and embedding
//!
//! # Example
//!
//! ```
//! use dspctl_client::transport::{Connector, MemoryConnector};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let connector = MemoryConnector::new();
//! let mut listener = connector.listen("ws://engine:1234");
//!
//! let connection = connector.connect("ws://engine:1234").await.unwrap();
//! let peer = listener.accept().await.unwrap();
//! assert_eq!(peer.endpoint(), "ws://engine:1234");
//! # drop(connection);
//! # }
//! ```

pub mod memory;
mod websocket;

use std::pin::Pin;

use futures::future::BoxFuture;
use futures::{Sink, Stream};

use crate::error::{DspError, Result};

pub use memory::{MemoryConnector, MemoryListener, MemoryPeer};
pub use websocket::WebSocketConnector;

/// Outbound half of a connection.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = DspError> + Send>>;

/// Inbound half of a connection. The stream ending means the remote closed.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// An established duplex connection.
pub struct Connection {
    sink: FrameSink,
    stream: FrameStream,
}

impl Connection {
    /// Wrap a sink/stream pair.
    pub fn new<S, R>(sink: S, stream: R) -> Self
    where
        S: Sink<String, Error = DspError> + Send + 'static,
        R: Stream<Item = Result<String>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }

    /// Split into write and read halves.
    pub fn into_split(self) -> (FrameSink, FrameStream) {
        (self.sink, self.stream)
    }
}

/// Opens connections to endpoint URLs.
///
/// Implementations must be cheap to share; one connector serves both
/// channels and every reconnect attempt.
pub trait Connector: Send + Sync + 'static {
    /// Connect to `endpoint`. Resolves once the transport reports connected.
    fn connect(&self, endpoint: &str) -> BoxFuture<'static, Result<Connection>>;
}

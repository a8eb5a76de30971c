//! In-memory transport.
//!
//! Endpoints are plain strings registered with [`MemoryConnector::listen`].
//! Connecting to an endpoint with no listener fails like a refused TCP
//! connection. The server side of each connection is a [`MemoryPeer`];
//! dropping it (or calling [`MemoryPeer::close`]) looks to the client exactly
//! like the remote closing the socket.
//!
//! Used by the crate's tests and by applications that want to script a fake
//! engine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::channel::mpsc as fmpsc;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use super::{Connection, Connector};
use crate::error::{DspError, Result};

type Registry = Arc<Mutex<HashMap<String, (u64, mpsc::UnboundedSender<MemoryPeer>)>>>;

/// Connector for in-process endpoints.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    listeners: Registry,
    next_id: Arc<AtomicU64>,
}

impl MemoryConnector {
    /// Create a connector with no endpoints.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start accepting connections on `endpoint`.
    ///
    /// Replaces any previous listener on the same endpoint. The endpoint stops
    /// accepting when the returned listener is dropped.
    pub fn listen(&self, endpoint: &str) -> MemoryListener {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        lock(&self.listeners).insert(endpoint.to_string(), (id, tx));

        MemoryListener {
            endpoint: endpoint.to_string(),
            id,
            accept_rx: rx,
            registry: self.listeners.clone(),
        }
    }

    /// Check whether `endpoint` currently has a listener.
    pub fn is_listening(&self, endpoint: &str) -> bool {
        lock(&self.listeners).contains_key(endpoint)
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, endpoint: &str) -> BoxFuture<'static, Result<Connection>> {
        let result = self.open(endpoint);
        Box::pin(async move { result })
    }
}

impl MemoryConnector {
    fn open(&self, endpoint: &str) -> Result<Connection> {
        let acceptor = lock(&self.listeners)
            .get(endpoint)
            .map(|(_, tx)| tx.clone())
            .ok_or_else(|| refused(endpoint))?;

        let (client_tx, server_rx) = fmpsc::unbounded::<String>();
        let (server_tx, client_rx) = fmpsc::unbounded::<String>();

        let peer = MemoryPeer {
            endpoint: endpoint.to_string(),
            incoming: server_rx,
            outgoing: server_tx,
        };
        acceptor.send(peer).map_err(|_| refused(endpoint))?;

        let peer_gone = endpoint.to_string();
        let sink = client_tx.sink_map_err(move |_| {
            DspError::Transport(format!("{}: connection reset by peer", peer_gone))
        });
        let stream = client_rx.map(Ok);

        Ok(Connection::new(sink, stream))
    }
}

/// Accepts connections for one endpoint.
pub struct MemoryListener {
    endpoint: String,
    id: u64,
    accept_rx: mpsc::UnboundedReceiver<MemoryPeer>,
    registry: Registry,
}

impl MemoryListener {
    /// Wait for the next client connection.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.recv().await
    }

    /// The endpoint this listener is bound to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        let mut listeners = lock(&self.registry);
        if listeners
            .get(&self.endpoint)
            .is_some_and(|(id, _)| *id == self.id)
        {
            listeners.remove(&self.endpoint);
        }
    }
}

/// Server side of one in-memory connection.
pub struct MemoryPeer {
    endpoint: String,
    incoming: fmpsc::UnboundedReceiver<String>,
    outgoing: fmpsc::UnboundedSender<String>,
}

impl MemoryPeer {
    /// Receive the next frame the client sent. `None` once the client is gone.
    pub async fn recv(&mut self) -> Option<String> {
        self.incoming.next().await
    }

    /// Send a frame to the client. Returns false if the client is gone.
    pub fn send(&self, frame: impl Into<String>) -> bool {
        self.outgoing.unbounded_send(frame.into()).is_ok()
    }

    /// The endpoint the client connected to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Close the connection from the server side.
    pub fn close(self) {}
}

fn refused(endpoint: &str) -> DspError {
    DspError::Transport(format!("{}: connection refused", endpoint))
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

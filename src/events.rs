//! State change publication and handler registration.
//!
//! The aggregate state is published two ways: a `watch` channel holding the
//! current value, and a `broadcast` of every [`StateTransition`]. Handlers
//! registered with `on_state_change` / `on_request_outcome` are plain
//! forwarding tasks over a broadcast receiver.

use std::sync::{Mutex, MutexGuard};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::state::{ConnectionState, StateTransition};

/// Capacity of the transition broadcast channel.
const TRANSITION_CHANNEL_CAPACITY: usize = 64;

/// Publishes aggregate state changes.
pub(crate) struct StateEvents {
    current: watch::Sender<ConnectionState>,
    transitions: broadcast::Sender<StateTransition>,
    /// Serializes compare-and-publish so transitions are emitted in order.
    publish: Mutex<()>,
}

impl StateEvents {
    pub(crate) fn new() -> Self {
        let (current, _) = watch::channel(ConnectionState::Disconnected);
        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        Self {
            current,
            transitions,
            publish: Mutex::new(()),
        }
    }

    /// Hold while deriving and publishing a new state.
    pub(crate) fn publish_lock(&self) -> MutexGuard<'_, ()> {
        self.publish.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Publish `next` if it differs from the current state.
    pub(crate) fn publish(&self, next: ConnectionState) -> Option<StateTransition> {
        let previous = *self.current.borrow();
        if previous == next {
            return None;
        }

        self.current.send_replace(next);
        let transition = StateTransition::now(previous, next);
        tracing::info!("Connection state {:?} -> {:?}", previous, next);
        // No subscribers is fine
        let _ = self.transitions.send(transition.clone());
        Some(transition)
    }

    pub(crate) fn current(&self) -> ConnectionState {
        *self.current.borrow()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.current.subscribe()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<StateTransition> {
        self.transitions.subscribe()
    }
}

/// Run `handler` for every message on `rx` until the sender goes away.
///
/// A handler that falls behind skips the missed messages and keeps going.
pub(crate) fn spawn_handler<T, F>(mut rx: broadcast::Receiver<T>, handler: F) -> JoinHandle<()>
where
    T: Clone + Send + 'static,
    F: Fn(T) + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(message) => handler(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Event handler lagged, skipped {} event(s)", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

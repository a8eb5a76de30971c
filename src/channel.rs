//! One persistent duplex connection to one engine endpoint.
//!
//! A [`Channel`] owns the transport for its endpoint and the reader and
//! writer tasks that serve it. It drives its [`RequestQueue`]: the queue only
//! has a writer while the channel is open, and every close or loss aborts
//! whatever the queue still holds.
//!
//! Each successful `open()` starts a new session. Tasks from an earlier
//! session that report a loss after the channel was closed or reopened are
//! ignored.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;

use crate::error::{DspError, Result};
use crate::queue::RequestQueue;
use crate::state::{ChannelId, ChannelState};
use crate::transport::{Connector, FrameStream};
use crate::writer::writer_task;

/// Why a channel went from `Open` to `Closed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called.
    Requested,
    /// The remote end closed the connection.
    RemoteClosed,
    /// Reading or writing failed.
    TransportError(String),
}

impl CloseReason {
    /// True for every reason except [`CloseReason::Requested`].
    pub fn is_unexpected(&self) -> bool {
        !matches!(self, CloseReason::Requested)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Requested => f.write_str("closed by client"),
            CloseReason::RemoteClosed => f.write_str("closed by remote"),
            CloseReason::TransportError(err) => write!(f, "transport error: {}", err),
        }
    }
}

/// Receives channel lifecycle notifications.
///
/// Called without any channel lock held, possibly from the channel's own
/// reader or writer task. Implementations must not block.
pub trait ChannelObserver: Send + Sync + 'static {
    /// The channel moved to `state`.
    fn state_changed(&self, channel: ChannelId, state: ChannelState);

    /// An open channel closed. Follows the `state_changed` for `Closed`.
    fn closed(&self, channel: ChannelId, reason: &CloseReason);
}

struct ChannelCore {
    state: ChannelState,
    session: u64,
    tasks: Vec<JoinHandle<()>>,
    last_close: Option<CloseReason>,
}

struct ChannelInner {
    id: ChannelId,
    endpoint: String,
    connector: Arc<dyn Connector>,
    connect_timeout: Duration,
    queue: RequestQueue,
    observer: Arc<dyn ChannelObserver>,
    core: Mutex<ChannelCore>,
}

/// Handle to one channel. Cheaply cloneable.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Create a closed channel for `endpoint`.
    pub fn new(
        id: ChannelId,
        endpoint: impl Into<String>,
        connector: Arc<dyn Connector>,
        connect_timeout: Duration,
        queue: RequestQueue,
        observer: Arc<dyn ChannelObserver>,
    ) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                id,
                endpoint: endpoint.into(),
                connector,
                connect_timeout,
                queue,
                observer,
                core: Mutex::new(ChannelCore {
                    state: ChannelState::Closed,
                    session: 0,
                    tasks: Vec::new(),
                    last_close: None,
                }),
            }),
        }
    }

    /// Connect to the endpoint.
    ///
    /// Moves `Closed → Connecting → Open`, or back to `Closed` on failure.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the channel is not `Closed`, if the
    /// connection fails or takes longer than the connect timeout, or if
    /// [`close`](Self::close) was called while connecting.
    pub async fn open(&self) -> Result<()> {
        let inner = &self.inner;
        let session = {
            let mut core = inner.lock();
            if core.state != ChannelState::Closed {
                return Err(DspError::Transport(format!(
                    "{} channel is already {:?}",
                    inner.id, core.state
                )));
            }
            core.set_state(ChannelState::Connecting);
            core.session += 1;
            core.session
        };
        inner.observer.state_changed(inner.id, ChannelState::Connecting);
        tracing::debug!("Opening {} channel to {}", inner.id, inner.endpoint);

        let connect = inner.connector.connect(&inner.endpoint);
        let connected = match tokio::time::timeout(inner.connect_timeout, connect).await {
            Ok(result) => result,
            Err(_) => Err(DspError::Transport(format!(
                "{}: connect timed out after {:?}",
                inner.endpoint, inner.connect_timeout
            ))),
        };

        let connection = match connected {
            Ok(connection) => connection,
            Err(err) => {
                tracing::warn!("{} channel failed to open: {}", inner.id, err);
                if inner.fail_open(session) {
                    inner.observer.state_changed(inner.id, ChannelState::Closed);
                }
                return Err(err);
            }
        };

        let (sink, stream) = connection.into_split();
        let (writer, writer_future) = writer_task(sink);
        {
            let mut core = inner.lock();
            if core.session != session || core.state != ChannelState::Connecting {
                return Err(DspError::Transport(format!(
                    "{} channel closed while connecting",
                    inner.id
                )));
            }

            inner.queue.attach(writer);
            let weak = Arc::downgrade(inner);
            core.tasks
                .push(tokio::spawn(run_writer(weak.clone(), session, writer_future)));
            core.tasks.push(tokio::spawn(run_reader(weak, session, stream)));
            core.set_state(ChannelState::Open);
            core.last_close = None;
        }

        tracing::info!("{} channel open ({})", inner.id, inner.endpoint);
        inner.observer.state_changed(inner.id, ChannelState::Open);
        Ok(())
    }

    /// Tear the channel down and abort every pending request.
    ///
    /// Synchronous: when this returns the transport is dropped, the queue is
    /// empty and the state is `Closed`. A pending `open()` is invalidated.
    pub fn close(&self) {
        let inner = &self.inner;
        let (previous, tasks) = {
            let mut core = inner.lock();
            let previous = core.state;
            if previous == ChannelState::Closed {
                return;
            }
            core.session += 1;
            core.set_state(ChannelState::Closed);
            core.last_close = Some(CloseReason::Requested);
            (previous, std::mem::take(&mut core.tasks))
        };

        for task in tasks {
            task.abort();
        }
        inner.queue.abort_all(&CloseReason::Requested.to_string());
        tracing::debug!("{} channel closed", inner.id);

        inner.observer.state_changed(inner.id, ChannelState::Closed);
        if previous == ChannelState::Open {
            inner.observer.closed(inner.id, &CloseReason::Requested);
        }
    }

    #[inline]
    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    #[inline]
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    pub fn state(&self) -> ChannelState {
        self.inner.lock().state
    }

    /// The queue serializing requests on this channel.
    #[inline]
    pub fn queue(&self) -> &RequestQueue {
        &self.inner.queue
    }

    /// Why the channel last closed, cleared on the next successful open.
    pub fn last_close_reason(&self) -> Option<CloseReason> {
        self.inner.lock().last_close.clone()
    }
}

impl ChannelCore {
    fn set_state(&mut self, next: ChannelState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid channel transition {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
    }
}

impl ChannelInner {
    fn lock(&self) -> MutexGuard<'_, ChannelCore> {
        self.core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Return to `Closed` after a failed open. False if the attempt was
    /// already superseded.
    fn fail_open(&self, session: u64) -> bool {
        let mut core = self.lock();
        if core.session != session || core.state != ChannelState::Connecting {
            return false;
        }
        core.set_state(ChannelState::Closed);
        true
    }

    /// Handle an unexpected loss reported by a session's task.
    fn lost(&self, session: u64, reason: CloseReason) {
        let tasks = {
            let mut core = self.lock();
            if core.session != session || core.state != ChannelState::Open {
                return;
            }
            core.set_state(ChannelState::Closed);
            core.last_close = Some(reason.clone());
            std::mem::take(&mut core.tasks)
        };

        for task in tasks {
            task.abort();
        }
        tracing::warn!("{} channel lost: {}", self.id, reason);
        self.queue.abort_all(&reason.to_string());

        self.observer.state_changed(self.id, ChannelState::Closed);
        self.observer.closed(self.id, &reason);
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        let core = self.core.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        for task in core.tasks.drain(..) {
            task.abort();
        }
    }
}

async fn run_writer(
    channel: Weak<ChannelInner>,
    session: u64,
    writer: impl Future<Output = Result<()>>,
) {
    if let Err(err) = writer.await {
        if let Some(channel) = channel.upgrade() {
            channel.lost(session, CloseReason::TransportError(err.to_string()));
        }
    }
}

async fn run_reader(channel: Weak<ChannelInner>, session: u64, mut stream: FrameStream) {
    let reason = loop {
        match stream.next().await {
            Some(Ok(frame)) => match channel.upgrade() {
                Some(channel) => channel.queue.on_frame(&frame),
                None => return,
            },
            Some(Err(err)) => break CloseReason::TransportError(err.to_string()),
            None => break CloseReason::RemoteClosed,
        }
    };

    if let Some(channel) = channel.upgrade() {
        channel.lost(session, reason);
    }
}

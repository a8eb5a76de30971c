//! Per-channel request serialization.
//!
//! The engine answers by command name only, so a channel may have at most
//! one request on the wire at a time. [`RequestQueue`] keeps every other
//! request waiting in FIFO order, owns the single in-flight slot, and settles
//! each request exactly once: with the response, a timeout, a decode
//! failure, or an abort when the channel closes.
//!
//! ```text
//! enqueue ─► waiting (FIFO) ─► in-flight ─► writer
//!                                  ▲
//!             on_frame / timer ────┘ settle, dispatch next
//! ```
//!
//! The engine answers in order on one connection, so the answer to a
//! request that timed out still arrives ahead of anything sent after it.
//! Each timeout leaves a marker for its command name, and the next frame with
//! that name is discarded instead of settling a newer request.
//!
//! All bookkeeping happens under one `std::sync::Mutex` that is never held
//! across an await. Outcomes are recorded and delivered after the lock is
//! released.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::codec::WireCodec;
use crate::diagnostics::{FailureEntry, OutcomeRecorder};
use crate::error::{DspError, Result};
use crate::protocol::Command;
use crate::state::ChannelId;
use crate::writer::WriterHandle;

/// Late answers remembered per queue; the oldest marker is dropped beyond this.
const MAX_LATE_ANSWERS: usize = 16;

/// A request owned by the queue until it settles.
struct PendingRequest {
    command: Command,
    timeout: Duration,
    enqueued_at: Instant,
    completion: oneshot::Sender<Result<Value>>,
}

/// The request currently on the wire.
struct InFlight {
    request: PendingRequest,
    token: u64,
    timer: JoinHandle<()>,
}

/// A request that has settled but not yet been recorded and delivered.
struct Settled {
    request: PendingRequest,
    result: Result<Value>,
}

impl Settled {
    fn new(request: PendingRequest, result: Result<Value>) -> Self {
        Self { request, result }
    }
}

#[derive(Default)]
struct QueueState {
    waiting: VecDeque<PendingRequest>,
    in_flight: Option<InFlight>,
    writer: Option<WriterHandle>,
    next_token: u64,
    /// Names of timed-out requests whose answer has not arrived yet.
    late: VecDeque<String>,
}

impl QueueState {
    fn expect_late(&mut self, command: &str) {
        if self.late.len() == MAX_LATE_ANSWERS {
            self.late.pop_front();
        }
        self.late.push_back(command.to_string());
    }

    /// Consume the marker for a late answer to `command`, if one is owed.
    fn take_late(&mut self, command: &str) -> bool {
        match self.late.iter().position(|name| name == command) {
            Some(index) => {
                self.late.remove(index);
                true
            }
            None => false,
        }
    }

    fn in_flight_is(&self, command: &str) -> bool {
        self.in_flight
            .as_ref()
            .is_some_and(|f| f.request.command.name() == command)
    }
}

/// Where an inbound frame goes.
#[derive(Clone, Copy)]
enum Route {
    /// Settles the in-flight request.
    Settle,
    /// Answer to a request that already timed out.
    Late,
    Unmatched,
}

struct QueueInner {
    channel: ChannelId,
    default_timeout: Duration,
    recorder: OutcomeRecorder,
    state: Mutex<QueueState>,
}

/// FIFO request queue for one channel.
///
/// Cheaply cloneable; clones share the same queue.
#[derive(Clone)]
pub struct RequestQueue {
    inner: Arc<QueueInner>,
}

impl RequestQueue {
    /// Create a detached queue. Requests fail with a transport error until a
    /// writer is attached.
    pub fn new(channel: ChannelId, default_timeout: Duration, recorder: OutcomeRecorder) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                channel,
                default_timeout,
                recorder,
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    /// Queue `command` and return a future for its result.
    ///
    /// The request takes its place in the queue when this is called, not
    /// when the future is first polled. Dropping the future does not cancel
    /// the request; it still runs in order and its outcome is still recorded.
    ///
    /// `timeout` overrides the channel default.
    pub fn enqueue(
        &self,
        command: Command,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<Value>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        let name = command.name().to_string();
        let request = PendingRequest {
            command,
            timeout: timeout.unwrap_or(self.inner.default_timeout),
            enqueued_at: Instant::now(),
            completion: tx,
        };

        let mut settled = Vec::new();
        {
            let mut state = self.inner.lock();
            if state.writer.is_none() {
                settled.push(Settled::new(request, Err(self.inner.not_open())));
            } else {
                state.waiting.push_back(request);
                self.inner.dispatch(&mut state, &mut settled);
            }
        }
        self.inner.finish(settled);

        async move {
            rx.await.unwrap_or_else(|_| {
                Err(DspError::Abort {
                    command: name,
                    reason: "request queue dropped".to_string(),
                })
            })
        }
    }

    /// Route one inbound text frame.
    ///
    /// A frame naming the in-flight command settles it, with a protocol error
    /// if the frame does not decode. A frame with no readable command name
    /// also fails the in-flight request. Late answers to timed-out requests
    /// and frames for any other command are counted as unmatched and dropped.
    pub fn on_frame(&self, frame: &str) {
        let decoded = WireCodec::decode(frame);
        let command = match &decoded {
            Ok(response) => Some(response.command.clone()),
            Err(_) => WireCodec::peek_command(frame),
        };
        let mut settled = Vec::new();
        let route;

        {
            let mut state = self.inner.lock();
            route = match command.as_deref() {
                Some(name) if state.take_late(name) => Route::Late,
                Some(name) if state.in_flight_is(name) => Route::Settle,
                None if state.in_flight.is_some() => Route::Settle,
                _ => Route::Unmatched,
            };

            match route {
                Route::Settle => {
                    if let Some(flight) = state.in_flight.take() {
                        flight.timer.abort();
                        // Everything sent earlier has been answered by now
                        state.late.clear();
                        let result = decoded.and_then(|response| response.into_result());
                        if let Err(DspError::Protocol(err)) = &result {
                            tracing::warn!(
                                "{} channel: undecodable response to {}: {}",
                                self.inner.channel,
                                flight.request.command.name(),
                                err
                            );
                        }
                        settled.push(Settled::new(flight.request, result));
                    }
                }
                Route::Late => {
                    tracing::debug!(
                        "{} channel: discarded late response to timed-out {}",
                        self.inner.channel,
                        command.as_deref().unwrap_or_default()
                    );
                }
                Route::Unmatched => {
                    let in_flight = state.in_flight.as_ref().map(|f| f.request.command.name());
                    match &decoded {
                        Ok(response) => tracing::warn!(
                            "{} channel: unmatched response {} (in flight: {})",
                            self.inner.channel,
                            response.command,
                            in_flight.unwrap_or("none")
                        ),
                        Err(err) => tracing::warn!(
                            "{} channel: dropped undecodable frame (in flight: {}): {}",
                            self.inner.channel,
                            in_flight.unwrap_or("none"),
                            err
                        ),
                    }
                }
            }
            self.inner.dispatch(&mut state, &mut settled);
        }

        if !matches!(route, Route::Settle) {
            self.inner.recorder.note_unmatched_frame();
        }
        self.inner.finish(settled);
    }

    /// Attach the writer of a freshly opened channel and start dispatching.
    pub fn attach(&self, writer: WriterHandle) {
        let mut settled = Vec::new();
        {
            let mut state = self.inner.lock();
            state.writer = Some(writer);
            state.late.clear();
            self.inner.dispatch(&mut state, &mut settled);
        }
        self.inner.finish(settled);
    }

    /// Detach the writer and abort the in-flight request and every queued
    /// one. Returns the number of requests aborted.
    pub fn abort_all(&self, reason: &str) -> usize {
        let settled: Vec<Settled> = {
            let mut state = self.inner.lock();
            state.writer = None;
            state.late.clear();

            let mut requests = Vec::with_capacity(state.waiting.len() + 1);
            if let Some(flight) = state.in_flight.take() {
                flight.timer.abort();
                requests.push(flight.request);
            }
            requests.extend(state.waiting.drain(..));

            requests
                .into_iter()
                .map(|request| {
                    let err = DspError::Abort {
                        command: request.command.name().to_string(),
                        reason: reason.to_string(),
                    };
                    Settled::new(request, Err(err))
                })
                .collect()
        };

        let count = settled.len();
        if count > 0 {
            tracing::debug!(
                "{} channel: aborted {} request(s): {}",
                self.inner.channel,
                count,
                reason
            );
        }
        self.inner.finish(settled);
        count
    }

    /// Requests not yet settled, including the in-flight one.
    pub fn len(&self) -> usize {
        let state = self.inner.lock();
        state.waiting.len() + usize::from(state.in_flight.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Requests waiting behind the in-flight one.
    pub fn queued(&self) -> usize {
        self.inner.lock().waiting.len()
    }

    /// Name of the command currently awaiting a response.
    pub fn in_flight(&self) -> Option<String> {
        self.inner
            .lock()
            .in_flight
            .as_ref()
            .map(|f| f.request.command.name().to_string())
    }

    /// Frames handed to the writer and not yet flushed.
    pub fn pending_writes(&self) -> usize {
        self.inner
            .lock()
            .writer
            .as_ref()
            .map(WriterHandle::pending_count)
            .unwrap_or(0)
    }

    pub fn is_attached(&self) -> bool {
        self.inner.lock().writer.is_some()
    }

    #[inline]
    pub fn channel(&self) -> ChannelId {
        self.inner.channel
    }

    #[inline]
    pub fn default_timeout(&self) -> Duration {
        self.inner.default_timeout
    }
}

impl QueueInner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn not_open(&self) -> DspError {
        DspError::Transport(format!("{} channel is not open", self.channel))
    }

    /// Put the head of the queue on the wire if nothing is in flight.
    ///
    /// Requests that cannot be encoded or written are settled immediately and
    /// the next one is tried.
    fn dispatch(self: &Arc<Self>, state: &mut QueueState, settled: &mut Vec<Settled>) {
        while state.in_flight.is_none() {
            let Some(request) = state.waiting.pop_front() else {
                return;
            };

            let Some(writer) = state.writer.as_ref() else {
                settled.push(Settled::new(request, Err(self.not_open())));
                continue;
            };

            let frame = match WireCodec::encode(&request.command) {
                Ok(frame) => frame,
                Err(err) => {
                    settled.push(Settled::new(request, Err(err)));
                    continue;
                }
            };

            if let Err(err) = writer.send(frame) {
                settled.push(Settled::new(request, Err(err)));
                continue;
            }

            state.next_token += 1;
            let token = state.next_token;
            let timer = tokio::spawn(expire_after(
                Arc::downgrade(self),
                token,
                request.timeout,
            ));

            tracing::trace!(
                "{} channel: dispatched {}",
                self.channel,
                request.command.name()
            );
            state.in_flight = Some(InFlight {
                request,
                token,
                timer,
            });
        }
    }

    /// Reject the in-flight request if it is still the one `token` was
    /// issued for.
    fn expire(self: &Arc<Self>, token: u64) {
        let mut settled = Vec::new();
        {
            let mut state = self.lock();
            let current = state.in_flight.as_ref().is_some_and(|f| f.token == token);
            if !current {
                return;
            }
            if let Some(flight) = state.in_flight.take() {
                let command = flight.request.command.name().to_string();
                state.expect_late(&command);
                tracing::warn!(
                    "{} channel: {} timed out after {:?}",
                    self.channel,
                    command,
                    flight.request.timeout
                );
                let err = DspError::Timeout {
                    command,
                    timeout: flight.request.timeout,
                };
                settled.push(Settled::new(flight.request, Err(err)));
            }
            self.dispatch(&mut state, &mut settled);
        }
        self.finish(settled);
    }

    /// Record and deliver settled requests. Called without the lock held.
    fn finish(&self, settled: Vec<Settled>) {
        for Settled { request, result } in settled {
            self.recorder.record(FailureEntry::new(
                self.channel,
                request.command.name(),
                request.command.to_value(),
                &result,
                request.enqueued_at.elapsed(),
            ));
            // Caller may have dropped the future
            let _ = request.completion.send(result);
        }
    }
}

async fn expire_after(queue: Weak<QueueInner>, token: u64, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    if let Some(queue) = queue.upgrade() {
        queue.expire(token);
    }
}

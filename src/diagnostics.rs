//! Failure log and diagnostics export.
//!
//! Every settled request, success or failure, becomes one [`FailureEntry`]
//! in a bounded FIFO [`FailureLog`]. The [`OutcomeRecorder`] is the single
//! place entries are created: it appends to the log, bumps the counters, and
//! broadcasts the entry to outcome subscribers.
//!
//! [`DiagnosticBundle`] is the read-only snapshot returned by
//! [`ConnectionManager::export_diagnostics`](crate::ConnectionManager::export_diagnostics).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::control::EngineSnapshot;
use crate::error::{DspError, ErrorKind};
use crate::manager::Endpoints;
use crate::reconnect::ReconnectAttempt;
use crate::state::{unix_millis, ChannelId, ChannelState, ConnectionState};

/// Default number of entries kept.
pub const DEFAULT_FAILURE_LOG_CAPACITY: usize = 50;

/// Outcomes buffered per subscriber before the oldest are skipped.
pub const OUTCOME_CHANNEL_CAPACITY: usize = 256;

/// How a request settled.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Outcome {
    Success {
        value: Value,
    },
    Failure {
        kind: ErrorKind,
        message: String,
        /// Response value, for application errors.
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
    },
}

impl Outcome {
    pub(crate) fn from_result(result: &Result<Value, DspError>) -> Self {
        match result {
            Ok(value) => Outcome::Success {
                value: value.clone(),
            },
            Err(err) => Outcome::Failure {
                kind: err.kind(),
                message: err.to_string(),
                value: err.application_value().cloned(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Outcome::Success { .. } => None,
            Outcome::Failure { kind, .. } => Some(*kind),
        }
    }
}

/// One settled request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureEntry {
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    pub channel: ChannelId,
    pub command: String,
    /// The request as it went on the wire.
    pub request: Value,
    pub outcome: Outcome,
    /// Time from enqueue to settlement, in milliseconds.
    pub latency_ms: u64,
}

impl FailureEntry {
    pub(crate) fn new(
        channel: ChannelId,
        command: &str,
        request: Value,
        result: &Result<Value, DspError>,
        latency: Duration,
    ) -> Self {
        Self {
            timestamp_ms: unix_millis(SystemTime::now()),
            channel,
            command: command.to_string(),
            request,
            outcome: Outcome::from_result(result),
            latency_ms: latency.as_millis() as u64,
        }
    }
}

/// Summary counters since the manager was built.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Counters {
    pub recorded: u64,
    pub succeeded: u64,
    pub transport_errors: u64,
    pub timeouts: u64,
    pub protocol_errors: u64,
    pub aborted: u64,
    pub application_errors: u64,
    /// Frames that matched no in-flight request.
    pub unmatched_frames: u64,
    /// Entries pushed out of the log by newer ones.
    pub evicted: u64,
    /// Successful reconnects, both channels.
    pub reconnects: u64,
}

/// Bounded FIFO of request outcomes.
#[derive(Debug)]
pub struct FailureLog {
    capacity: usize,
    entries: VecDeque<FailureEntry>,
    counters: Counters,
}

impl FailureLog {
    /// Create a log keeping at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
            counters: Counters::default(),
        }
    }

    /// Append an entry, evicting the oldest when full.
    pub fn record(&mut self, entry: FailureEntry) {
        self.counters.recorded += 1;
        match entry.outcome.error_kind() {
            None => self.counters.succeeded += 1,
            Some(ErrorKind::Transport) => self.counters.transport_errors += 1,
            Some(ErrorKind::Timeout) => self.counters.timeouts += 1,
            Some(ErrorKind::Protocol) => self.counters.protocol_errors += 1,
            Some(ErrorKind::Abort) => self.counters.aborted += 1,
            Some(ErrorKind::Application) => self.counters.application_errors += 1,
        }

        if self.entries.len() == self.capacity {
            self.entries.pop_front();
            self.counters.evicted += 1;
        }
        self.entries.push_back(entry);
    }

    pub fn note_unmatched_frame(&mut self) {
        self.counters.unmatched_frames += 1;
    }

    pub fn note_reconnect(&mut self) {
        self.counters.reconnects += 1;
    }

    /// Entries, oldest first.
    pub fn entries(&self) -> impl Iterator<Item = &FailureEntry> {
        self.entries.iter()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }
}

impl Default for FailureLog {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_LOG_CAPACITY)
    }
}

/// Shared sink for request outcomes.
///
/// Cheaply cloneable; every queue holds one.
#[derive(Clone)]
pub struct OutcomeRecorder {
    log: Arc<Mutex<FailureLog>>,
    outcomes: broadcast::Sender<FailureEntry>,
}

impl OutcomeRecorder {
    pub fn new(capacity: usize) -> Self {
        let (outcomes, _) = broadcast::channel(OUTCOME_CHANNEL_CAPACITY);
        Self {
            log: Arc::new(Mutex::new(FailureLog::new(capacity))),
            outcomes,
        }
    }

    /// Record an outcome and publish it to subscribers.
    pub fn record(&self, entry: FailureEntry) {
        if let Some(kind) = entry.outcome.error_kind() {
            tracing::debug!(
                "{} request {} failed ({:?})",
                entry.channel,
                entry.command,
                kind
            );
        }
        self.lock().record(entry.clone());
        // No subscribers is fine
        let _ = self.outcomes.send(entry);
    }

    pub fn note_unmatched_frame(&self) {
        self.lock().note_unmatched_frame();
    }

    pub fn note_reconnect(&self) {
        self.lock().note_reconnect();
    }

    /// Subscribe to every future outcome.
    pub fn subscribe(&self) -> broadcast::Receiver<FailureEntry> {
        self.outcomes.subscribe()
    }

    /// Copy of the current entries (oldest first) and counters.
    pub fn snapshot(&self) -> (Vec<FailureEntry>, Counters) {
        let log = self.lock();
        (log.entries().cloned().collect(), log.counters().clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FailureLog> {
        self.log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Per-channel part of a [`DiagnosticBundle`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelDiagnostics {
    pub id: ChannelId,
    pub endpoint: String,
    pub state: ChannelState,
    /// Requests waiting behind the in-flight one.
    pub queued: usize,
    /// Command currently awaiting a response.
    pub in_flight: Option<String>,
    /// Frames handed to the writer and not yet flushed.
    pub pending_writes: usize,
    pub reconnect: ReconnectAttempt,
    pub last_close_reason: Option<String>,
}

/// Read-only diagnostics snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticBundle {
    pub generated_at_ms: u64,
    pub state: ConnectionState,
    /// Endpoints of the current or last connection, kept after disconnect.
    pub endpoints: Option<Endpoints>,
    pub channels: Vec<ChannelDiagnostics>,
    pub engine: EngineSnapshot,
    /// Most recent outcomes, oldest first.
    pub recent: Vec<FailureEntry>,
    pub counters: Counters,
}

impl DiagnosticBundle {
    /// Endpoint of a channel, if a connection was ever attempted.
    pub fn endpoint(&self, id: ChannelId) -> Option<&str> {
        self.channels
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.endpoint.as_str())
            .or_else(|| self.endpoints.as_ref().map(|e| e.get(id)))
    }

    /// Recent entries that did not succeed.
    pub fn failures(&self) -> impl Iterator<Item = &FailureEntry> {
        self.recent.iter().filter(|e| !e.outcome.is_success())
    }

    /// Serialize as pretty JSON for export.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

//! Channel and aggregate connection states.
//!
//! The aggregate [`ConnectionState`] is never stored on its own; the manager
//! recomputes it with [`ConnectionState::derive`] whenever a channel changes
//! state or the manager's [`Lifecycle`] moves.
//!
//! ```text
//!  control      spectrum          Running        Initializing
//!  Open         Open              Connected      Connected
//!  Open         Closed/Connecting Degraded       Connecting
//!  Connecting   any               Connecting     Connecting
//!  Closed       any               Error          Connecting
//! ```
//!
//! In [`Lifecycle::Idle`] every combination is `Disconnected`.

use std::fmt;
use std::time::SystemTime;

use serde::Serialize;

/// Which of the two channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelId {
    /// Commands, configuration, status queries.
    Control,
    /// Level meter polling.
    Spectrum,
}

impl ChannelId {
    /// Both channels, control first.
    pub const ALL: [ChannelId; 2] = [ChannelId::Control, ChannelId::Spectrum];

    /// Lowercase name used in logs and diagnostics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelId::Control => "control",
            ChannelId::Spectrum => "spectrum",
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of one channel.
///
/// Moves `Closed → Connecting → Open → Closed`, or `Connecting → Closed` when
/// an open attempt fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChannelState {
    Closed,
    Connecting,
    Open,
}

impl ChannelState {
    /// Check whether moving from `self` to `next` skips no intermediate state.
    pub fn can_transition_to(self, next: ChannelState) -> bool {
        matches!(
            (self, next),
            (ChannelState::Closed, ChannelState::Connecting)
                | (ChannelState::Connecting, ChannelState::Open)
                | (ChannelState::Connecting, ChannelState::Closed)
                | (ChannelState::Open, ChannelState::Closed)
        )
    }
}

/// Where the manager is in its own lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Lifecycle {
    /// Never connected, or explicitly disconnected.
    Idle,
    /// Inside `connect()`, before both open attempts have settled.
    Initializing,
    /// `connect()` has settled; channel loss now shows as `Error`.
    Running,
}

/// Aggregate connection state exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Control is healthy, spectrum is not.
    Degraded,
    /// Control is down after having been attempted.
    Error,
}

impl ConnectionState {
    /// Derive the aggregate state from the lifecycle and both channel states.
    pub fn derive(
        lifecycle: Lifecycle,
        control: ChannelState,
        spectrum: ChannelState,
    ) -> ConnectionState {
        use ChannelState::{Closed, Connecting, Open};

        match lifecycle {
            Lifecycle::Idle => ConnectionState::Disconnected,
            Lifecycle::Initializing => match (control, spectrum) {
                (Open, Open) => ConnectionState::Connected,
                _ => ConnectionState::Connecting,
            },
            Lifecycle::Running => match (control, spectrum) {
                (Open, Open) => ConnectionState::Connected,
                (Open, _) => ConnectionState::Degraded,
                (Connecting, _) => ConnectionState::Connecting,
                (Closed, _) => ConnectionState::Error,
            },
        }
    }

    /// True for `Connected` and `Degraded`: control requests can be served.
    pub fn is_usable(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Degraded)
    }
}

/// One published change of the aggregate state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    /// Milliseconds since the Unix epoch.
    pub at_ms: u64,
}

impl StateTransition {
    pub(crate) fn now(from: ConnectionState, to: ConnectionState) -> Self {
        Self {
            from,
            to,
            at_ms: unix_millis(SystemTime::now()),
        }
    }
}

/// Milliseconds since the Unix epoch, saturating at zero for earlier times.
pub(crate) fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

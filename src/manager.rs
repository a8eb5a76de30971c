//! Connection manager and builder.
//!
//! The [`ManagerBuilder`] provides a fluent API for timeouts, reconnect
//! policy, startup sequence and transport. The [`ConnectionManager`] owns
//! both channels and drives the lifecycle:
//! 1. Open the control channel
//! 2. Queue the startup sequence
//! 3. Open the spectrum channel (failure only degrades)
//! 4. Reconnect either channel after an unexpected loss
//!
//! # Example
//!
//! ```no_run
//! use dspctl_client::{ChannelId, ConnectionManager, ConnectionState};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = ConnectionManager::builder()
//!         .control_timeout(std::time::Duration::from_secs(5))
//!         .build();
//!
//!     let state = manager.connect("127.0.0.1", 1234, 1235).await?;
//!     assert!(matches!(state, ConnectionState::Connected | ConnectionState::Degraded));
//!
//!     let version = manager.send(ChannelId::Control, "GetVersion").await?;
//!     println!("engine {}", version);
//!
//!     manager.disconnect();
//!     Ok(())
//! }
//! ```

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, SystemTime};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::channel::{Channel, ChannelObserver, CloseReason};
use crate::control::{apply, run_startup, EngineSnapshot, StartupSequence};
use crate::diagnostics::{
    ChannelDiagnostics, DiagnosticBundle, FailureEntry, OutcomeRecorder,
    DEFAULT_FAILURE_LOG_CAPACITY,
};
use crate::error::{DspError, Result};
use crate::events::{spawn_handler, StateEvents};
use crate::protocol::{commands, Command};
use crate::queue::RequestQueue;
use crate::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::state::{unix_millis, ChannelId, ChannelState, ConnectionState, Lifecycle, StateTransition};
use crate::transport::{Connector, WebSocketConnector};

/// Default response deadline on the control channel.
pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_secs(10);

/// Default response deadline on the spectrum channel.
pub const DEFAULT_SPECTRUM_TIMEOUT: Duration = Duration::from_secs(2);

/// Default deadline for establishing a channel connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Endpoint URLs for both channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoints {
    pub control: String,
    pub spectrum: String,
}

impl Endpoints {
    pub fn new(control: impl Into<String>, spectrum: impl Into<String>) -> Self {
        Self {
            control: control.into(),
            spectrum: spectrum.into(),
        }
    }

    /// `ws://address:port` for each channel.
    pub fn websocket(address: &str, control_port: u16, spectrum_port: u16) -> Self {
        Self::new(
            format!("ws://{}:{}", address, control_port),
            format!("ws://{}:{}", address, spectrum_port),
        )
    }

    pub fn get(&self, channel: ChannelId) -> &str {
        match channel {
            ChannelId::Control => &self.control,
            ChannelId::Spectrum => &self.spectrum,
        }
    }
}

/// Manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Default response deadline on the control channel.
    pub control_timeout: Duration,
    /// Default response deadline on the spectrum channel.
    pub spectrum_timeout: Duration,
    pub connect_timeout: Duration,
    pub reconnect: ReconnectConfig,
    /// Entries kept in the failure log.
    pub failure_log_capacity: usize,
    /// Queries issued each time the control channel opens.
    pub startup: StartupSequence,
    /// Fixed jitter seed; random per channel when `None`.
    pub jitter_seed: Option<u64>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            control_timeout: DEFAULT_CONTROL_TIMEOUT,
            spectrum_timeout: DEFAULT_SPECTRUM_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect: ReconnectConfig::default(),
            failure_log_capacity: DEFAULT_FAILURE_LOG_CAPACITY,
            startup: StartupSequence::default(),
            jitter_seed: None,
        }
    }
}

impl ManagerConfig {
    fn request_timeout(&self, channel: ChannelId) -> Duration {
        match channel {
            ChannelId::Control => self.control_timeout,
            ChannelId::Spectrum => self.spectrum_timeout,
        }
    }
}

/// Builder for configuring and creating a [`ConnectionManager`].
pub struct ManagerBuilder {
    config: ManagerConfig,
    connector: Option<Arc<dyn Connector>>,
}

impl ManagerBuilder {
    /// Create a builder with default configuration.
    pub fn new() -> Self {
        Self {
            config: ManagerConfig::default(),
            connector: None,
        }
    }

    /// Start from an existing configuration.
    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the default control request timeout.
    ///
    /// Default: 10 seconds
    pub fn control_timeout(mut self, timeout: Duration) -> Self {
        self.config.control_timeout = timeout;
        self
    }

    /// Set the default spectrum request timeout.
    ///
    /// Default: 2 seconds
    pub fn spectrum_timeout(mut self, timeout: Duration) -> Self {
        self.config.spectrum_timeout = timeout;
        self
    }

    /// Set the connection establishment timeout.
    ///
    /// Default: 5 seconds
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Replace the reconnect policy configuration.
    pub fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.config.reconnect = reconnect;
        self
    }

    /// Set the number of consecutive reconnect attempts before giving up.
    ///
    /// Default: 10
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.config.reconnect.max_attempts = attempts;
        self
    }

    /// Set the failure log capacity.
    ///
    /// Default: 50
    pub fn failure_log_capacity(mut self, capacity: usize) -> Self {
        self.config.failure_log_capacity = capacity;
        self
    }

    /// Set the queries issued whenever the control channel opens.
    pub fn startup_sequence(mut self, sequence: StartupSequence) -> Self {
        self.config.startup = sequence;
        self
    }

    /// Seed the reconnect jitter for reproducible delays.
    pub fn jitter_seed(mut self, seed: u64) -> Self {
        self.config.jitter_seed = Some(seed);
        self
    }

    /// Use a custom transport. Default: WebSocket.
    pub fn connector(mut self, connector: impl Connector) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Build the manager. Nothing connects until `connect()`.
    pub fn build(self) -> ConnectionManager {
        let recorder = OutcomeRecorder::new(self.config.failure_log_capacity);
        let idle_queues = ChannelId::ALL.map(|id| {
            RequestQueue::new(id, self.config.request_timeout(id), recorder.clone())
        });

        let connector: Arc<dyn Connector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(WebSocketConnector::new()),
        };

        ConnectionManager {
            inner: Arc::new(ManagerInner {
                connector,
                config: self.config,
                recorder,
                events: StateEvents::new(),
                idle_queues,
                core: Mutex::new(ManagerCore {
                    lifecycle: Lifecycle::Idle,
                    epoch: 0,
                    endpoints: None,
                    control: None,
                    spectrum: None,
                    engine: EngineSnapshot::default(),
                }),
            }),
        }
    }
}

impl Default for ManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct ChannelSlot {
    channel: Channel,
    reconnect: ReconnectPolicy,
    reconnecting: bool,
    retry: Option<JoinHandle<()>>,
}

struct ManagerCore {
    lifecycle: Lifecycle,
    /// Bumped by every connect and disconnect; stale work checks it.
    epoch: u64,
    endpoints: Option<Endpoints>,
    control: Option<ChannelSlot>,
    spectrum: Option<ChannelSlot>,
    engine: EngineSnapshot,
}

impl ManagerCore {
    fn slot(&self, channel: ChannelId) -> Option<&ChannelSlot> {
        match channel {
            ChannelId::Control => self.control.as_ref(),
            ChannelId::Spectrum => self.spectrum.as_ref(),
        }
    }

    fn slot_mut(&mut self, channel: ChannelId) -> Option<&mut ChannelSlot> {
        match channel {
            ChannelId::Control => self.control.as_mut(),
            ChannelId::Spectrum => self.spectrum.as_mut(),
        }
    }

    fn take_slots(&mut self) -> Vec<ChannelSlot> {
        self.control
            .take()
            .into_iter()
            .chain(self.spectrum.take())
            .collect()
    }
}

struct ManagerInner {
    config: ManagerConfig,
    connector: Arc<dyn Connector>,
    recorder: OutcomeRecorder,
    events: StateEvents,
    /// Detached queues that reject and record requests while no channel
    /// exists.
    idle_queues: [RequestQueue; 2],
    core: Mutex<ManagerCore>,
}

/// Client for the engine's control and spectrum channels.
///
/// Cheaply cloneable; clones share the same connections.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    /// Create a new manager builder.
    pub fn builder() -> ManagerBuilder {
        ManagerBuilder::new()
    }

    /// Create a manager with default configuration over WebSocket.
    pub fn new() -> Self {
        ManagerBuilder::new().build()
    }

    /// Connect to `ws://address:control_port` and `ws://address:spectrum_port`.
    ///
    /// See [`connect_endpoints`](Self::connect_endpoints).
    pub async fn connect(
        &self,
        address: &str,
        control_port: u16,
        spectrum_port: u16,
    ) -> Result<ConnectionState> {
        self.connect_endpoints(Endpoints::websocket(address, control_port, spectrum_port))
            .await
    }

    /// Connect both channels, replacing any existing connection.
    ///
    /// Resolves with `Connected`, or `Degraded` if only the spectrum channel
    /// failed.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the control channel cannot be opened.
    /// The state is then `Error`.
    pub async fn connect_endpoints(&self, endpoints: Endpoints) -> Result<ConnectionState> {
        let inner = &self.inner;
        tracing::info!(
            "Connecting to {} (control) and {} (spectrum)",
            endpoints.control,
            endpoints.spectrum
        );

        let (epoch, old_slots, control, spectrum) = {
            let mut core = inner.lock();
            core.epoch += 1;
            let epoch = core.epoch;
            core.lifecycle = Lifecycle::Initializing;
            let old_slots = core.take_slots();

            let control = inner.new_slot(epoch, ChannelId::Control, &endpoints);
            let spectrum = inner.new_slot(epoch, ChannelId::Spectrum, &endpoints);
            let channels = (control.channel.clone(), spectrum.channel.clone());
            core.control = Some(control);
            core.spectrum = Some(spectrum);
            core.endpoints = Some(endpoints);

            (epoch, old_slots, channels.0, channels.1)
        };
        teardown(old_slots);
        inner.recompute();

        if let Err(err) = control.open().await {
            tracing::error!("Control channel failed to connect: {}", err);
            inner.finish_connect(epoch);
            return Err(err);
        }
        inner.start_session(epoch, &control);

        if let Err(err) = spectrum.open().await {
            tracing::warn!("Spectrum channel failed to connect, continuing degraded: {}", err);
        }

        if !inner.finish_connect(epoch) {
            return Err(DspError::Transport(
                "connection attempt was superseded".to_string(),
            ));
        }
        Ok(self.state())
    }

    /// Close both channels and cancel pending reconnects.
    ///
    /// Every queued and in-flight request is aborted. The state becomes
    /// `Disconnected`.
    pub fn disconnect(&self) {
        let slots = {
            let mut core = self.inner.lock();
            core.epoch += 1;
            core.lifecycle = Lifecycle::Idle;
            core.take_slots()
        };
        let had_channels = !slots.is_empty();
        teardown(slots);
        self.inner.recompute();
        if had_channels {
            tracing::info!("Disconnected");
        }
    }

    /// Queue `command` on `channel` with the channel's default timeout.
    ///
    /// The request takes its place in the channel's queue when this is
    /// called. Requests on one channel settle in the order they were sent.
    pub fn send(
        &self,
        channel: ChannelId,
        command: impl Into<Command>,
    ) -> BoxFuture<'static, Result<Value>> {
        self.inner.queue(channel).enqueue(command.into(), None).boxed()
    }

    /// Like [`send`](Self::send) with an explicit timeout.
    pub fn send_with_timeout(
        &self,
        channel: ChannelId,
        command: impl Into<Command>,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<Value>> {
        self.inner
            .queue(channel)
            .enqueue(command.into(), Some(timeout))
            .boxed()
    }

    /// Send a bare control command and deserialize its value.
    pub async fn query<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let value = self.send(ChannelId::Control, name).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Apply a configuration, then read it back.
    ///
    /// Resolves with the configuration the engine reports after the apply.
    /// The read-back is queued only after the apply has settled.
    pub async fn apply_config<T: Serialize + ?Sized>(&self, config: &T) -> Result<Value> {
        let payload = apply::encode_config(config)?;
        let confirmed =
            apply::apply_then_confirm(&self.inner.queue(ChannelId::Control), payload).await?;
        self.inner.lock().engine.config = Some(confirmed.clone());
        Ok(confirmed)
    }

    /// Fetch the active configuration.
    pub async fn fetch_config(&self) -> Result<Value> {
        let config = self
            .send(ChannelId::Control, commands::GET_CONFIG_JSON)
            .await?;
        self.inner.lock().engine.config = Some(config.clone());
        Ok(config)
    }

    /// Ask the engine to validate a configuration without applying it.
    pub async fn validate_config<T: Serialize + ?Sized>(&self, config: &T) -> Result<Value> {
        let payload = apply::encode_config(config)?;
        apply::validate(&self.inner.queue(ChannelId::Control), payload).await
    }

    /// Current aggregate state.
    pub fn state(&self) -> ConnectionState {
        self.inner.events.current()
    }

    /// Receiver that always holds the current state.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.events.watch()
    }

    /// Subscribe to every future state transition.
    pub fn subscribe_state(&self) -> broadcast::Receiver<StateTransition> {
        self.inner.events.subscribe()
    }

    /// Call `handler` on every future state transition.
    ///
    /// Runs until the manager is dropped or the returned handle is aborted.
    pub fn on_state_change<F>(&self, handler: F) -> JoinHandle<()>
    where
        F: Fn(StateTransition) + Send + 'static,
    {
        spawn_handler(self.subscribe_state(), handler)
    }

    /// Subscribe to every future request outcome.
    ///
    /// A receiver more than
    /// [`OUTCOME_CHANNEL_CAPACITY`](crate::diagnostics::OUTCOME_CHANNEL_CAPACITY)
    /// outcomes behind gets
    /// [`RecvError::Lagged`](tokio::sync::broadcast::error::RecvError::Lagged).
    pub fn subscribe_outcomes(&self) -> broadcast::Receiver<FailureEntry> {
        self.inner.recorder.subscribe()
    }

    /// Call `handler` on every future request outcome.
    ///
    /// Up to [`OUTCOME_CHANNEL_CAPACITY`](crate::diagnostics::OUTCOME_CHANNEL_CAPACITY)
    /// outcomes are buffered. A handler that falls further behind skips the
    /// oldest ones with a `lagged` warning; the failure log and counters
    /// still see every outcome.
    pub fn on_request_outcome<F>(&self, handler: F) -> JoinHandle<()>
    where
        F: Fn(FailureEntry) + Send + 'static,
    {
        spawn_handler(self.subscribe_outcomes(), handler)
    }

    /// What the client last learned about the engine.
    pub fn engine_snapshot(&self) -> EngineSnapshot {
        self.inner.lock().engine.clone()
    }

    /// Snapshot of state, channels, recent outcomes and counters.
    pub fn export_diagnostics(&self) -> DiagnosticBundle {
        let (channels, engine, endpoints) = {
            let core = self.inner.lock();
            let channels: Vec<_> = ChannelId::ALL
                .iter()
                .filter_map(|id| core.slot(*id))
                .map(|slot| (slot.channel.clone(), slot.reconnect.snapshot()))
                .collect();
            (channels, core.engine.clone(), core.endpoints.clone())
        };

        let channels = channels
            .into_iter()
            .map(|(channel, reconnect)| {
                let queue = channel.queue();
                ChannelDiagnostics {
                    id: channel.id(),
                    endpoint: channel.endpoint().to_string(),
                    state: channel.state(),
                    queued: queue.queued(),
                    in_flight: queue.in_flight(),
                    pending_writes: queue.pending_writes(),
                    reconnect,
                    last_close_reason: channel.last_close_reason().map(|r| r.to_string()),
                }
            })
            .collect();

        let (recent, counters) = self.inner.recorder.snapshot();
        DiagnosticBundle {
            generated_at_ms: unix_millis(SystemTime::now()),
            state: self.state(),
            endpoints,
            channels,
            engine,
            recent,
            counters,
        }
    }

    /// Endpoints of the current or last connection.
    pub fn endpoints(&self) -> Option<Endpoints> {
        self.inner.lock().endpoints.clone()
    }

    /// State of one channel; `Closed` when never connected.
    pub fn channel_state(&self, channel: ChannelId) -> ChannelState {
        self.inner
            .channel(channel)
            .map(|c| c.state())
            .unwrap_or(ChannelState::Closed)
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagerInner {
    fn lock(&self) -> MutexGuard<'_, ManagerCore> {
        self.core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn new_slot(self: &Arc<Self>, epoch: u64, id: ChannelId, endpoints: &Endpoints) -> ChannelSlot {
        let queue = RequestQueue::new(id, self.config.request_timeout(id), self.recorder.clone());
        let observer = Arc::new(ManagerObserver {
            manager: Arc::downgrade(self),
            epoch,
        });
        let channel = Channel::new(
            id,
            endpoints.get(id),
            self.connector.clone(),
            self.config.connect_timeout,
            queue,
            observer,
        );

        let reconnect = match self.config.jitter_seed {
            Some(seed) => ReconnectPolicy::new(self.config.reconnect.clone(), seed),
            None => ReconnectPolicy::with_random_seed(self.config.reconnect.clone()),
        };

        ChannelSlot {
            channel,
            reconnect,
            reconnecting: false,
            retry: None,
        }
    }

    fn channel(&self, id: ChannelId) -> Option<Channel> {
        self.lock().slot(id).map(|slot| slot.channel.clone())
    }

    /// Queue of the live channel, or the detached queue when none exists.
    fn queue(&self, id: ChannelId) -> RequestQueue {
        match self.channel(id) {
            Some(channel) => channel.queue().clone(),
            None => match id {
                ChannelId::Control => self.idle_queues[0].clone(),
                ChannelId::Spectrum => self.idle_queues[1].clone(),
            },
        }
    }

    /// Derive the aggregate state and publish it if it changed.
    fn recompute(&self) {
        let _publish = self.events.publish_lock();
        let (lifecycle, control, spectrum) = {
            let core = self.lock();
            (
                core.lifecycle,
                core.control.as_ref().map(|s| s.channel.clone()),
                core.spectrum.as_ref().map(|s| s.channel.clone()),
            )
        };
        let control = control.map(|c| c.state()).unwrap_or(ChannelState::Closed);
        let spectrum = spectrum.map(|c| c.state()).unwrap_or(ChannelState::Closed);

        self.events
            .publish(ConnectionState::derive(lifecycle, control, spectrum));
    }

    /// Leave `Initializing`. False if `epoch` is no longer current.
    fn finish_connect(&self, epoch: u64) -> bool {
        {
            let mut core = self.lock();
            if core.epoch != epoch {
                return false;
            }
            core.lifecycle = Lifecycle::Running;
        }
        self.recompute();
        true
    }

    /// Queue the startup sequence on a freshly opened control channel.
    fn start_session(self: &Arc<Self>, epoch: u64, control: &Channel) {
        if self.config.startup.is_empty() {
            return;
        }
        let pending = run_startup(control.queue(), &self.config.startup);
        let manager = Arc::downgrade(self);

        tokio::spawn(async move {
            let results = pending.await;
            if let Some(manager) = manager.upgrade() {
                let mut core = manager.lock();
                if core.epoch == epoch {
                    core.engine.record_startup(results);
                }
            }
        });
    }

    /// Start the reconnect loop for `id` unless one is already running.
    fn schedule_reconnect(self: &Arc<Self>, epoch: u64, id: ChannelId) {
        let mut core = self.lock();
        if core.epoch != epoch || core.lifecycle == Lifecycle::Idle {
            return;
        }
        let Some(slot) = core.slot_mut(id) else {
            return;
        };
        if slot.reconnecting {
            return;
        }

        slot.reconnecting = true;
        slot.retry = Some(tokio::spawn(reconnect_loop(Arc::downgrade(self), epoch, id)));
    }
}

fn teardown(slots: Vec<ChannelSlot>) {
    for slot in slots {
        if let Some(retry) = slot.retry {
            retry.abort();
        }
        slot.channel.close();
    }
}

async fn reconnect_loop(manager: Weak<ManagerInner>, epoch: u64, id: ChannelId) {
    loop {
        let next = {
            let Some(inner) = manager.upgrade() else {
                return;
            };
            let mut core = inner.lock();
            if core.epoch != epoch {
                return;
            }
            let Some(slot) = core.slot_mut(id) else {
                return;
            };
            let next = match slot.reconnect.next_delay() {
                Some(delay) => Ok((delay, slot.channel.clone())),
                None => {
                    slot.reconnecting = false;
                    Err(slot.reconnect.attempt())
                }
            };
            next
        };

        let (delay, channel) = match next {
            Ok(next) => next,
            Err(attempts) => {
                if id == ChannelId::Control {
                    tracing::error!(
                        "Control channel reconnection exhausted after {} attempts",
                        attempts
                    );
                } else {
                    tracing::warn!(
                        "{} channel reconnection exhausted after {} attempts",
                        id,
                        attempts
                    );
                }
                return;
            }
        };

        tracing::info!("Reconnecting {} channel in {:?}", id, delay);
        tokio::time::sleep(delay).await;

        if let Err(err) = channel.open().await {
            tracing::warn!("{} channel reconnect failed: {}", id, err);
            continue;
        }

        let Some(inner) = manager.upgrade() else {
            return;
        };
        {
            let mut core = inner.lock();
            if core.epoch != epoch {
                return;
            }
            let Some(slot) = core.slot_mut(id) else {
                return;
            };
            if channel.state() != ChannelState::Open {
                // Lost again before the slot was updated; that loss saw
                // `reconnecting` still set, so keep going here
                continue;
            }
            slot.reconnect.reset();
            slot.reconnecting = false;
        }

        inner.recorder.note_reconnect();
        tracing::info!("{} channel reconnected", id);
        if id == ChannelId::Control {
            inner.start_session(epoch, &channel);
        }
        return;
    }
}

/// Routes channel notifications for one connection epoch to the manager.
struct ManagerObserver {
    manager: Weak<ManagerInner>,
    epoch: u64,
}

impl ChannelObserver for ManagerObserver {
    fn state_changed(&self, _channel: ChannelId, _state: ChannelState) {
        if let Some(manager) = self.manager.upgrade() {
            manager.recompute();
        }
    }

    fn closed(&self, channel: ChannelId, reason: &CloseReason) {
        if !reason.is_unexpected() {
            return;
        }
        if let Some(manager) = self.manager.upgrade() {
            manager.schedule_reconnect(self.epoch, channel);
        }
    }
}

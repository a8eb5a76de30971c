//! Scripted mock engine on the in-memory transport.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dspctl_client::transport::{MemoryConnector, MemoryListener, MemoryPeer};
use dspctl_client::{ChannelId, ConnectionManager, ConnectionState, Endpoints, ManagerBuilder};
use serde_json::{json, Map, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub const ADDRESS: &str = "mock";
pub const CONTROL_PORT: u16 = 1234;
pub const SPECTRUM_PORT: u16 = 1235;
pub const MOCK_VERSION: &str = "2.0.0-mock";

/// Engine-side state shared by every connection.
struct EngineState {
    config: Mutex<Value>,
    volume: Mutex<f64>,
    revision: AtomicU64,
    silent: Mutex<HashSet<String>>,
}

struct Endpoint {
    url: String,
    server: Mutex<Option<JoinHandle<()>>>,
    kick: broadcast::Sender<()>,
    accepted: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<String>>>,
}

/// Fake engine answering both channels.
pub struct MockEngine {
    pub connector: MemoryConnector,
    state: Arc<EngineState>,
    control: Endpoint,
    spectrum: Endpoint,
}

impl MockEngine {
    /// Listen on both channels.
    pub fn start() -> Self {
        let engine = Self::new();
        engine.listen(ChannelId::Control);
        engine.listen(ChannelId::Spectrum);
        engine
    }

    /// Listen on the control channel only.
    pub fn start_control_only() -> Self {
        let engine = Self::new();
        engine.listen(ChannelId::Control);
        engine
    }

    fn new() -> Self {
        let endpoints = Self::endpoints();
        Self {
            connector: MemoryConnector::new(),
            state: Arc::new(EngineState {
                config: Mutex::new(json!({
                    "devices": {"samplerate": 48000, "chunksize": 1024},
                    "filters": {}
                })),
                volume: Mutex::new(-20.0),
                revision: AtomicU64::new(0),
                silent: Mutex::new(HashSet::new()),
            }),
            control: Endpoint::new(endpoints.control),
            spectrum: Endpoint::new(endpoints.spectrum),
        }
    }

    pub fn endpoints() -> Endpoints {
        Endpoints::websocket(ADDRESS, CONTROL_PORT, SPECTRUM_PORT)
    }

    /// Builder wired to this engine with a fixed jitter seed.
    pub fn manager(&self) -> ManagerBuilder {
        ConnectionManager::builder()
            .connector(self.connector.clone())
            .jitter_seed(7)
    }

    fn endpoint(&self, channel: ChannelId) -> &Endpoint {
        match channel {
            ChannelId::Control => &self.control,
            ChannelId::Spectrum => &self.spectrum,
        }
    }

    /// Start accepting on `channel`.
    pub fn listen(&self, channel: ChannelId) {
        let endpoint = self.endpoint(channel);
        let listener = self.connector.listen(&endpoint.url);
        let task = tokio::spawn(serve(
            listener,
            self.state.clone(),
            endpoint.kick.clone(),
            endpoint.accepted.clone(),
            endpoint.received.clone(),
        ));
        if let Some(old) = endpoint.server.lock().unwrap().replace(task) {
            old.abort();
        }
    }

    /// Stop accepting on `channel`. Existing connections stay up.
    pub fn stop_listening(&self, channel: ChannelId) {
        if let Some(task) = self.endpoint(channel).server.lock().unwrap().take() {
            task.abort();
        }
    }

    /// Close every open connection on `channel` from the engine side.
    pub fn drop_connections(&self, channel: ChannelId) {
        let _ = self.endpoint(channel).kick.send(());
    }

    /// Connections accepted on `channel` so far.
    pub fn connections(&self, channel: ChannelId) -> usize {
        self.endpoint(channel).accepted.load(Ordering::SeqCst)
    }

    /// Command names received on `channel`, in arrival order.
    pub fn received(&self, channel: ChannelId) -> Vec<String> {
        self.endpoint(channel).received.lock().unwrap().clone()
    }

    /// Never answer `command`.
    pub fn silence(&self, command: &str) {
        self.state.silent.lock().unwrap().insert(command.to_string());
    }

    pub fn config(&self) -> Value {
        self.state.config.lock().unwrap().clone()
    }
}

impl Endpoint {
    fn new(url: String) -> Self {
        let (kick, _) = broadcast::channel(4);
        Self {
            url,
            server: Mutex::new(None),
            kick,
            accepted: Arc::new(AtomicUsize::new(0)),
            received: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

async fn serve(
    mut listener: MemoryListener,
    state: Arc<EngineState>,
    kick: broadcast::Sender<()>,
    accepted: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<String>>>,
) {
    while let Some(peer) = listener.accept().await {
        accepted.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(answer(peer, state.clone(), kick.subscribe(), received.clone()));
    }
}

async fn answer(
    mut peer: MemoryPeer,
    state: Arc<EngineState>,
    mut kick: broadcast::Receiver<()>,
    received: Arc<Mutex<Vec<String>>>,
) {
    loop {
        tokio::select! {
            frame = peer.recv() => {
                let Some(frame) = frame else { return };
                let (name, arg) = parse_request(&frame);
                received.lock().unwrap().push(name.clone());
                if let Some(reply) = state.reply(&name, arg) {
                    peer.send(reply);
                }
            }
            _ = kick.recv() => return,
        }
    }
}

fn parse_request(frame: &str) -> (String, Option<Value>) {
    match serde_json::from_str::<Value>(frame) {
        Ok(Value::String(name)) => (name, None),
        Ok(Value::Object(map)) if map.len() == 1 => {
            let (name, arg) = map.into_iter().next().unwrap();
            (name, Some(arg))
        }
        _ => ("<malformed>".to_string(), None),
    }
}

pub fn envelope(command: &str, result: &str, value: Value) -> String {
    let mut map = Map::new();
    map.insert(
        command.to_string(),
        json!({"result": result, "value": value}),
    );
    Value::Object(map).to_string()
}

impl EngineState {
    fn reply(&self, name: &str, arg: Option<Value>) -> Option<String> {
        if self.silent.lock().unwrap().contains(name) {
            return None;
        }

        let reply = match name {
            "GetVersion" => envelope(name, "Ok", json!(MOCK_VERSION)),
            "GetState" => envelope(name, "Ok", json!("Running")),
            "GetConfigJson" => {
                let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
                let mut config = self.config.lock().unwrap().clone();
                config["revision"] = json!(revision);
                envelope(name, "Ok", json!(config.to_string()))
            }
            "SetConfigJson" | "ValidateConfigJson" => {
                match arg.as_ref().and_then(Value::as_str).map(check_config) {
                    Some(Ok(config)) => {
                        if name == "SetConfigJson" {
                            *self.config.lock().unwrap() = config;
                            envelope(name, "Ok", Value::Null)
                        } else {
                            envelope(name, "Ok", json!("OK"))
                        }
                    }
                    Some(Err(reason)) => envelope(name, "Error", json!(reason)),
                    None => envelope(name, "Error", json!("expected a JSON string")),
                }
            }
            "GetVolume" => envelope(name, "Ok", json!(*self.volume.lock().unwrap())),
            "SetVolume" => match arg.as_ref().and_then(Value::as_f64) {
                Some(volume) => {
                    *self.volume.lock().unwrap() = volume;
                    envelope(name, "Ok", Value::Null)
                }
                None => envelope(name, "Error", json!("expected a number")),
            },
            "GetPlaybackSignalPeak" | "GetPlaybackSignalRms" => {
                envelope(name, "Ok", json!([-12.5, -13.0]))
            }
            _ => envelope(name, "Error", json!("unknown command")),
        };
        Some(reply)
    }
}

fn check_config(text: &str) -> Result<Value, String> {
    let config: Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
    if config.get("devices").is_none() {
        return Err("missing devices section".to_string());
    }
    Ok(config)
}

/// Wait until the manager reports `state`.
pub async fn wait_for_state(manager: &ConnectionManager, state: ConnectionState) {
    let mut rx = manager.watch_state();
    tokio::time::timeout(Duration::from_secs(120), rx.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("state never became {:?}", state))
        .unwrap();
}

/// Poll `condition` until it holds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..2000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never held");
}

/// Drain every transition received so far as `(from, to)` pairs.
pub fn drain_transitions(
    rx: &mut broadcast::Receiver<dspctl_client::StateTransition>,
) -> Vec<(ConnectionState, ConnectionState)> {
    let mut transitions = Vec::new();
    while let Ok(t) = rx.try_recv() {
        transitions.push((t.from, t.to));
    }
    transitions
}

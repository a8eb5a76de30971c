//! Integration tests for dspctl-client.
//!
//! These drive a [`ConnectionManager`] against a scripted engine on the
//! in-memory transport, with tokio's clock paused so backoff delays and
//! timeouts run instantly.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::*;
use dspctl_client::protocol::commands;
use dspctl_client::{ChannelId, ChannelState, ConnectionState, DspError, ErrorKind};
use serde_json::json;
use tokio::time::Instant;

use ConnectionState::{Connected, Connecting, Degraded, Disconnected, Error};

/// Both endpoints reachable: the state goes straight to Connected and
/// requests resolve well before their timeout.
#[tokio::test(start_paused = true)]
async fn test_connect_reaches_connected() {
    let engine = MockEngine::start();
    let manager = engine.manager().build();
    let mut transitions = manager.subscribe_state();
    assert_eq!(manager.state(), Disconnected);

    let state = manager
        .connect(ADDRESS, CONTROL_PORT, SPECTRUM_PORT)
        .await
        .unwrap();
    assert_eq!(state, Connected);

    let started = Instant::now();
    let version = manager
        .send(ChannelId::Control, commands::GET_VERSION)
        .await
        .unwrap();
    assert_eq!(version, json!(MOCK_VERSION));
    assert!(started.elapsed() < manager.config().control_timeout);

    assert_eq!(
        drain_transitions(&mut transitions),
        [(Disconnected, Connecting), (Connecting, Connected)]
    );
}

/// The startup sequence is queued ahead of anything the caller sends and
/// fills the engine snapshot.
#[tokio::test(start_paused = true)]
async fn test_startup_sequence_runs_first() {
    let engine = MockEngine::start();
    let manager = engine.manager().build();

    manager
        .connect(ADDRESS, CONTROL_PORT, SPECTRUM_PORT)
        .await
        .unwrap();
    manager
        .send(ChannelId::Control, commands::GET_STATE)
        .await
        .unwrap();

    assert_eq!(
        engine.received(ChannelId::Control),
        ["GetVersion", "GetConfigJson", "GetState"]
    );

    eventually(|| manager.engine_snapshot().last_startup.is_some()).await;
    let snapshot = manager.engine_snapshot();
    assert_eq!(snapshot.version.as_deref(), Some(MOCK_VERSION));
    assert_eq!(snapshot.config.unwrap()["devices"]["samplerate"], 48000);
    assert_eq!(snapshot.last_startup.unwrap().failures(), 0);
}

/// A failing startup query is recorded but does not hold back Connected.
#[tokio::test(start_paused = true)]
async fn test_startup_failure_does_not_block_connect() {
    let engine = MockEngine::start();
    engine.silence(commands::GET_CONFIG_JSON);
    let manager = engine
        .manager()
        .control_timeout(Duration::from_secs(1))
        .build();

    let state = manager
        .connect(ADDRESS, CONTROL_PORT, SPECTRUM_PORT)
        .await
        .unwrap();
    assert_eq!(state, Connected);

    eventually(|| manager.engine_snapshot().last_startup.is_some()).await;
    let report = manager.engine_snapshot().last_startup.unwrap();
    assert_eq!(report.failures(), 1);
    assert_eq!(report.steps[1].command, "GetConfigJson");
    assert_eq!(manager.export_diagnostics().counters.timeouts, 1);
}

/// Spectrum unreachable at connect: Degraded, spectrum requests fail, control
/// keeps working, and no reconnection is attempted.
#[tokio::test(start_paused = true)]
async fn test_spectrum_unreachable_is_degraded() {
    let engine = MockEngine::start_control_only();
    let manager = engine.manager().build();
    let mut transitions = manager.subscribe_state();

    let state = manager
        .connect(ADDRESS, CONTROL_PORT, SPECTRUM_PORT)
        .await
        .unwrap();
    assert_eq!(state, Degraded);
    assert_eq!(
        drain_transitions(&mut transitions),
        [(Disconnected, Connecting), (Connecting, Degraded)]
    );

    let err = manager
        .send(ChannelId::Spectrum, commands::GET_PLAYBACK_SIGNAL_PEAK)
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Transport | ErrorKind::Abort));

    let volume = manager
        .send(ChannelId::Control, commands::GET_VOLUME)
        .await
        .unwrap();
    assert_eq!(volume, json!(-20.0));

    engine.listen(ChannelId::Spectrum);
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(engine.connections(ChannelId::Spectrum), 0);
    assert_eq!(manager.state(), Degraded);
}

/// Control drops mid-session: Error, then one reconnect cycle after the
/// first backoff delay brings it back.
#[tokio::test(start_paused = true)]
async fn test_control_drop_reconnects_once() {
    let engine = MockEngine::start();
    let manager = engine.manager().build();
    manager
        .connect(ADDRESS, CONTROL_PORT, SPECTRUM_PORT)
        .await
        .unwrap();
    eventually(|| manager.engine_snapshot().last_startup.is_some()).await;
    let mut transitions = manager.subscribe_state();

    engine.drop_connections(ChannelId::Control);
    wait_for_state(&manager, Error).await;

    // First delay is at least 800ms with the default jitter
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(manager.state(), Error);
    assert_eq!(engine.connections(ChannelId::Control), 1);

    wait_for_state(&manager, Connected).await;
    assert_eq!(
        drain_transitions(&mut transitions),
        [(Connected, Error), (Error, Connecting), (Connecting, Connected)]
    );
    assert_eq!(engine.connections(ChannelId::Control), 2);

    let bundle = manager.export_diagnostics();
    assert_eq!(bundle.counters.reconnects, 1);
    let control = &bundle.channels[0];
    assert_eq!(control.id, ChannelId::Control);
    assert_eq!(control.reconnect.attempt, 0);

    // Startup runs again on the new connection
    eventually(|| engine.received(ChannelId::Control).len() == 4).await;
    assert_eq!(
        engine.received(ChannelId::Control)[2..],
        ["GetVersion", "GetConfigJson"]
    );
}

/// Requests in flight or queued when the control channel drops are aborted,
/// not resubmitted after the reconnect.
#[tokio::test(start_paused = true)]
async fn test_control_drop_aborts_pending_requests() {
    let engine = MockEngine::start();
    engine.silence(commands::GET_STATE);
    let manager = engine.manager().build();
    manager
        .connect(ADDRESS, CONTROL_PORT, SPECTRUM_PORT)
        .await
        .unwrap();
    eventually(|| manager.engine_snapshot().last_startup.is_some()).await;

    let stuck = manager.send(ChannelId::Control, commands::GET_STATE);
    let queued = manager.send(ChannelId::Control, commands::GET_VOLUME);
    eventually(|| engine.received(ChannelId::Control).contains(&"GetState".to_string())).await;

    engine.drop_connections(ChannelId::Control);

    assert_eq!(stuck.await.unwrap_err().kind(), ErrorKind::Abort);
    assert_eq!(queued.await.unwrap_err().kind(), ErrorKind::Abort);

    wait_for_state(&manager, Connected).await;
    eventually(|| engine.received(ChannelId::Control).len() == 5).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!engine.received(ChannelId::Control)[3..].contains(&"GetVolume".to_string()));
}

/// Losing the spectrum channel degrades, then recovers on its own while
/// control requests keep flowing.
#[tokio::test(start_paused = true)]
async fn test_spectrum_drop_degrades_and_recovers() {
    let engine = MockEngine::start();
    let manager = engine.manager().build();
    manager
        .connect(ADDRESS, CONTROL_PORT, SPECTRUM_PORT)
        .await
        .unwrap();
    let mut transitions = manager.subscribe_state();

    engine.drop_connections(ChannelId::Spectrum);
    wait_for_state(&manager, Degraded).await;

    let version = manager
        .send(ChannelId::Control, commands::GET_VERSION)
        .await
        .unwrap();
    assert_eq!(version, json!(MOCK_VERSION));

    wait_for_state(&manager, Connected).await;
    assert_eq!(
        drain_transitions(&mut transitions),
        [(Connected, Degraded), (Degraded, Connected)]
    );

    let peaks = manager
        .send(ChannelId::Spectrum, commands::GET_PLAYBACK_SIGNAL_PEAK)
        .await
        .unwrap();
    assert_eq!(peaks, json!([-12.5, -13.0]));
}

/// Two back-to-back config fetches resolve with their own answers.
#[tokio::test(start_paused = true)]
async fn test_back_to_back_requests_not_swapped() {
    let engine = MockEngine::start();
    let manager = engine
        .manager()
        .startup_sequence(dspctl_client::control::StartupSequence::empty())
        .build();
    manager
        .connect(ADDRESS, CONTROL_PORT, SPECTRUM_PORT)
        .await
        .unwrap();

    let first = manager.send(ChannelId::Control, commands::GET_CONFIG_JSON);
    let second = manager.send(ChannelId::Control, commands::GET_CONFIG_JSON);
    let (first, second) = tokio::join!(first, second);

    assert_eq!(first.unwrap()["revision"], 1);
    assert_eq!(second.unwrap()["revision"], 2);
}

/// Concurrent callers on one channel settle in send order.
#[tokio::test(start_paused = true)]
async fn test_concurrent_callers_fifo() {
    let engine = MockEngine::start();
    let manager = engine
        .manager()
        .startup_sequence(dspctl_client::control::StartupSequence::empty())
        .build();
    manager
        .connect(ADDRESS, CONTROL_PORT, SPECTRUM_PORT)
        .await
        .unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut tasks = Vec::new();
    for i in 0..10 {
        let fut = manager.send(
            ChannelId::Control,
            dspctl_client::Command::with_arg(commands::SET_VOLUME, -(i as f64)),
        );
        let order = order.clone();
        tasks.push(tokio::spawn(async move {
            fut.await.unwrap();
            order.lock().unwrap().push(i);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
    let volume = manager
        .send(ChannelId::Control, commands::GET_VOLUME)
        .await
        .unwrap();
    assert_eq!(volume, json!(-9.0));
}

/// A silent engine times the request out; the channel stays usable.
#[tokio::test(start_paused = true)]
async fn test_request_timeout() {
    let engine = MockEngine::start();
    engine.silence(commands::GET_STATE);
    let manager = engine.manager().build();
    manager
        .connect(ADDRESS, CONTROL_PORT, SPECTRUM_PORT)
        .await
        .unwrap();

    let err = manager
        .send_with_timeout(
            ChannelId::Control,
            commands::GET_STATE,
            Duration::from_millis(300),
        )
        .await
        .unwrap_err();
    match err {
        DspError::Timeout { command, timeout } => {
            assert_eq!(command, "GetState");
            assert_eq!(timeout, Duration::from_millis(300));
        }
        other => panic!("expected timeout, got {:?}", other),
    }

    assert!(manager
        .send(ChannelId::Control, commands::GET_VERSION)
        .await
        .is_ok());
    assert_eq!(manager.state(), Connected);
}

/// Spectrum requests use the shorter spectrum default timeout.
#[tokio::test(start_paused = true)]
async fn test_spectrum_default_timeout() {
    let engine = MockEngine::start();
    engine.silence(commands::GET_PLAYBACK_SIGNAL_RMS);
    let manager = engine.manager().build();
    manager
        .connect(ADDRESS, CONTROL_PORT, SPECTRUM_PORT)
        .await
        .unwrap();

    let started = Instant::now();
    let err = manager
        .send(ChannelId::Spectrum, commands::GET_PLAYBACK_SIGNAL_RMS)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    let elapsed = started.elapsed();
    assert!(elapsed >= dspctl_client::DEFAULT_SPECTRUM_TIMEOUT);
    assert!(elapsed < dspctl_client::DEFAULT_SPECTRUM_TIMEOUT + Duration::from_millis(100));
}

/// Disconnect aborts everything pending and never triggers a reconnect.
#[tokio::test(start_paused = true)]
async fn test_disconnect_aborts_and_stays_down() {
    let engine = MockEngine::start();
    engine.silence(commands::GET_STATE);
    let manager = engine.manager().build();
    manager
        .connect(ADDRESS, CONTROL_PORT, SPECTRUM_PORT)
        .await
        .unwrap();

    let pending = manager.send(ChannelId::Control, commands::GET_STATE);
    let queued = manager.send(ChannelId::Control, commands::GET_VERSION);

    manager.disconnect();
    assert_eq!(manager.state(), Disconnected);
    assert_eq!(manager.channel_state(ChannelId::Control), ChannelState::Closed);

    let bundle = manager.export_diagnostics();
    assert!(bundle.channels.is_empty());
    assert_eq!(bundle.endpoint(ChannelId::Control), Some("ws://mock:1234"));
    assert_eq!(
        bundle.endpoints.as_ref().map(|e| e.spectrum.as_str()),
        Some("ws://mock:1235")
    );

    assert_eq!(pending.await.unwrap_err().kind(), ErrorKind::Abort);
    assert_eq!(queued.await.unwrap_err().kind(), ErrorKind::Abort);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(engine.connections(ChannelId::Control), 1);
    assert_eq!(engine.connections(ChannelId::Spectrum), 1);
    assert_eq!(manager.state(), Disconnected);
}

/// Control reconnection gives up after the configured attempts and stays in
/// Error until an explicit connect.
#[tokio::test(start_paused = true)]
async fn test_control_reconnect_exhaustion() {
    let engine = MockEngine::start();
    let manager = engine.manager().max_reconnect_attempts(3).build();
    manager
        .connect(ADDRESS, CONTROL_PORT, SPECTRUM_PORT)
        .await
        .unwrap();

    engine.stop_listening(ChannelId::Control);
    engine.drop_connections(ChannelId::Control);
    wait_for_state(&manager, Error).await;

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(manager.state(), Error);

    let bundle = manager.export_diagnostics();
    assert!(bundle.channels[0].reconnect.exhausted);
    assert_eq!(bundle.channels[0].reconnect.attempt, 3);

    engine.listen(ChannelId::Control);
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(manager.state(), Error);
    assert_eq!(engine.connections(ChannelId::Control), 1);

    let state = manager
        .connect(ADDRESS, CONTROL_PORT, SPECTRUM_PORT)
        .await
        .unwrap();
    assert_eq!(state, Connected);
}

/// A second connect replaces the first without orphaning channels.
#[tokio::test(start_paused = true)]
async fn test_reconnect_replaces_channels() {
    let engine = MockEngine::start();
    let manager = engine.manager().build();
    manager
        .connect(ADDRESS, CONTROL_PORT, SPECTRUM_PORT)
        .await
        .unwrap();
    let mut transitions = manager.subscribe_state();

    let state = manager
        .connect_endpoints(MockEngine::endpoints())
        .await
        .unwrap();
    assert_eq!(state, Connected);
    assert_eq!(
        drain_transitions(&mut transitions),
        [(Connected, Connecting), (Connecting, Connected)]
    );
    assert_eq!(engine.connections(ChannelId::Control), 2);

    // Old connections were closed by the client, so nothing reconnects
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(engine.connections(ChannelId::Control), 2);
    assert_eq!(manager.state(), Connected);
}

/// Apply is confirmed by a read-back queued strictly after it.
#[tokio::test(start_paused = true)]
async fn test_apply_config_then_confirm() {
    let engine = MockEngine::start();
    let manager = engine.manager().build();
    manager
        .connect(ADDRESS, CONTROL_PORT, SPECTRUM_PORT)
        .await
        .unwrap();
    eventually(|| manager.engine_snapshot().last_startup.is_some()).await;

    let config = json!({
        "devices": {"samplerate": 96000, "chunksize": 2048},
        "filters": {"lowpass": {"type": "Biquad", "freq": 80}}
    });
    let confirmed = manager.apply_config(&config).await.unwrap();
    assert_eq!(confirmed["devices"], config["devices"]);
    assert_eq!(confirmed["filters"], config["filters"]);

    let received = engine.received(ChannelId::Control);
    let set = received.iter().position(|c| c == "SetConfigJson").unwrap();
    assert_eq!(received[set + 1], "GetConfigJson");

    assert_eq!(manager.engine_snapshot().config, Some(confirmed));
    assert_eq!(engine.config()["devices"]["samplerate"], 96000);
}

/// A rejected apply carries the engine's reason and skips the read-back.
#[tokio::test(start_paused = true)]
async fn test_apply_rejected() {
    let engine = MockEngine::start();
    let manager = engine.manager().build();
    manager
        .connect(ADDRESS, CONTROL_PORT, SPECTRUM_PORT)
        .await
        .unwrap();
    eventually(|| manager.engine_snapshot().last_startup.is_some()).await;
    let before = engine.received(ChannelId::Control).len();

    let err = manager
        .apply_config(&json!({"filters": {}}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Application);
    assert_eq!(
        err.application_value(),
        Some(&json!("missing devices section"))
    );
    assert_eq!(engine.received(ChannelId::Control).len(), before + 1);

    let verdict = manager
        .validate_config(&json!({"devices": {}}))
        .await
        .unwrap();
    assert_eq!(verdict, json!("OK"));
}

/// Typed queries deserialize the response value.
#[tokio::test(start_paused = true)]
async fn test_typed_query() {
    let engine = MockEngine::start();
    let manager = engine.manager().build();
    manager
        .connect(ADDRESS, CONTROL_PORT, SPECTRUM_PORT)
        .await
        .unwrap();

    let version: String = manager.query(commands::GET_VERSION).await.unwrap();
    assert_eq!(version, MOCK_VERSION);

    let volume: f64 = manager.query(commands::GET_VOLUME).await.unwrap();
    assert_eq!(volume, -20.0);

    let err = manager.query::<u32>(commands::GET_STATE).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
}

/// Every outcome reaches the failure log and outcome handlers; the log
/// stays bounded.
#[tokio::test(start_paused = true)]
async fn test_diagnostics_export() {
    let engine = MockEngine::start();
    let manager = engine
        .manager()
        .failure_log_capacity(5)
        .startup_sequence(dspctl_client::control::StartupSequence::empty())
        .build();

    let seen = Arc::new(Mutex::new(Vec::new()));
    manager.on_request_outcome({
        let seen = seen.clone();
        move |entry| seen.lock().unwrap().push(entry.command)
    });

    manager
        .connect(ADDRESS, CONTROL_PORT, SPECTRUM_PORT)
        .await
        .unwrap();
    for _ in 0..7 {
        manager
            .send(ChannelId::Control, commands::GET_VERSION)
            .await
            .unwrap();
    }
    let _ = manager.send(ChannelId::Control, "Frobnicate").await;

    let bundle = manager.export_diagnostics();
    assert_eq!(bundle.state, Connected);
    assert_eq!(bundle.recent.len(), 5);
    assert_eq!(bundle.counters.recorded, 8);
    assert_eq!(bundle.counters.evicted, 3);
    assert_eq!(bundle.counters.application_errors, 1);
    assert_eq!(bundle.failures().count(), 1);
    assert_eq!(
        bundle.endpoint(ChannelId::Spectrum),
        Some("ws://mock:1235")
    );
    assert_eq!(bundle.channels[1].state, ChannelState::Open);

    let json = bundle.to_json().unwrap();
    assert!(json.contains("\"control\""));
    assert!(json.contains("Frobnicate"));

    eventually(|| seen.lock().unwrap().len() == 8).await;
}

/// State handlers see every transition in order.
#[tokio::test(start_paused = true)]
async fn test_state_handler() {
    let engine = MockEngine::start();
    let manager = engine.manager().build();

    let seen = Arc::new(Mutex::new(Vec::new()));
    manager.on_state_change({
        let seen = seen.clone();
        move |t| seen.lock().unwrap().push(t.to)
    });

    manager
        .connect(ADDRESS, CONTROL_PORT, SPECTRUM_PORT)
        .await
        .unwrap();
    manager.disconnect();

    eventually(|| seen.lock().unwrap().len() == 3).await;
    assert_eq!(*seen.lock().unwrap(), [Connecting, Connected, Disconnected]);
}

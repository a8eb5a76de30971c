//! Level monitor - connect to a running engine and print playback peaks.
//!
//! This example demonstrates:
//! - Building a manager with the builder pattern
//! - Watching connection state transitions
//! - Polling the spectrum channel while the control channel stays free
//! - Exporting diagnostics on exit
//!
//! # Running
//!
//! ```text
//! RUST_LOG=dspctl_client=debug cargo run --example monitor -- 127.0.0.1 1234 1235
//! ```
//!
//! Stop with Ctrl-C.

use std::time::Duration;

use dspctl_client::protocol::commands;
use dspctl_client::{ChannelId, ConnectionManager, ConnectionState};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let address = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
    let control_port: u16 = args.next().map(|p| p.parse()).transpose()?.unwrap_or(1234);
    let spectrum_port: u16 = args.next().map(|p| p.parse()).transpose()?.unwrap_or(1235);

    let manager = ConnectionManager::builder()
        .spectrum_timeout(Duration::from_millis(500))
        .build();

    manager.on_state_change(|t| println!("state: {:?} -> {:?}", t.from, t.to));

    manager.connect(&address, control_port, spectrum_port).await?;

    let version: String = manager.query(commands::GET_VERSION).await?;
    println!("engine version {}", version);

    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if manager.state() == ConnectionState::Error {
                    continue;
                }
                match manager
                    .send(ChannelId::Spectrum, commands::GET_PLAYBACK_SIGNAL_PEAK)
                    .await
                {
                    Ok(peaks) => println!("peaks: {}", peaks),
                    Err(err) => println!("peaks unavailable: {}", err),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    manager.disconnect();
    println!("{}", manager.export_diagnostics().to_json()?);
    Ok(())
}

//! # dspctl-client
//!
//! Control-plane client for a real-time audio DSP engine.
//!
//! The engine is driven over two independent persistent connections:
//!
//! - **Control channel**: commands, configuration, status queries
//! - **Spectrum channel**: level meter polling
//!
//! Each channel serializes its requests (one on the wire at a time, the rest
//! in FIFO order), enforces per-request timeouts, aborts everything pending
//! when it closes, and reconnects with exponential backoff after an
//! unexpected loss. The [`ConnectionManager`] folds both channel states into
//! one [`ConnectionState`] and records every request outcome for
//! diagnostics.
//!
//! ## Example
//!
//! ```no_run
//! use dspctl_client::{ChannelId, ConnectionManager};
//! use dspctl_client::protocol::commands;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), dspctl_client::DspError> {
//!     let manager = ConnectionManager::new();
//!     manager.on_state_change(|t| println!("{:?} -> {:?}", t.from, t.to));
//!
//!     manager.connect("127.0.0.1", 1234, 1235).await?;
//!
//!     let peaks = manager
//!         .send(ChannelId::Spectrum, commands::GET_PLAYBACK_SIGNAL_PEAK)
//!         .await?;
//!     println!("peaks: {}", peaks);
//!
//!     let config = manager.fetch_config().await?;
//!     let confirmed = manager.apply_config(&config).await?;
//!     assert_eq!(confirmed, config);
//!
//!     println!("{}", manager.export_diagnostics().to_json().unwrap_or_default());
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod control;
pub mod diagnostics;
pub mod error;
pub mod protocol;
pub mod reconnect;
pub mod transport;

mod channel;
mod events;
mod manager;
mod queue;
mod state;
mod writer;

pub use channel::{Channel, ChannelObserver, CloseReason};
pub use diagnostics::{DiagnosticBundle, FailureEntry, Outcome};
pub use error::{DspError, ErrorKind, Result};
pub use manager::{
    ConnectionManager, Endpoints, ManagerBuilder, ManagerConfig, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_CONTROL_TIMEOUT, DEFAULT_SPECTRUM_TIMEOUT,
};
pub use protocol::Command;
pub use queue::RequestQueue;
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use state::{ChannelId, ChannelState, ConnectionState, Lifecycle, StateTransition};
pub use writer::WriterHandle;

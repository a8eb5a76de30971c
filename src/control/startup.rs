//! Post-connect startup sequence.
//!
//! Every time the control channel opens, the manager queues a fixed list of
//! queries (by default the engine version and the active configuration).
//! Their answers populate the [`EngineSnapshot`]; failures are logged and
//! reported, but never hold back the connection state.
//!
//! # Example
//!
//! ```
//! use dspctl_client::control::StartupSequence;
//! use dspctl_client::protocol::commands;
//!
//! let sequence = StartupSequence::default().then(commands::GET_STATE);
//! let names: Vec<_> = sequence.commands().iter().map(|c| c.name()).collect();
//! assert_eq!(names, ["GetVersion", "GetConfigJson", "GetState"]);
//! ```

use std::future::Future;
use std::time::SystemTime;

use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::protocol::{commands, Command};
use crate::queue::RequestQueue;
use crate::state::unix_millis;

/// Ordered queries issued after the control channel opens.
#[derive(Debug, Clone, PartialEq)]
pub struct StartupSequence {
    commands: Vec<Command>,
}

impl StartupSequence {
    /// Create a sequence from commands, in order.
    pub fn new<I, C>(commands: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Command>,
    {
        Self {
            commands: commands.into_iter().map(Into::into).collect(),
        }
    }

    /// A sequence that issues nothing.
    pub fn empty() -> Self {
        Self {
            commands: Vec::new(),
        }
    }

    /// Append a command.
    pub fn then(mut self, command: impl Into<Command>) -> Self {
        self.commands.push(command.into());
        self
    }

    #[inline]
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl Default for StartupSequence {
    fn default() -> Self {
        Self::new([commands::GET_VERSION, commands::GET_CONFIG_JSON])
    }
}

/// Result of one startup query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartupStep {
    pub command: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Results of the most recent startup sequence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartupReport {
    pub completed_at_ms: u64,
    pub steps: Vec<StartupStep>,
}

impl StartupReport {
    /// Number of queries that failed.
    pub fn failures(&self) -> usize {
        self.steps.iter().filter(|s| !s.ok).count()
    }
}

/// What the client last learned about the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineSnapshot {
    /// Engine version string.
    pub version: Option<String>,
    /// Last configuration fetched or confirmed.
    pub config: Option<Value>,
    pub last_startup: Option<StartupReport>,
}

impl EngineSnapshot {
    /// Fold one successful answer into the snapshot.
    pub(crate) fn absorb(&mut self, command: &str, value: &Value) {
        match command {
            commands::GET_VERSION => {
                self.version = Some(match value {
                    Value::String(version) => version.clone(),
                    other => other.to_string(),
                });
            }
            commands::GET_CONFIG_JSON => self.config = Some(value.clone()),
            _ => {}
        }
    }

    /// Fold a finished startup sequence into the snapshot.
    pub(crate) fn record_startup(&mut self, results: Vec<(String, Result<Value>)>) {
        let mut steps = Vec::with_capacity(results.len());
        for (command, result) in results {
            match result {
                Ok(value) => {
                    self.absorb(&command, &value);
                    steps.push(StartupStep {
                        command,
                        ok: true,
                        error: None,
                    });
                }
                Err(err) => steps.push(StartupStep {
                    command,
                    ok: false,
                    error: Some(err.to_string()),
                }),
            }
        }

        self.last_startup = Some(StartupReport {
            completed_at_ms: unix_millis(SystemTime::now()),
            steps,
        });
    }
}

/// Queue the whole sequence on `queue` now and wait for every answer.
pub(crate) fn run_startup(
    queue: &RequestQueue,
    sequence: &StartupSequence,
) -> impl Future<Output = Vec<(String, Result<Value>)>> + Send + 'static {
    let pending: Vec<_> = sequence
        .commands()
        .iter()
        .map(|command| {
            (
                command.name().to_string(),
                queue.enqueue(command.clone(), None),
            )
        })
        .collect();

    async move {
        let mut results = Vec::with_capacity(pending.len());
        for (command, response) in pending {
            let result = response.await;
            if let Err(err) = &result {
                tracing::warn!("Startup query {} failed: {}", command, err);
            }
            results.push((command, result));
        }
        results
    }
}

//! Configuration apply and validation.
//!
//! Applying a configuration is two ordered steps on the control queue:
//! `SetConfigJson`, then a `GetConfigJson` that is queued only after the set
//! has settled. Issuing the read-back concurrently can return the previous
//! configuration on some engine versions and silently revert the apply.

use std::future::Future;

use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::protocol::{commands, Command};
use crate::queue::RequestQueue;

/// Serialize a configuration into the JSON string the engine expects.
pub(crate) fn encode_config<T: Serialize + ?Sized>(config: &T) -> Result<String> {
    Ok(serde_json::to_string(config)?)
}

/// Queue `SetConfigJson` now; once it succeeds, queue `GetConfigJson` and
/// resolve with the confirmed configuration.
pub(crate) fn apply_then_confirm(
    queue: &RequestQueue,
    payload: String,
) -> impl Future<Output = Result<Value>> + Send + 'static {
    let set = queue.enqueue(Command::with_arg(commands::SET_CONFIG_JSON, payload), None);
    let queue = queue.clone();

    async move {
        set.await?;
        queue
            .enqueue(Command::new(commands::GET_CONFIG_JSON), None)
            .await
    }
}

/// Ask the engine to validate a configuration without applying it.
pub(crate) fn validate(
    queue: &RequestQueue,
    payload: String,
) -> impl Future<Output = Result<Value>> + Send + 'static {
    queue.enqueue(
        Command::with_arg(commands::VALIDATE_CONFIG_JSON, payload),
        None,
    )
}

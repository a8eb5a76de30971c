//! JSON text codec for the engine protocol.
//!
//! **Special case**: `GetConfigJson` answers with the configuration as a
//! JSON-encoded *string*. The codec parses that string so callers always get a
//! structured value back.

use serde_json::Value;

use crate::error::{DspError, Result};
use crate::protocol::{commands, is_known_command, Command, Response, RESULT_OK};

/// JSON codec for request and response frames.
pub struct WireCodec;

impl WireCodec {
    /// Encode a command to a text frame.
    ///
    /// Bare commands become a JSON string (`"GetVersion"`), commands with an
    /// argument a single-key object (`{"SetVolume":-6.0}`).
    ///
    /// # Errors
    ///
    /// Returns a protocol error for an empty command name.
    pub fn encode(command: &Command) -> Result<String> {
        if command.name().is_empty() {
            return Err(DspError::Protocol("empty command name".to_string()));
        }
        Ok(serde_json::to_string(&command.to_value())?)
    }

    /// Decode a response frame.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the frame is not JSON, is not an object with
    /// exactly one key, if the envelope lacks a string `result`, or if a
    /// successful `GetConfigJson` value is not a parseable JSON string.
    pub fn decode(frame: &str) -> Result<Response> {
        let parsed: Value = serde_json::from_str(frame)?;

        let mut map = match parsed {
            Value::Object(map) => map,
            other => {
                return Err(DspError::Protocol(format!(
                    "expected response object, got {}",
                    type_name(&other)
                )))
            }
        };

        if map.len() != 1 {
            return Err(DspError::Protocol(format!(
                "expected exactly one command key, got {}",
                map.len()
            )));
        }

        // Length checked above
        let command = match map.keys().next() {
            Some(key) => key.clone(),
            None => return Err(DspError::Protocol("empty response object".to_string())),
        };
        let envelope = map.remove(&command).unwrap_or(Value::Null);

        let mut envelope = match envelope {
            Value::Object(envelope) => envelope,
            other => {
                return Err(DspError::Protocol(format!(
                    "{}: expected envelope object, got {}",
                    command,
                    type_name(&other)
                )))
            }
        };

        let result = match envelope.remove("result") {
            Some(Value::String(result)) => result,
            Some(other) => {
                return Err(DspError::Protocol(format!(
                    "{}: result must be a string, got {}",
                    command,
                    type_name(&other)
                )))
            }
            None => return Err(DspError::Protocol(format!("{}: missing result", command))),
        };
        let mut value = envelope.remove("value").unwrap_or(Value::Null);

        if !is_known_command(&command) {
            tracing::debug!("Unhandled command in response: {}", command);
        }

        if command == commands::GET_CONFIG_JSON && result == RESULT_OK {
            value = parse_embedded_json(&command, value)?;
        }

        Ok(Response {
            command,
            result,
            value,
        })
    }

    /// Command name of a frame shaped like a response, without validating
    /// the envelope.
    ///
    /// Lets a caller route a frame that [`decode`](Self::decode) rejects.
    pub fn peek_command(frame: &str) -> Option<String> {
        match serde_json::from_str::<Value>(frame).ok()? {
            Value::Object(map) if map.len() == 1 => map.keys().next().cloned(),
            _ => None,
        }
    }
}

/// Parse a value that the engine sends as a JSON-encoded string.
fn parse_embedded_json(command: &str, value: Value) -> Result<Value> {
    match value {
        Value::String(text) => serde_json::from_str(&text).map_err(|e| {
            DspError::Protocol(format!("{}: embedded JSON is invalid: {}", command, e))
        }),
        other => Err(DspError::Protocol(format!(
            "{}: expected JSON-encoded string, got {}",
            command,
            type_name(&other)
        ))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

//! Responses received from the engine.

use serde_json::Value;

use crate::error::{DspError, Result};

/// The `result` string that marks a successful response.
pub const RESULT_OK: &str = "Ok";

/// A decoded response envelope: `{command: {result, value}}`.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Command name the engine is answering.
    pub command: String,
    /// Raw `result` string (`"Ok"`, `"Error"`, or anything else).
    pub result: String,
    /// Response value (`null` when the engine sent none).
    pub value: Value,
}

impl Response {
    /// True when `result == "Ok"`.
    #[inline]
    pub fn is_success(&self) -> bool {
        self.result == RESULT_OK
    }

    /// Convert into the value on success, or an application error.
    pub fn into_result(self) -> Result<Value> {
        if self.is_success() {
            Ok(self.value)
        } else {
            Err(DspError::Application {
                command: self.command,
                result: self.result,
                value: self.value,
            })
        }
    }
}

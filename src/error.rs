//! Error types for dspctl-client.
//!
//! Every request settles with either a value or one [`DspError`]. Errors are
//! local to the request that produced them: none of them corrupts queue state
//! or tears down the [`ConnectionManager`](crate::ConnectionManager).

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Main error type for all control-plane operations.
#[derive(Debug, Error)]
pub enum DspError {
    /// Channel never opened, dropped mid-flight, or the write side failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// No matching response arrived within the request deadline.
    #[error("Timeout: no response to {command} within {timeout:?}")]
    Timeout {
        /// Command that timed out.
        command: String,
        /// Deadline that was applied.
        timeout: Duration,
    },

    /// Malformed frame, decode failure, or a command that cannot be encoded.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Channel closed while the request was in flight or queued.
    #[error("Aborted {command}: {reason}")]
    Abort {
        /// Command that was aborted.
        command: String,
        /// Why the channel closed.
        reason: String,
    },

    /// The engine answered with a result other than `"Ok"`.
    #[error("Engine rejected {command}: {result}")]
    Application {
        /// Command the engine rejected.
        command: String,
        /// Raw `result` string from the response envelope.
        result: String,
        /// Response `value`, kept for caller inspection.
        value: Value,
    },
}

/// Coarse classification of a [`DspError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Transport,
    Timeout,
    Protocol,
    Abort,
    Application,
}

impl DspError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DspError::Transport(_) => ErrorKind::Transport,
            DspError::Timeout { .. } => ErrorKind::Timeout,
            DspError::Protocol(_) => ErrorKind::Protocol,
            DspError::Abort { .. } => ErrorKind::Abort,
            DspError::Application { .. } => ErrorKind::Application,
        }
    }

    /// Returns true if re-issuing the same request later may succeed.
    ///
    /// Protocol and application errors are answers about the request itself
    /// and will not change on retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DspError::Transport(_) | DspError::Timeout { .. } | DspError::Abort { .. }
        )
    }

    /// The response value carried by an [`DspError::Application`] error.
    pub fn application_value(&self) -> Option<&Value> {
        match self {
            DspError::Application { value, .. } => Some(value),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for DspError {
    fn from(err: serde_json::Error) -> Self {
        DspError::Protocol(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for DspError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        DspError::Transport(err.to_string())
    }
}

/// Result type alias using DspError.
pub type Result<T> = std::result::Result<T, DspError>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_kinds() {
        assert_eq!(DspError::Transport("x".into()).kind(), ErrorKind::Transport);
        assert_eq!(
            DspError::Timeout {
                command: "GetVersion".into(),
                timeout: Duration::from_secs(1)
            }
            .kind(),
            ErrorKind::Timeout
        );
        assert_eq!(DspError::Protocol("x".into()).kind(), ErrorKind::Protocol);
        assert_eq!(
            DspError::Abort {
                command: "GetVersion".into(),
                reason: "closed".into()
            }
            .kind(),
            ErrorKind::Abort
        );
    }

    #[test]
    fn test_transient_errors() {
        assert!(DspError::Transport("down".into()).is_transient());
        assert!(DspError::Abort {
            command: "Reload".into(),
            reason: "closed".into()
        }
        .is_transient());
        assert!(!DspError::Protocol("bad frame".into()).is_transient());
        assert!(!DspError::Application {
            command: "SetConfigJson".into(),
            result: "Error".into(),
            value: json!("invalid"),
        }
        .is_transient());
    }

    #[test]
    fn test_application_value() {
        let err = DspError::Application {
            command: "SetVolume".into(),
            result: "Error".into(),
            value: json!({"reason": "out of range"}),
        };
        assert_eq!(
            err.application_value(),
            Some(&json!({"reason": "out of range"}))
        );
        assert!(DspError::Protocol("x".into()).application_value().is_none());
    }

    #[test]
    fn test_json_error_maps_to_protocol() {
        let err: DspError = serde_json::from_str::<Value>("{nope").unwrap_err().into();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }
}

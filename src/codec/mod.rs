//! Codec module - text frame encoding/decoding.
//!
//! - [`WireCodec`] - commands to JSON text frames, response frames to [`Response`]
//!
//! # Design
//!
//! The codec is a marker struct with static methods. Both directions are
//! UTF-8 JSON text; binary framing is the transport's concern.
//!
//! # Example
//!
//! ```
//! use dspctl_client::codec::WireCodec;
//! use dspctl_client::protocol::Command;
//!
//! let frame = WireCodec::encode(&Command::with_arg("SetMute", true)).unwrap();
//! assert_eq!(frame, r#"{"SetMute":true}"#);
//!
//! let resp = WireCodec::decode(r#"{"GetMute":{"result":"Ok","value":false}}"#).unwrap();
//! assert_eq!(resp.command, "GetMute");
//! assert!(resp.is_success());
//! ```
//!
//! [`Response`]: crate::protocol::Response

mod json;

pub use json::WireCodec;

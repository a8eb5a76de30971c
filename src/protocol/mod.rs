//! Protocol module - wire-level command and response types.
//!
//! The engine speaks JSON text frames in both directions:
//!
//! ```text
//! request:   "GetVersion"                      bare command name
//!            {"SetVolume": -6.0}                single key: name -> argument
//! response:  {"GetVersion": {"result": "Ok", "value": "2.0.0"}}
//! ```
//!
//! Encoding and decoding live in [`crate::codec`]; this module only defines
//! the shapes and the table of command names the engine understands.

mod command;
mod response;

pub use command::{commands, is_known_command, Command, KNOWN_COMMANDS};
pub use response::{Response, RESULT_OK};

//! Commands sent to the engine.

use serde_json::Value;

/// Command name constants for the engine's control protocol.
pub mod commands {
    /// Engine version string.
    pub const GET_VERSION: &str = "GetVersion";
    /// Processing state (running, paused, inactive, ...).
    pub const GET_STATE: &str = "GetState";
    /// Reason the engine last stopped processing.
    pub const GET_STOP_REASON: &str = "GetStopReason";
    /// Active configuration as YAML text.
    pub const GET_CONFIG: &str = "GetConfig";
    /// Active configuration as a JSON-encoded string (parsed by the codec).
    pub const GET_CONFIG_JSON: &str = "GetConfigJson";
    /// Replace the active configuration with a JSON-encoded string.
    pub const SET_CONFIG_JSON: &str = "SetConfigJson";
    /// Validate a JSON-encoded configuration without applying it.
    pub const VALIDATE_CONFIG_JSON: &str = "ValidateConfigJson";
    /// Path of the configuration file the engine loaded.
    pub const GET_CONFIG_FILE_PATH: &str = "GetConfigFilePath";
    /// Reload the configuration file.
    pub const RELOAD: &str = "Reload";
    /// Stop processing.
    pub const STOP: &str = "Stop";
    /// Measured capture sample rate.
    pub const GET_CAPTURE_RATE: &str = "GetCaptureRate";
    /// Peak-to-peak range of the captured signal.
    pub const GET_SIGNAL_RANGE: &str = "GetSignalRange";
    /// Per-channel playback peak levels in dB.
    pub const GET_PLAYBACK_SIGNAL_PEAK: &str = "GetPlaybackSignalPeak";
    /// Per-channel playback RMS levels in dB.
    pub const GET_PLAYBACK_SIGNAL_RMS: &str = "GetPlaybackSignalRms";
    /// Per-channel capture peak levels in dB.
    pub const GET_CAPTURE_SIGNAL_PEAK: &str = "GetCaptureSignalPeak";
    /// Per-channel capture RMS levels in dB.
    pub const GET_CAPTURE_SIGNAL_RMS: &str = "GetCaptureSignalRms";
    /// Main volume in dB.
    pub const GET_VOLUME: &str = "GetVolume";
    /// Set main volume in dB.
    pub const SET_VOLUME: &str = "SetVolume";
    /// Main mute flag.
    pub const GET_MUTE: &str = "GetMute";
    /// Set main mute flag.
    pub const SET_MUTE: &str = "SetMute";
    /// Clipped sample counter.
    pub const GET_CLIPPED_SAMPLES: &str = "GetClippedSamples";
    /// Reset the clipped sample counter.
    pub const RESET_CLIPPED_SAMPLES: &str = "ResetClippedSamples";
    /// Processing load in percent.
    pub const GET_PROCESSING_LOAD: &str = "GetProcessingLoad";
    /// Playback buffer fill level.
    pub const GET_BUFFER_LEVEL: &str = "GetBufferLevel";
    /// Level meter update interval in ms.
    pub const GET_UPDATE_INTERVAL: &str = "GetUpdateInterval";
    /// Set level meter update interval in ms.
    pub const SET_UPDATE_INTERVAL: &str = "SetUpdateInterval";
}

/// Every command name this client knows the engine to support.
///
/// Responses naming anything else still decode; they are only logged as
/// unhandled.
pub const KNOWN_COMMANDS: &[&str] = &[
    commands::GET_VERSION,
    commands::GET_STATE,
    commands::GET_STOP_REASON,
    commands::GET_CONFIG,
    commands::GET_CONFIG_JSON,
    commands::SET_CONFIG_JSON,
    commands::VALIDATE_CONFIG_JSON,
    commands::GET_CONFIG_FILE_PATH,
    commands::RELOAD,
    commands::STOP,
    commands::GET_CAPTURE_RATE,
    commands::GET_SIGNAL_RANGE,
    commands::GET_PLAYBACK_SIGNAL_PEAK,
    commands::GET_PLAYBACK_SIGNAL_RMS,
    commands::GET_CAPTURE_SIGNAL_PEAK,
    commands::GET_CAPTURE_SIGNAL_RMS,
    commands::GET_VOLUME,
    commands::SET_VOLUME,
    commands::GET_MUTE,
    commands::SET_MUTE,
    commands::GET_CLIPPED_SAMPLES,
    commands::RESET_CLIPPED_SAMPLES,
    commands::GET_PROCESSING_LOAD,
    commands::GET_BUFFER_LEVEL,
    commands::GET_UPDATE_INTERVAL,
    commands::SET_UPDATE_INTERVAL,
];

/// Check whether `name` is in [`KNOWN_COMMANDS`].
#[inline]
pub fn is_known_command(name: &str) -> bool {
    KNOWN_COMMANDS.contains(&name)
}

/// A named request with an optional single argument.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    name: String,
    arg: Option<Value>,
}

impl Command {
    /// Create a command without an argument.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arg: None,
        }
    }

    /// Create a command carrying one argument value.
    pub fn with_arg(name: impl Into<String>, arg: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            arg: Some(arg.into()),
        }
    }

    /// Get the command name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the argument, if any.
    #[inline]
    pub fn arg(&self) -> Option<&Value> {
        self.arg.as_ref()
    }

    /// The wire value: a string for bare commands, `{name: arg}` otherwise.
    pub fn to_value(&self) -> Value {
        match &self.arg {
            None => Value::String(self.name.clone()),
            Some(arg) => {
                let mut map = serde_json::Map::with_capacity(1);
                map.insert(self.name.clone(), arg.clone());
                Value::Object(map)
            }
        }
    }
}

impl From<&str> for Command {
    fn from(name: &str) -> Self {
        Command::new(name)
    }
}

//! Status snapshots owned by the orchestrator and handed out by value.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::HubError;

/// Process-wide connection status. Replaced wholesale on every transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub is_connected: bool,
    pub last_update: DateTime<Utc>,
    /// Survives a `disconnected` transition so a UI can show why.
    pub error: Option<String>,
}

impl ConnectionState {
    pub fn idle() -> Self {
        Self {
            is_connected: false,
            last_update: Utc::now(),
            error: None,
        }
    }

    /// Successor state with `is_connected` set, error cleared.
    pub fn connected(&self) -> Self {
        Self {
            is_connected: true,
            last_update: Utc::now(),
            error: None,
        }
    }

    /// Successor state after a clean disconnect; keeps the previous error.
    pub fn disconnected(&self) -> Self {
        Self {
            is_connected: false,
            last_update: Utc::now(),
            error: self.error.clone(),
        }
    }

    pub fn failed(&self, error: impl Into<String>) -> Self {
        Self {
            is_connected: false,
            last_update: Utc::now(),
            error: Some(error.into()),
        }
    }

    /// Successor state with the error cleared (manual restart).
    pub fn cleared(&self) -> Self {
        Self {
            is_connected: self.is_connected,
            last_update: Utc::now(),
            error: None,
        }
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::idle()
    }
}

/// Lifecycle phase of the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkPhase {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
}

/// Authentication status reported by the SignalK adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthStatus {
    pub is_authenticated: bool,
    pub has_token: bool,
    /// Seconds until the token expires, when one is held.
    pub time_until_expiry: Option<i64>,
}

/// Supported on-disk recording formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordingFormat {
    /// Raw wire lines, untouched.
    Passthrough,
    /// One canboat JSON object per line.
    CanboatJson,
    /// A single JSON array of canboat objects.
    JsonArray,
    Actisense,
    #[serde(rename = "ydraw")]
    YdRaw,
    Pcdin,
    Mxpgn,
    Candump,
}

impl RecordingFormat {
    pub const ALL: [RecordingFormat; 8] = [
        RecordingFormat::Passthrough,
        RecordingFormat::CanboatJson,
        RecordingFormat::JsonArray,
        RecordingFormat::Actisense,
        RecordingFormat::YdRaw,
        RecordingFormat::Pcdin,
        RecordingFormat::Mxpgn,
        RecordingFormat::Candump,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordingFormat::Passthrough => "passthrough",
            RecordingFormat::CanboatJson => "canboat-json",
            RecordingFormat::JsonArray => "json-array",
            RecordingFormat::Actisense => "actisense",
            RecordingFormat::YdRaw => "ydraw",
            RecordingFormat::Pcdin => "pcdin",
            RecordingFormat::Mxpgn => "mxpgn",
            RecordingFormat::Candump => "candump",
        }
    }

    /// File extension (without the dot).
    pub fn extension(&self) -> &'static str {
        match self {
            RecordingFormat::Passthrough => "raw",
            RecordingFormat::CanboatJson => "jsonl",
            RecordingFormat::JsonArray => "json",
            RecordingFormat::Actisense => "n2k",
            RecordingFormat::YdRaw => "ydraw",
            RecordingFormat::Pcdin => "pcdin",
            RecordingFormat::Mxpgn => "mxpgn",
            RecordingFormat::Candump => "log",
        }
    }

    /// Infer the format from a file extension.
    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.to_ascii_lowercase();
        Self::ALL.into_iter().find(|f| f.extension() == ext)
    }
}

impl fmt::Display for RecordingFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordingFormat {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| HubError::invalid("format", format!("unknown recording format '{s}'")))
    }
}

/// Live recording status. `is_recording == false` means no file is open.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingStatus {
    pub is_recording: bool,
    pub file_name: Option<String>,
    pub file_path: Option<String>,
    pub format: Option<RecordingFormat>,
    pub start_time: Option<DateTime<Utc>>,
    pub message_count: u64,
    pub file_size: u64,
}

/// A finished recording found in the recordings directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingFile {
    pub name: String,
    pub size: u64,
    pub created: DateTime<Utc>,
    /// Estimated from the line count.
    pub message_count: u64,
    pub format: Option<RecordingFormat>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_survives_disconnect() {
        let state = ConnectionState::idle().failed("ECONNREFUSED: connection refused");
        let next = state.disconnected();
        assert!(!next.is_connected);
        assert_eq!(next.error.as_deref(), Some("ECONNREFUSED: connection refused"));
    }

    #[test]
    fn connect_clears_error() {
        let state = ConnectionState::idle().failed("boom").connected();
        assert!(state.is_connected);
        assert!(state.error.is_none());
    }

    #[test]
    fn connection_state_serializes_camel_case() {
        let json = serde_json::to_value(ConnectionState::idle()).unwrap();
        assert!(json.get("isConnected").is_some());
        assert!(json.get("lastUpdate").is_some());
    }

    #[test]
    fn format_names_and_extensions() {
        assert_eq!("canboat-json".parse::<RecordingFormat>(), Ok(RecordingFormat::CanboatJson));
        assert_eq!("ydraw".parse::<RecordingFormat>(), Ok(RecordingFormat::YdRaw));
        assert!("xml".parse::<RecordingFormat>().is_err());
        assert_eq!(RecordingFormat::from_extension("LOG"), Some(RecordingFormat::Candump));
        assert_eq!(
            serde_json::to_value(RecordingFormat::YdRaw).unwrap(),
            serde_json::json!("ydraw")
        );
    }

    #[test]
    fn every_format_has_a_unique_extension() {
        let mut seen = std::collections::HashSet::new();
        for f in RecordingFormat::ALL {
            assert!(seen.insert(f.extension()), "duplicate extension for {f}");
            assert_eq!(RecordingFormat::from_extension(f.extension()), Some(f));
        }
    }
}

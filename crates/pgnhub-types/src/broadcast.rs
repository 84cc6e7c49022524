//! The envelope pushed to real-time subscribers.
//!
//! A [`BroadcastMessage`] is built per emission and never stored. Event
//! names live in [`events`] so producers and the WebSocket layer agree on
//! spelling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::AuthStatus;

/// Event names on the real-time channel.
pub mod events {
    pub const CONNECTION: &str = "connection";
    pub const NMEA_CONNECTED: &str = "nmea:connected";
    pub const NMEA_DISCONNECTED: &str = "nmea:disconnected";
    pub const ERROR: &str = "error";
    pub const RAW_OUTPUT: &str = "canboatjs:rawoutput";
    pub const PARSED: &str = "canboatjs:parsed";
    pub const SIGNALK_DELTA: &str = "signalk:delta";
    pub const SIGNALK_AUTH: &str = "signalk:auth";
    pub const RECORDING_STARTED: &str = "recording:started";
    pub const RECORDING_STOPPED: &str = "recording:stopped";
    pub const RECORDING_PROGRESS: &str = "recording:progress";
    pub const RECORDING_ERROR: &str = "recording:error";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthStatus>,
}

impl BroadcastMessage {
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: None,
            timestamp: Utc::now(),
            error: None,
            auth: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_auth(mut self, auth: Option<AuthStatus>) -> Self {
        self.auth = auth;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_fields_are_omitted() {
        let json = serde_json::to_value(BroadcastMessage::new(events::NMEA_DISCONNECTED)).unwrap();
        assert_eq!(json["event"], "nmea:disconnected");
        assert!(json.get("data").is_none());
        assert!(json.get("error").is_none());
        assert!(json.get("auth").is_none());
    }

    #[test]
    fn error_envelope_carries_reason() {
        let msg = BroadcastMessage::new(events::ERROR).with_error("ECONNREFUSED: refused");
        let json = serde_json::to_value(msg).unwrap();
        assert_eq!(json["error"], "ECONNREFUSED: refused");
    }
}

//! Structured PGN message, the shape the codec hands back from `parse`.
//!
//! Field names follow the canboat JSON convention (`prio`, `pgn`, `src`,
//! `dst`, `fields`) so decoded messages serialise into something existing
//! marine tooling understands. `data` carries the packed payload bytes when
//! the message came from (or is headed to) a binary wire format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Destination address meaning "every device on the bus".
pub const BROADCAST_ADDRESS: u8 = 255;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PgnMessage {
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default = "default_prio")]
    pub prio: u8,
    pub pgn: u32,
    #[serde(default)]
    pub src: u8,
    #[serde(default = "default_dst")]
    pub dst: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", with = "hex_bytes")]
    pub data: Vec<u8>,
}

fn default_prio() -> u8 {
    3
}

fn default_dst() -> u8 {
    BROADCAST_ADDRESS
}

impl PgnMessage {
    /// A message with only the header and payload set.
    pub fn new(pgn: u32, src: u8, dst: u8, prio: u8, data: Vec<u8>) -> Self {
        Self {
            timestamp: None,
            prio,
            pgn,
            src,
            dst,
            description: None,
            fields: Map::new(),
            data,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Whether the payload does not fit a single CAN frame.
    pub fn is_fast_packet(&self) -> bool {
        self.data.len() > 8
    }
}

/// Lower-case hex string (`"01ff2a"`) <-> `Vec<u8>`.
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn encode(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    pub fn decode(text: &str) -> Option<Vec<u8>> {
        let text: String = text.chars().filter(|c| !c.is_whitespace()).collect();
        if text.len() % 2 != 0 || !text.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        (0..text.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&text[i..i + 2], 16).ok())
            .collect()
    }

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        decode(&text).ok_or_else(|| D::Error::custom(format!("invalid hex payload '{text}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canboat_json_deserializes_with_defaults() {
        let json = r#"{"pgn":127250,"src":1,"fields":{"Heading":1.23}}"#;
        let msg: PgnMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.pgn, 127_250);
        assert_eq!(msg.prio, 3);
        assert_eq!(msg.dst, BROADCAST_ADDRESS);
        assert!(msg.data.is_empty());
        assert_eq!(msg.fields["Heading"], 1.23);
    }

    #[test]
    fn data_serializes_as_hex() {
        let msg = PgnMessage::new(59904, 1, 255, 6, vec![0x00, 0xee, 0x00]);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["data"], "00ee00");
        let back: PgnMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back.data, vec![0x00, 0xee, 0x00]);
    }

    #[test]
    fn hex_decode_rejects_odd_length() {
        assert!(hex_bytes::decode("abc").is_none());
        assert_eq!(hex_bytes::decode("ab cd"), Some(vec![0xab, 0xcd]));
    }
}

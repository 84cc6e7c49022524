//! Connection profiles.
//!
//! A [`ConnectionProfile`] names one way of reaching the bus. The
//! transport-specific part is the closed sum type [`TransportConfig`]; each
//! variant carries only its own fields, so validation and adapter
//! construction match on the variant rather than on a `type` string.
//!
//! The serialised shape is flat, with a `type` discriminator:
//!
//! ```json
//! { "id": "boat", "name": "Boat", "type": "network",
//!   "networkHost": "192.168.1.10", "networkPort": 1457, "protocol": "tcp" }
//! ```
//!
//! Missing transport fields deserialize to empty values so that
//! [`ConnectionProfile::validate`] can report exactly which one is absent.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::HubError;

/// Upper bound for file playback speed (multiple of real time).
pub const MAX_PLAYBACK_SPEED: f64 = 10.0;

/// Gateway family on the other end of a serial line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SerialDeviceType {
    /// Actisense NGT-1 / W2K-1 in text mode.
    Actisense,
    /// Yacht Devices gateways speaking YDWG RAW.
    YachtDevices,
}

impl SerialDeviceType {
    /// Line delimiter the device terminates each frame with.
    pub fn line_delimiter(&self) -> &'static str {
        match self {
            SerialDeviceType::Actisense => "\n",
            SerialDeviceType::YachtDevices => "\r\n",
        }
    }
}

/// Socket flavour for `network` profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkProtocol {
    Tcp,
    Udp,
}

/// Transport-specific part of a profile.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TransportConfig {
    #[serde(rename_all = "camelCase")]
    Serial {
        #[serde(default)]
        serial_port: String,
        #[serde(default)]
        baud_rate: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_type: Option<SerialDeviceType>,
    },
    #[serde(rename_all = "camelCase")]
    Network {
        #[serde(default)]
        network_host: String,
        #[serde(default)]
        network_port: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        protocol: Option<NetworkProtocol>,
    },
    #[serde(rename_all = "camelCase")]
    Signalk {
        #[serde(default)]
        signalk_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signalk_username: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signalk_password: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    CanBus {
        #[serde(default)]
        can_interface: String,
    },
    #[serde(rename_all = "camelCase")]
    File {
        #[serde(default)]
        file_path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        playback_speed: Option<f64>,
    },
}

impl TransportConfig {
    /// The `type` discriminator as it appears on the wire.
    pub fn type_name(&self) -> &'static str {
        match self {
            TransportConfig::Serial { .. } => "serial",
            TransportConfig::Network { .. } => "network",
            TransportConfig::Signalk { .. } => "signalk",
            TransportConfig::CanBus { .. } => "can-bus",
            TransportConfig::File { .. } => "file",
        }
    }

    /// Check the fields required by this variant.
    pub fn validate(&self) -> Result<(), HubError> {
        match self {
            TransportConfig::Serial {
                serial_port,
                baud_rate,
                device_type,
            } => {
                require("serialPort", serial_port)?;
                if *baud_rate == 0 {
                    return Err(HubError::missing("baudRate"));
                }
                if device_type.is_none() {
                    return Err(HubError::missing("deviceType"));
                }
            }
            TransportConfig::Network {
                network_host,
                network_port,
                protocol,
            } => {
                require("networkHost", network_host)?;
                match *network_port {
                    0 => return Err(HubError::missing("networkPort")),
                    p if p > u32::from(u16::MAX) => {
                        return Err(HubError::invalid("networkPort", "must be 1-65535"));
                    }
                    _ => {}
                }
                if protocol.is_none() {
                    return Err(HubError::missing("protocol"));
                }
            }
            TransportConfig::Signalk {
                signalk_url,
                signalk_username,
                signalk_password,
            } => {
                require("signalkUrl", signalk_url)?;
                if !(signalk_url.starts_with("ws://") || signalk_url.starts_with("wss://")) {
                    return Err(HubError::invalid(
                        "signalkUrl",
                        "must start with ws:// or wss://",
                    ));
                }
                let has_user = signalk_username.as_deref().is_some_and(|u| !u.is_empty());
                let has_pass = signalk_password.as_deref().is_some_and(|p| !p.is_empty());
                if has_user && !has_pass {
                    return Err(HubError::missing("signalkPassword"));
                }
                if has_pass && !has_user {
                    return Err(HubError::missing("signalkUsername"));
                }
            }
            TransportConfig::CanBus { can_interface } => require("canInterface", can_interface)?,
            TransportConfig::File {
                file_path,
                playback_speed,
            } => {
                require("filePath", file_path)?;
                if let Some(speed) = playback_speed
                    && !(0.0..=MAX_PLAYBACK_SPEED).contains(speed)
                {
                    return Err(HubError::invalid(
                        "playbackSpeed",
                        format!("must be between 0 and {MAX_PLAYBACK_SPEED}"),
                    ));
                }
            }
        }
        Ok(())
    }
}

fn require(field: &str, value: &str) -> Result<(), HubError> {
    if value.trim().is_empty() {
        Err(HubError::missing(field))
    } else {
        Ok(())
    }
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportConfig::Serial {
                serial_port,
                baud_rate,
                device_type,
            } => f
                .debug_struct("Serial")
                .field("serial_port", serial_port)
                .field("baud_rate", baud_rate)
                .field("device_type", device_type)
                .finish(),
            TransportConfig::Network {
                network_host,
                network_port,
                protocol,
            } => f
                .debug_struct("Network")
                .field("network_host", network_host)
                .field("network_port", network_port)
                .field("protocol", protocol)
                .finish(),
            TransportConfig::Signalk {
                signalk_url,
                signalk_username,
                signalk_password,
            } => f
                .debug_struct("Signalk")
                .field("signalk_url", signalk_url)
                .field("signalk_username", signalk_username)
                .field(
                    "signalk_password",
                    if signalk_password.is_some() { &"<redacted>" } else { &"<not set>" },
                )
                .finish(),
            TransportConfig::CanBus { can_interface } => f
                .debug_struct("CanBus")
                .field("can_interface", can_interface)
                .finish(),
            TransportConfig::File {
                file_path,
                playback_speed,
            } => f
                .debug_struct("File")
                .field("file_path", file_path)
                .field("playback_speed", playback_speed)
                .finish(),
        }
    }
}

/// A named, persisted way of connecting to the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionProfile {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub transport: TransportConfig,
}

impl ConnectionProfile {
    /// Validate the common fields, then the variant's required fields.
    pub fn validate(&self) -> Result<(), HubError> {
        require("id", &self.id)?;
        require("name", &self.name)?;
        self.transport.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network(host: &str, port: u32) -> ConnectionProfile {
        ConnectionProfile {
            id: "boat".into(),
            name: "Boat".into(),
            transport: TransportConfig::Network {
                network_host: host.into(),
                network_port: port,
                protocol: Some(NetworkProtocol::Tcp),
            },
        }
    }

    #[test]
    fn flat_json_shape_deserializes() {
        let json = r#"{"id":"ngt","name":"NGT-1","type":"serial",
            "serialPort":"/dev/ttyUSB0","baudRate":115200,"deviceType":"actisense"}"#;
        let profile: ConnectionProfile = serde_json::from_str(json).unwrap();
        assert_eq!(profile.transport.type_name(), "serial");
        assert!(profile.validate().is_ok());
    }

    #[test]
    fn can_bus_uses_kebab_case_tag() {
        let profile = ConnectionProfile {
            id: "can".into(),
            name: "CAN".into(),
            transport: TransportConfig::CanBus {
                can_interface: "can0".into(),
            },
        };
        let json = serde_json::to_value(&profile).unwrap();
        assert_eq!(json["type"], "can-bus");
        assert_eq!(json["canInterface"], "can0");
    }

    #[test]
    fn missing_serial_field_is_named() {
        let json = r#"{"id":"s","name":"S","type":"serial","serialPort":"/dev/ttyUSB0","baudRate":115200}"#;
        let profile: ConnectionProfile = serde_json::from_str(json).unwrap();
        assert_eq!(profile.validate(), Err(HubError::missing("deviceType")));
    }

    #[test]
    fn missing_network_host_is_named() {
        assert_eq!(
            network("", 1457).validate(),
            Err(HubError::missing("networkHost"))
        );
        assert_eq!(
            network("10.0.0.1", 0).validate(),
            Err(HubError::missing("networkPort"))
        );
    }

    #[test]
    fn out_of_range_port_is_rejected() {
        assert!(matches!(
            network("10.0.0.1", 70_000).validate(),
            Err(HubError::Validation { field, .. }) if field == "networkPort"
        ));
    }

    #[test]
    fn playback_speed_bounds() {
        let mut profile = ConnectionProfile {
            id: "f".into(),
            name: "F".into(),
            transport: TransportConfig::File {
                file_path: "/tmp/log.raw".into(),
                playback_speed: Some(10.0),
            },
        };
        assert!(profile.validate().is_ok());
        profile.transport = TransportConfig::File {
            file_path: "/tmp/log.raw".into(),
            playback_speed: Some(10.5),
        };
        assert!(matches!(
            profile.validate(),
            Err(HubError::Validation { field, .. }) if field == "playbackSpeed"
        ));
    }

    #[test]
    fn signalk_requires_both_credentials() {
        let profile = ConnectionProfile {
            id: "sk".into(),
            name: "SK".into(),
            transport: TransportConfig::Signalk {
                signalk_url: "ws://localhost:3000/signalk/v1/stream".into(),
                signalk_username: Some("admin".into()),
                signalk_password: None,
            },
        };
        assert_eq!(profile.validate(), Err(HubError::missing("signalkPassword")));
    }

    #[test]
    fn signalk_rejects_http_url() {
        let profile = ConnectionProfile {
            id: "sk".into(),
            name: "SK".into(),
            transport: TransportConfig::Signalk {
                signalk_url: "http://localhost:3000".into(),
                signalk_username: None,
                signalk_password: None,
            },
        };
        assert!(profile.validate().is_err());
    }

    #[test]
    fn debug_redacts_signalk_password() {
        let transport = TransportConfig::Signalk {
            signalk_url: "ws://sk".into(),
            signalk_username: Some("admin".into()),
            signalk_password: Some("hunter2".into()),
        };
        let out = format!("{transport:?}");
        assert!(!out.contains("hunter2"));
        assert!(out.contains("<redacted>"));
    }

    #[test]
    fn toml_round_trip_keeps_profile() {
        let profile = network("10.0.0.1", 1457);
        let text = toml::to_string(&profile).unwrap();
        let back: ConnectionProfile = toml::from_str(&text).unwrap();
        assert_eq!(back, profile);
    }
}

//! Concrete transport adapters, one module per profile type.

pub mod can_bus;
pub mod file;
pub mod network;
pub mod serial;
pub mod signalk;

use pgnhub_types::{HubError, NetworkProtocol, SerialDeviceType, TransportConfig};

use crate::adapter::TransportAdapter;
use crate::signalk_auth::Credentials;

pub use can_bus::CanBusAdapter;
pub use file::FilePlaybackAdapter;
pub use network::{TcpAdapter, UdpAdapter};
pub use serial::SerialAdapter;
pub use signalk::SignalkAdapter;

/// Exhaustive over [`TransportConfig`], so a new profile type cannot be
/// added without an adapter.
pub(crate) fn for_config(config: &TransportConfig) -> Result<Box<dyn TransportAdapter>, HubError> {
    let adapter: Box<dyn TransportAdapter> = match config {
        TransportConfig::Serial {
            serial_port,
            baud_rate,
            device_type,
        } => Box::new(SerialAdapter::new(
            serial_port.clone(),
            *baud_rate,
            device_type.unwrap_or(SerialDeviceType::Actisense),
        )),
        TransportConfig::Network {
            network_host,
            network_port,
            protocol,
        } => {
            let port = u16::try_from(*network_port)
                .map_err(|_| HubError::invalid("networkPort", "must be 1-65535"))?;
            match protocol.unwrap_or(NetworkProtocol::Tcp) {
                NetworkProtocol::Tcp => Box::new(TcpAdapter::new(network_host.clone(), port)),
                NetworkProtocol::Udp => Box::new(UdpAdapter::new(network_host.clone(), port)),
            }
        }
        TransportConfig::Signalk {
            signalk_url,
            signalk_username,
            signalk_password,
        } => {
            let credentials = match (signalk_username, signalk_password) {
                (Some(username), Some(password)) if !username.is_empty() => Some(Credentials {
                    username: username.clone(),
                    password: password.clone(),
                }),
                _ => None,
            };
            Box::new(SignalkAdapter::new(signalk_url.clone(), credentials))
        }
        TransportConfig::CanBus { can_interface } => {
            Box::new(CanBusAdapter::new(can_interface.clone()))
        }
        TransportConfig::File {
            file_path,
            playback_speed,
        } => Box::new(FilePlaybackAdapter::new(
            file_path.clone(),
            playback_speed.unwrap_or(1.0),
        )),
    };
    Ok(adapter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_profile_type_gets_its_adapter() {
        let cases = [
            (r#"{"type":"serial","serialPort":"/dev/null","baudRate":115200,"deviceType":"actisense"}"#, "serial"),
            (r#"{"type":"network","networkHost":"localhost","networkPort":1457,"protocol":"udp"}"#, "udp"),
            (r#"{"type":"network","networkHost":"localhost","networkPort":1457,"protocol":"tcp"}"#, "tcp"),
            (r#"{"type":"signalk","signalkUrl":"ws://localhost:3000"}"#, "signalk"),
            (r#"{"type":"can-bus","canInterface":"can0"}"#, "can-bus"),
            (r#"{"type":"file","filePath":"/tmp/x.raw"}"#, "file"),
        ];
        for (json, kind) in cases {
            let config: TransportConfig = serde_json::from_str(json).unwrap();
            assert_eq!(for_config(&config).unwrap().kind(), kind);
        }
    }
}

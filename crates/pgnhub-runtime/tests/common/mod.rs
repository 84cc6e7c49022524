//! Helpers shared by the session integration tests.
#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;

use pgnhub_middleware::{BroadcastHub, Subscription};
use pgnhub_recorder::Recorder;
use pgnhub_runtime::{HubConfig, ProfileStore, Session, SessionHandle, SessionSettings};
use pgnhub_types::{BroadcastMessage, ConnectionProfile, NetworkProtocol, TransportConfig};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn fast_settings() -> SessionSettings {
    SessionSettings {
        activate_grace: Duration::from_millis(20),
        restart_grace: Duration::from_millis(50),
        command_buffer: 16,
    }
}

pub fn spawn_session(recordings: &Path) -> SessionHandle {
    Session::new(
        ProfileStore::in_memory(HubConfig::default()),
        Recorder::new(recordings),
        BroadcastHub::default(),
    )
    .with_settings(fast_settings())
    .spawn()
}

pub fn tcp_profile(id: &str, port: u16) -> ConnectionProfile {
    ConnectionProfile {
        id: id.into(),
        name: format!("TCP {port}"),
        transport: TransportConfig::Network {
            network_host: "127.0.0.1".into(),
            network_port: u32::from(port),
            protocol: Some(NetworkProtocol::Tcp),
        },
    }
}

pub fn file_profile(id: &str, path: &Path) -> ConnectionProfile {
    ConnectionProfile {
        id: id.into(),
        name: "Replay".into(),
        transport: TransportConfig::File {
            file_path: path.to_string_lossy().into_owned(),
            playback_speed: Some(0.0),
        },
    }
}

/// Skip messages until one named `event` arrives.
pub async fn next_event(sub: &mut Subscription, event: &str) -> BroadcastMessage {
    tokio::time::timeout(WAIT, async {
        loop {
            let msg = sub.recv().await.expect("hub closed");
            if msg.event == event {
                return msg;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {event}"))
}

/// A one-shot TCP peer: accepts one client, waits for `go`, writes `lines`
/// newline-terminated, then holds the socket open until the client leaves.
pub async fn line_server(lines: Vec<String>) -> (u16, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (go_tx, go_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = go_rx.await;
        for line in lines {
            stream.write_all(format!("{line}\n").as_bytes()).await.unwrap();
        }
        stream.flush().await.unwrap();
        let mut buf = [0u8; 64];
        let _ = tokio::io::AsyncReadExt::read(&mut stream, &mut buf).await;
    });
    (port, go_tx)
}

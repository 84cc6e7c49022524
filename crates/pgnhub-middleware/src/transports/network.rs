//! TCP and UDP gateways (YDWG-02, W2K-1, any NMEA 2000 to IP bridge).
//!
//! TCP is a client connection split on `\n`. UDP binds the profile port on
//! every interface, since gateways broadcast to it, and treats each
//! datagram as one or more complete lines. Outbound messages go out as
//! YDWG RAW lines.

use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use pgnhub_types::{HubError, PgnMessage, TransportFault};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket, lookup_host};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::{EventSink, TransportAdapter, already_used};
use crate::framing::{LineSplitter, split_datagram};
use crate::wire;

const MAX_DATAGRAM: usize = 65_507;

/// State shared by both socket adapters.
struct SocketLink {
    host: String,
    port: u16,
    cancel: CancellationToken,
    outbound: Option<mpsc::UnboundedSender<String>>,
    task: Option<JoinHandle<()>>,
    sink: Option<EventSink>,
    seq: AtomicU8,
}

impl SocketLink {
    fn new(host: String, port: u16) -> Self {
        Self {
            host,
            port,
            cancel: CancellationToken::new(),
            outbound: None,
            task: None,
            sink: None,
            seq: AtomicU8::new(0),
        }
    }

    async fn shutdown(&mut self) {
        self.cancel.cancel();
        self.outbound = None;
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!(host = %self.host, port = self.port, error = %e, "socket task ended abnormally");
        }
        if let Some(sink) = &self.sink {
            sink.disconnected();
        }
    }

    fn queue(&self, msg: &PgnMessage) -> Result<(), HubError> {
        let outbound = self
            .outbound
            .as_ref()
            .ok_or_else(|| HubError::Transport("connection is not open".into()))?;
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) & 0x7;
        for line in wire::to_ydraw_transmit(msg, seq)? {
            outbound
                .send(line + "\r\n")
                .map_err(|_| HubError::Transport("connection is closed".into()))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// TCP
// ---------------------------------------------------------------------------

pub struct TcpAdapter {
    link: SocketLink,
}

impl TcpAdapter {
    pub fn new(host: String, port: u16) -> Self {
        Self {
            link: SocketLink::new(host, port),
        }
    }
}

/// Try every resolved address; if all fail, report them together.
async fn connect_any(host: &str, port: u16) -> Result<TcpStream, TransportFault> {
    let addrs = lookup_host((host, port))
        .await
        .map_err(|e| TransportFault::from_io(&e))?;
    let mut causes = Vec::new();
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!(%addr, error = %e, "connect attempt failed");
                let mut fault = TransportFault::from_io(&e);
                fault.message = format!("{} ({addr})", fault.message);
                causes.push(fault);
            }
        }
    }
    match causes.len() {
        0 => Err(TransportFault::new(format!("{host}:{port} did not resolve")).with_code("ENOTFOUND")),
        1 => Err(causes.remove(0)),
        _ => Err(TransportFault::aggregate(
            format!("all connection attempts to {host}:{port} failed"),
            causes,
        )),
    }
}

async fn run_tcp(
    host: String,
    port: u16,
    cancel: CancellationToken,
    mut outbound: mpsc::UnboundedReceiver<String>,
    sink: EventSink,
) {
    let stream = tokio::select! {
        _ = cancel.cancelled() => return,
        result = connect_any(&host, port) => result,
    };
    let stream = match stream {
        Ok(stream) => stream,
        Err(fault) => {
            warn!(%host, port, error = %fault, "tcp connect failed");
            sink.fail(fault);
            return;
        }
    };
    info!(%host, port, "tcp connected");
    sink.connected();

    let (mut reader, mut writer) = stream.into_split();
    let mut splitter = LineSplitter::new("\n");
    let mut buf = vec![0u8; 4096];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    info!(%host, port, "tcp peer closed the connection");
                    break;
                }
                Ok(n) => {
                    for line in splitter.push(&buf[..n]) {
                        sink.raw(line.strip_suffix('\r').unwrap_or(&line));
                    }
                }
                Err(e) => {
                    warn!(%host, port, error = %e, "tcp read failed");
                    sink.fail(TransportFault::from_io(&e));
                    return;
                }
            },
            Some(line) = outbound.recv() => {
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    warn!(%host, port, error = %e, "tcp write failed");
                    sink.error(TransportFault::from_io(&e));
                }
            }
        }
    }
    sink.disconnected();
}

#[async_trait]
impl TransportAdapter for TcpAdapter {
    fn kind(&self) -> &'static str {
        "tcp"
    }

    async fn connect(&mut self, sink: EventSink) -> Result<(), HubError> {
        if self.link.sink.is_some() {
            return Err(already_used(self.kind()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.link.task = Some(tokio::spawn(run_tcp(
            self.link.host.clone(),
            self.link.port,
            self.link.cancel.clone(),
            rx,
            sink.clone(),
        )));
        self.link.outbound = Some(tx);
        self.link.sink = Some(sink);
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.link.shutdown().await;
    }

    async fn send(&self, msg: &PgnMessage) -> Result<(), HubError> {
        self.link.queue(msg)
    }
}

// ---------------------------------------------------------------------------
// UDP
// ---------------------------------------------------------------------------

pub struct UdpAdapter {
    link: SocketLink,
}

impl UdpAdapter {
    pub fn new(host: String, port: u16) -> Self {
        Self {
            link: SocketLink::new(host, port),
        }
    }
}

async fn run_udp(
    host: String,
    port: u16,
    cancel: CancellationToken,
    mut outbound: mpsc::UnboundedReceiver<String>,
    sink: EventSink,
) {
    let socket = match UdpSocket::bind(("0.0.0.0", port)).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!(port, error = %e, "udp bind failed");
            sink.fail(TransportFault::from_io(&e));
            return;
        }
    };
    if let Err(e) = socket.set_broadcast(true) {
        debug!(error = %e, "could not enable SO_BROADCAST");
    }
    info!(port, "udp socket bound");
    sink.connected();

    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((n, _peer)) => {
                    for line in split_datagram(&buf[..n]) {
                        sink.raw(line);
                    }
                }
                Err(e) => {
                    // Not fatal: ICMP errors surface here on some platforms.
                    warn!(port, error = %e, "udp receive failed");
                    sink.error(TransportFault::from_io(&e));
                }
            },
            Some(line) = outbound.recv() => {
                if let Err(e) = socket.send_to(line.as_bytes(), (host.as_str(), port)).await {
                    warn!(%host, port, error = %e, "udp send failed");
                    sink.error(TransportFault::from_io(&e));
                }
            }
        }
    }
    sink.disconnected();
}

#[async_trait]
impl TransportAdapter for UdpAdapter {
    fn kind(&self) -> &'static str {
        "udp"
    }

    async fn connect(&mut self, sink: EventSink) -> Result<(), HubError> {
        if self.link.sink.is_some() {
            return Err(already_used(self.kind()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.link.task = Some(tokio::spawn(run_udp(
            self.link.host.clone(),
            self.link.port,
            self.link.cancel.clone(),
            rx,
            sink.clone(),
        )));
        self.link.outbound = Some(tx);
        self.link.sink = Some(sink);
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.link.shutdown().await;
    }

    async fn send(&self, msg: &PgnMessage) -> Result<(), HubError> {
        self.link.queue(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterEvent;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_lines_are_emitted_in_order() -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket
                .write_all(b"first line\r\nsecond")
                .await
                .unwrap();
            socket.write_all(b" line\nthird line\n").await.unwrap();
        });

        let mut adapter = TcpAdapter::new("127.0.0.1".into(), port);
        let (sink, mut rx) = EventSink::channel(1);
        adapter.connect(sink).await?;

        let mut events = Vec::new();
        while let Some(signal) = rx.recv().await {
            let done = signal.event == AdapterEvent::Disconnected;
            events.push(signal.event);
            if done {
                break;
            }
        }
        server.await?;
        assert_eq!(
            events,
            vec![
                AdapterEvent::Connected,
                AdapterEvent::RawData("first line".into()),
                AdapterEvent::RawData("second line".into()),
                AdapterEvent::RawData("third line".into()),
                AdapterEvent::Disconnected,
            ]
        );
        adapter.disconnect().await;
        Ok(())
    }

    #[tokio::test]
    async fn closed_port_reports_connection_refused() -> Result<(), Box<dyn std::error::Error>> {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            listener.local_addr()?.port()
        };
        let mut adapter = TcpAdapter::new("127.0.0.1".into(), port);
        let (sink, mut rx) = EventSink::channel(1);
        adapter.connect(sink).await?;

        let AdapterEvent::Error(fault) = rx.recv().await.unwrap().event else {
            panic!("expected an error event");
        };
        assert!(fault.normalized().starts_with("ECONNREFUSED"));
        assert_eq!(rx.recv().await.unwrap().event, AdapterEvent::Disconnected);
        Ok(())
    }

    #[tokio::test]
    async fn tcp_send_writes_ydraw_lines() -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut lines = tokio::io::BufReader::new(socket).lines();
            lines.next_line().await.unwrap()
        });

        let mut adapter = TcpAdapter::new("127.0.0.1".into(), port);
        let (sink, mut rx) = EventSink::channel(1);
        adapter.connect(sink).await?;
        assert_eq!(rx.recv().await.unwrap().event, AdapterEvent::Connected);

        adapter
            .send(&PgnMessage::new(127250, 1, 255, 2, vec![0xff, 0x7f]))
            .await?;
        let line = server.await?;
        assert_eq!(line.as_deref().map(str::trim_end), Some("09F11201 FF 7F"));
        adapter.disconnect().await;
        Ok(())
    }

    #[tokio::test]
    async fn disconnect_silences_adapter() -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let _server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            drop(socket);
        });

        let mut adapter = TcpAdapter::new("127.0.0.1".into(), port);
        let (sink, mut rx) = EventSink::channel(1);
        adapter.connect(sink).await?;
        assert_eq!(rx.recv().await.unwrap().event, AdapterEvent::Connected);
        adapter.disconnect().await;
        adapter.disconnect().await;
        assert_eq!(rx.recv().await.unwrap().event, AdapterEvent::Disconnected);
        assert!(rx.try_recv().is_err());
        Ok(())
    }

    #[tokio::test]
    async fn udp_datagram_with_several_lines() -> Result<(), Box<dyn std::error::Error>> {
        let port = {
            let spy = std::net::UdpSocket::bind("127.0.0.1:0")?;
            spy.local_addr()?.port()
        };
        let mut adapter = UdpAdapter::new("127.0.0.1".into(), port);
        let (sink, mut rx) = EventSink::channel(1);
        adapter.connect(sink).await?;
        assert_eq!(rx.recv().await.unwrap().event, AdapterEvent::Connected);

        let client = UdpSocket::bind("127.0.0.1:0").await?;
        client
            .send_to(b"10:00:00.000 R 09F11201 FF\r\n10:00:00.001 R 09F11201 00\r\n", ("127.0.0.1", port))
            .await?;

        assert_eq!(
            rx.recv().await.unwrap().event,
            AdapterEvent::RawData("10:00:00.000 R 09F11201 FF".into())
        );
        assert_eq!(
            rx.recv().await.unwrap().event,
            AdapterEvent::RawData("10:00:00.001 R 09F11201 00".into())
        );
        adapter.disconnect().await;
        Ok(())
    }
}

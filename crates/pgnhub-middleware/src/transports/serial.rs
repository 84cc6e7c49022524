//! Serial NMEA 2000 gateways (Actisense NGT-1, Yacht Devices YDNU).

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use pgnhub_types::{HubError, PgnMessage, SerialDeviceType, TransportFault};
use serialport::{DataBits, FlowControl, Parity, StopBits};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adapter::{EventSink, TransportAdapter, already_used};
use crate::framing::LineSplitter;
use crate::wire;

/// Read timeout; bounds how long `disconnect` waits for the reader thread.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

pub struct SerialAdapter {
    path: String,
    baud_rate: u32,
    device: SerialDeviceType,
    stop: Arc<AtomicBool>,
    outbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
    worker: Option<JoinHandle<()>>,
    sink: Option<EventSink>,
    seq: AtomicU8,
}

impl SerialAdapter {
    pub fn new(path: String, baud_rate: u32, device: SerialDeviceType) -> Self {
        Self {
            path,
            baud_rate,
            device,
            stop: Arc::new(AtomicBool::new(false)),
            outbound: None,
            worker: None,
            sink: None,
            seq: AtomicU8::new(0),
        }
    }

    /// Bytes written to the device for `msg`.
    fn encode(&self, msg: &PgnMessage) -> Result<Vec<u8>, HubError> {
        let delimiter = self.device.line_delimiter();
        let text = match self.device {
            SerialDeviceType::Actisense => wire::to_actisense(msg)? + delimiter,
            SerialDeviceType::YachtDevices => {
                let seq = self.seq.fetch_add(1, Ordering::Relaxed) & 0x7;
                wire::to_ydraw_transmit(msg, seq)?
                    .into_iter()
                    .map(|line| line + delimiter)
                    .collect()
            }
        };
        Ok(text.into_bytes())
    }
}

fn run(
    path: String,
    baud_rate: u32,
    delimiter: &'static str,
    stop: Arc<AtomicBool>,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    sink: EventSink,
) {
    let mut port = match serialport::new(&path, baud_rate)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .timeout(READ_TIMEOUT)
        .open()
    {
        Ok(port) => port,
        Err(e) => {
            warn!(port = %path, error = %e, "failed to open serial port");
            sink.fail(TransportFault::from_io(&io::Error::from(e)));
            return;
        }
    };
    info!(port = %path, baud_rate, "serial port opened");
    sink.connected();

    let mut splitter = LineSplitter::new(delimiter);
    let mut buf = [0u8; 1024];
    while !stop.load(Ordering::Acquire) {
        while let Ok(bytes) = outbound.try_recv() {
            if let Err(e) = port.write_all(&bytes).and_then(|_| port.flush()) {
                warn!(port = %path, error = %e, "serial write failed");
                sink.error(TransportFault::from_io(&e));
            }
        }
        match port.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                for line in splitter.push(&buf[..n]) {
                    sink.raw(line);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
            Err(e) => {
                warn!(port = %path, error = %e, "serial read failed");
                sink.fail(TransportFault::from_io(&e));
                return;
            }
        }
    }
    debug!(port = %path, "serial reader stopped");
    sink.disconnected();
}

#[async_trait]
impl TransportAdapter for SerialAdapter {
    fn kind(&self) -> &'static str {
        "serial"
    }

    async fn connect(&mut self, sink: EventSink) -> Result<(), HubError> {
        if self.sink.is_some() {
            return Err(already_used(self.kind()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let path = self.path.clone();
        let baud_rate = self.baud_rate;
        let delimiter = self.device.line_delimiter();
        let stop = self.stop.clone();
        let task_sink = sink.clone();
        self.worker = Some(tokio::task::spawn_blocking(move || {
            run(path, baud_rate, delimiter, stop, rx, task_sink)
        }));
        self.outbound = Some(tx);
        self.sink = Some(sink);
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.outbound = None;
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                warn!(port = %self.path, error = %e, "serial worker ended abnormally");
            }
        }
        if let Some(sink) = &self.sink {
            sink.disconnected();
        }
    }

    async fn send(&self, msg: &PgnMessage) -> Result<(), HubError> {
        let outbound = self
            .outbound
            .as_ref()
            .ok_or_else(|| HubError::Transport("serial port is not open".into()))?;
        let bytes = self.encode(msg)?;
        outbound
            .send(bytes)
            .map_err(|_| HubError::Transport("serial port is closed".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterEvent;

    #[tokio::test]
    async fn missing_device_fails_with_error_then_disconnect() {
        let mut adapter = SerialAdapter::new(
            "/dev/pgnhub-no-such-port".into(),
            115_200,
            SerialDeviceType::Actisense,
        );
        let (sink, mut rx) = EventSink::channel(3);
        adapter.connect(sink).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert!(matches!(first.event, AdapterEvent::Error(_)));
        assert_eq!(rx.recv().await.unwrap().event, AdapterEvent::Disconnected);

        adapter.disconnect().await;
        adapter.disconnect().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn connect_twice_is_rejected() {
        let mut adapter =
            SerialAdapter::new("/dev/pgnhub-no-such-port".into(), 115_200, SerialDeviceType::Actisense);
        adapter.connect(EventSink::channel(1).0).await.unwrap();
        assert!(adapter.connect(EventSink::channel(2).0).await.is_err());
        adapter.disconnect().await;
    }

    #[test]
    fn yacht_devices_outbound_uses_ydraw_crlf() {
        let adapter = SerialAdapter::new("/dev/null".into(), 115_200, SerialDeviceType::YachtDevices);
        let msg = PgnMessage::new(127250, 1, 255, 2, vec![0xff, 0x7f]);
        let bytes = adapter.encode(&msg).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), "09F11201 FF 7F\r\n");
    }

    #[test]
    fn actisense_outbound_is_one_line() {
        let adapter = SerialAdapter::new("/dev/null".into(), 115_200, SerialDeviceType::Actisense);
        let msg = PgnMessage::new(127250, 1, 255, 2, vec![0xff, 0x7f]);
        let text = String::from_utf8(adapter.encode(&msg).unwrap()).unwrap();
        assert!(text.ends_with(",2,127250,1,255,2,ff,7f\n"));
    }
}

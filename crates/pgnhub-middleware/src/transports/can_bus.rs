//! Native CAN interfaces through Linux SocketCAN.
//!
//! On open the adapter claims a source address, then keeps defending it.
//! Fast packets are reassembled before emission and every complete
//! message is emitted as one Actisense text line.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use pgnhub_types::{HubError, PgnMessage};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adapter::{EventSink, TransportAdapter, already_used};
use crate::can::{
    AddressClaim, CanId, ClaimOutcome, FastPacketAssembler, PGN_ISO_ADDRESS_CLAIM, frames_for,
    is_fast_packet,
};
use crate::wire;

/// Source address tried first when claiming.
pub const DEFAULT_PREFERRED_ADDRESS: u8 = 100;

/// Protocol state of our node, independent of the socket.
pub struct CanNode {
    claim: AddressClaim,
    assembler: FastPacketAssembler,
    seq: u8,
}

/// What the node wants done after seeing a frame.
#[derive(Debug, Default, PartialEq)]
pub struct FrameOutcome {
    /// Completed message as an Actisense line.
    pub line: Option<String>,
    /// Frames to put on the bus in response.
    pub replies: Vec<(u32, Vec<u8>)>,
}

impl CanNode {
    pub fn new(name: u64, preferred: u8) -> Self {
        Self {
            claim: AddressClaim::new(name, preferred),
            assembler: FastPacketAssembler::new(),
            seq: 0,
        }
    }

    pub fn address(&self) -> u8 {
        self.claim.address()
    }

    pub fn claim_frame(&self) -> (u32, Vec<u8>) {
        let (id, data) = self.claim.claim_frame();
        (id, data.to_vec())
    }

    pub fn on_frame(&mut self, raw_id: u32, data: &[u8]) -> FrameOutcome {
        let id = CanId::decode(raw_id);
        let mut outcome = FrameOutcome::default();

        if AddressClaim::is_claim_request(id.pgn, data) {
            outcome.replies.push(self.claim_frame());
        } else if id.pgn == PGN_ISO_ADDRESS_CLAIM && data.len() == 8 {
            let mut name = [0u8; 8];
            name.copy_from_slice(data);
            match self.claim.on_claim(id.src, u64::from_le_bytes(name)) {
                ClaimOutcome::Unaffected => {}
                ClaimOutcome::Defend => outcome.replies.push(self.claim_frame()),
                ClaimOutcome::Moved(address) => {
                    info!(address, "lost address contest, claiming next address");
                    outcome.replies.push(self.claim_frame());
                }
                ClaimOutcome::CannotClaim => {
                    warn!("no free source address left on the bus");
                    outcome.replies.push(self.claim_frame());
                }
            }
        }

        let payload = if is_fast_packet(id.pgn) {
            self.assembler.push(id, data)
        } else {
            Some(data.to_vec())
        };
        if let Some(payload) = payload {
            let msg = PgnMessage::new(id.pgn, id.src, id.dst, id.prio, payload)
                .with_timestamp(Utc::now());
            match wire::to_actisense(&msg) {
                Ok(line) => outcome.line = Some(line),
                Err(e) => debug!(pgn = id.pgn, error = %e, "dropping frame without payload"),
            }
        }
        outcome
    }

    /// Frames for an outbound message, sent from our claimed address.
    pub fn frames_for(&mut self, msg: &PgnMessage) -> Result<Vec<(u32, Vec<u8>)>, HubError> {
        let mut msg = msg.clone();
        msg.src = self.address();
        let seq = self.seq;
        self.seq = (self.seq + 1) & 0x7;
        frames_for(&msg, seq)
    }
}

pub struct CanBusAdapter {
    interface: String,
    preferred_address: u8,
    stop: Arc<AtomicBool>,
    outbound: Option<mpsc::UnboundedSender<PgnMessage>>,
    worker: Option<JoinHandle<()>>,
    sink: Option<EventSink>,
    address: Arc<AtomicU8>,
}

impl CanBusAdapter {
    pub fn new(interface: String) -> Self {
        Self {
            interface,
            preferred_address: DEFAULT_PREFERRED_ADDRESS,
            stop: Arc::new(AtomicBool::new(false)),
            outbound: None,
            worker: None,
            sink: None,
            address: Arc::new(AtomicU8::new(DEFAULT_PREFERRED_ADDRESS)),
        }
    }

    pub fn with_preferred_address(mut self, address: u8) -> Self {
        self.preferred_address = address;
        self.address.store(address, Ordering::Relaxed);
        self
    }

    /// Source address currently held on the bus.
    pub fn address(&self) -> u8 {
        self.address.load(Ordering::Relaxed)
    }
}

#[cfg(target_os = "linux")]
mod socket {
    use std::io;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
    use std::time::Duration;

    use pgnhub_types::{PgnMessage, TransportFault};
    use socketcan::{CanFrame, CanSocket, EmbeddedFrame, ExtendedId, Frame, Socket};
    use tokio::sync::mpsc;
    use tracing::{debug, info, warn};

    use super::CanNode;
    use crate::adapter::EventSink;

    const READ_TIMEOUT: Duration = Duration::from_millis(100);

    fn write(sock: &CanSocket, id: u32, data: &[u8]) -> io::Result<()> {
        let frame = ExtendedId::new(id)
            .and_then(|id| CanFrame::new(id, data))
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid CAN frame"))?;
        sock.write_frame(&frame)
    }

    pub(super) fn run(
        interface: String,
        mut node: CanNode,
        address: Arc<AtomicU8>,
        stop: Arc<AtomicBool>,
        mut outbound: mpsc::UnboundedReceiver<PgnMessage>,
        sink: EventSink,
    ) {
        let sock = match CanSocket::open(&interface).and_then(|s| {
            s.set_read_timeout(READ_TIMEOUT)?;
            Ok(s)
        }) {
            Ok(sock) => sock,
            Err(e) => {
                warn!(%interface, error = %e, "failed to open CAN interface");
                sink.fail(TransportFault::from_io(&e));
                return;
            }
        };
        let (id, data) = node.claim_frame();
        if let Err(e) = write(&sock, id, &data) {
            warn!(%interface, error = %e, "address claim failed");
            sink.fail(TransportFault::from_io(&e));
            return;
        }
        info!(%interface, address = node.address(), "CAN interface opened");
        sink.connected();

        while !stop.load(Ordering::Acquire) {
            while let Ok(msg) = outbound.try_recv() {
                let frames = match node.frames_for(&msg) {
                    Ok(frames) => frames,
                    Err(e) => {
                        warn!(%interface, pgn = msg.pgn, error = %e, "dropping outbound message");
                        continue;
                    }
                };
                for (id, data) in frames {
                    if let Err(e) = write(&sock, id, &data) {
                        warn!(%interface, error = %e, "CAN write failed");
                        sink.error(TransportFault::from_io(&e));
                        break;
                    }
                }
            }
            let frame = match sock.read_frame() {
                Ok(CanFrame::Data(frame)) if frame.is_extended() => frame,
                Ok(_) => continue,
                Err(e)
                    if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
                {
                    continue;
                }
                Err(e) => {
                    warn!(%interface, error = %e, "CAN read failed");
                    sink.fail(TransportFault::from_io(&e));
                    return;
                }
            };
            let outcome = node.on_frame(frame.raw_id(), frame.data());
            for (id, data) in outcome.replies {
                if let Err(e) = write(&sock, id, &data) {
                    sink.error(TransportFault::from_io(&e));
                }
            }
            address.store(node.address(), Ordering::Relaxed);
            if let Some(line) = outcome.line {
                sink.raw(line);
            }
        }
        debug!(%interface, "CAN reader stopped");
        sink.disconnected();
    }
}

#[cfg(not(target_os = "linux"))]
mod socket {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicU8};

    use pgnhub_types::{PgnMessage, TransportFault};
    use tokio::sync::mpsc;

    use super::CanNode;
    use crate::adapter::EventSink;

    pub(super) fn run(
        _interface: String,
        _node: CanNode,
        _address: Arc<AtomicU8>,
        _stop: Arc<AtomicBool>,
        _outbound: mpsc::UnboundedReceiver<PgnMessage>,
        sink: EventSink,
    ) {
        sink.fail(
            TransportFault::new("CAN bus connections need Linux SocketCAN").with_code("ENOTSUP"),
        );
    }
}

#[async_trait]
impl TransportAdapter for CanBusAdapter {
    fn kind(&self) -> &'static str {
        "can-bus"
    }

    async fn connect(&mut self, sink: EventSink) -> Result<(), HubError> {
        if self.sink.is_some() {
            return Err(already_used(self.kind()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let node = CanNode::new(
            AddressClaim::gateway_name(std::process::id()),
            self.preferred_address,
        );
        let interface = self.interface.clone();
        let address = self.address.clone();
        let stop = self.stop.clone();
        let task_sink = sink.clone();
        self.worker = Some(tokio::task::spawn_blocking(move || {
            socket::run(interface, node, address, stop, rx, task_sink)
        }));
        self.outbound = Some(tx);
        self.sink = Some(sink);
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.outbound = None;
        if let Some(worker) = self.worker.take()
            && let Err(e) = worker.await
        {
            warn!(interface = %self.interface, error = %e, "CAN worker ended abnormally");
        }
        if let Some(sink) = &self.sink {
            sink.disconnected();
        }
    }

    async fn send(&self, msg: &PgnMessage) -> Result<(), HubError> {
        self.outbound
            .as_ref()
            .ok_or_else(|| HubError::Transport("CAN interface is not open".into()))?
            .send(msg.clone())
            .map_err(|_| HubError::Transport("CAN interface is closed".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterEvent;
    use crate::can::PGN_ISO_REQUEST;

    fn claim_id(src: u8) -> u32 {
        CanId {
            prio: 6,
            pgn: PGN_ISO_ADDRESS_CLAIM,
            src,
            dst: 255,
        }
        .encode()
    }

    #[test]
    fn single_frame_becomes_actisense_line() {
        let mut node = CanNode::new(AddressClaim::gateway_name(1), 100);
        let outcome = node.on_frame(0x09F11201, &[0xff, 0x7f, 0, 1, 2, 3, 4, 0xfd]);
        let line = outcome.line.unwrap();
        assert!(line.ends_with(",2,127250,1,255,8,ff,7f,00,01,02,03,04,fd"));
        assert!(outcome.replies.is_empty());
    }

    #[test]
    fn fast_packet_is_emitted_once_complete() {
        let mut node = CanNode::new(AddressClaim::gateway_name(1), 100);
        let msg = PgnMessage::new(129029, 7, 255, 3, (0u8..43).collect());
        let frames = crate::can::frames_for(&msg, 2).unwrap();
        let lines: Vec<String> = frames
            .iter()
            .filter_map(|(id, data)| node.on_frame(*id, data).line)
            .collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains(",129029,7,255,43,"));
    }

    #[test]
    fn claim_request_is_answered() {
        let mut node = CanNode::new(AddressClaim::gateway_name(1), 100);
        let request = CanId {
            prio: 6,
            pgn: PGN_ISO_REQUEST,
            src: 5,
            dst: 255,
        }
        .encode();
        let outcome = node.on_frame(request, &[0x00, 0xee, 0x00]);
        assert_eq!(outcome.replies, vec![node.claim_frame()]);
    }

    #[test]
    fn losing_contest_moves_address() {
        let mut node = CanNode::new(AddressClaim::gateway_name(1), 100);
        let outcome = node.on_frame(claim_id(100), &1u64.to_le_bytes());
        assert_eq!(node.address(), 101);
        assert_eq!(outcome.replies.len(), 1);
        assert_eq!(CanId::decode(outcome.replies[0].0).src, 101);
    }

    #[test]
    fn outbound_frames_use_claimed_address() {
        let mut node = CanNode::new(AddressClaim::gateway_name(1), 42);
        let frames = node
            .frames_for(&PgnMessage::new(127250, 1, 255, 2, vec![1, 2, 3]))
            .unwrap();
        assert_eq!(CanId::decode(frames[0].0).src, 42);
    }

    #[tokio::test]
    async fn missing_interface_fails() {
        let mut adapter = CanBusAdapter::new("pgnhub-nonexistent0".into());
        let (sink, mut rx) = EventSink::channel(1);
        adapter.connect(sink).await.unwrap();
        assert!(matches!(rx.recv().await.unwrap().event, AdapterEvent::Error(_)));
        assert_eq!(rx.recv().await.unwrap().event, AdapterEvent::Disconnected);
        adapter.disconnect().await;
    }
}

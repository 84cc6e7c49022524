//! ISO 11783 / NMEA 2000 framing on top of raw 29-bit CAN.
//!
//! - [`CanId`] packs and unpacks priority, PGN, source and destination.
//! - [`FastPacketAssembler`] stitches multi-frame ("fast packet") payloads
//!   back together; [`frames_for`] does the reverse for outbound messages.
//! - [`AddressClaim`] runs the address-claim handshake (PGN 60928).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use pgnhub_types::{HubError, PgnMessage};

pub const PGN_ISO_REQUEST: u32 = 59904;
pub const PGN_ISO_ADDRESS_CLAIM: u32 = 60928;

/// Highest address a device may claim; 254 is "cannot claim", 255 is global.
pub const MAX_CLAIMABLE_ADDRESS: u8 = 253;
pub const NULL_ADDRESS: u8 = 254;

/// Largest fast-packet payload: six bytes in the first frame plus seven in
/// each of the 31 frames a five-bit counter can number.
pub const MAX_FAST_PACKET_LEN: usize = 6 + 31 * 7;

/// Partial fast packets older than this are dropped.
const FAST_PACKET_TIMEOUT: Duration = Duration::from_millis(750);

/// PGNs transmitted as fast packets in the NMEA 2000 standard set.
const FAST_PACKET_PGNS: &[u32] = &[
    126208, 126464, 126720, 126983, 126984, 126985, 126986, 126987, 126988, 126996, 126998,
    127233, 127237, 127489, 127496, 127497, 127498, 127503, 127504, 127506, 127507, 127509,
    127510, 127511, 127512, 127513, 127514, 128275, 128520, 129029, 129038, 129039, 129040,
    129041, 129044, 129045, 129284, 129285, 129301, 129302, 129538, 129540, 129541, 129542,
    129545, 129547, 129549, 129551, 129556, 129792, 129793, 129794, 129795, 129796, 129797,
    129798, 129799, 129800, 129801, 129802, 129803, 129804, 129805, 129806, 129807, 129808,
    129809, 129810, 130052, 130053, 130054, 130060, 130061, 130064, 130065, 130066, 130067,
    130068, 130069, 130070, 130071, 130072, 130073, 130074, 130320, 130321, 130322, 130323,
    130324, 130567, 130569, 130570, 130571, 130572, 130573, 130574, 130577, 130578, 130580,
    130581, 130583, 130584, 130586,
];

/// Whether `pgn` travels as a fast packet.
pub fn is_fast_packet(pgn: u32) -> bool {
    (130816..=131071).contains(&pgn) || FAST_PACKET_PGNS.contains(&pgn)
}

/// Decoded 29-bit identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanId {
    pub prio: u8,
    pub pgn: u32,
    pub src: u8,
    pub dst: u8,
}

impl CanId {
    pub fn decode(id: u32) -> Self {
        let prio = ((id >> 26) & 0x7) as u8;
        let dp = (id >> 24) & 0x3;
        let pf = (id >> 16) & 0xff;
        let ps = (id >> 8) & 0xff;
        let src = (id & 0xff) as u8;
        if pf < 240 {
            Self {
                prio,
                pgn: (dp << 16) | (pf << 8),
                src,
                dst: ps as u8,
            }
        } else {
            Self {
                prio,
                pgn: (dp << 16) | (pf << 8) | ps,
                src,
                dst: 255,
            }
        }
    }

    pub fn encode(&self) -> u32 {
        let dp = (self.pgn >> 16) & 0x3;
        let pf = (self.pgn >> 8) & 0xff;
        let ps = if pf < 240 {
            u32::from(self.dst)
        } else {
            self.pgn & 0xff
        };
        (u32::from(self.prio & 0x7) << 26) | (dp << 24) | (pf << 16) | (ps << 8) | u32::from(self.src)
    }

    pub fn of(msg: &PgnMessage) -> Self {
        Self {
            prio: msg.prio,
            pgn: msg.pgn,
            src: msg.src,
            dst: msg.dst,
        }
    }
}

/// Split `data` into fast-packet frames carrying sequence id `seq` (0..=7).
pub fn fragment(seq: u8, data: &[u8]) -> Result<Vec<[u8; 8]>, HubError> {
    if data.len() > MAX_FAST_PACKET_LEN {
        return Err(HubError::invalid(
            "data",
            format!(
                "{} bytes exceed the {MAX_FAST_PACKET_LEN} byte fast-packet limit",
                data.len()
            ),
        ));
    }
    let seq_bits = (seq & 0x7) << 5;
    let mut frames = Vec::new();

    let mut first = [0xff_u8; 8];
    first[0] = seq_bits;
    first[1] = data.len() as u8;
    let head = data.len().min(6);
    first[2..2 + head].copy_from_slice(&data[..head]);
    frames.push(first);

    for (i, chunk) in data[head..].chunks(7).enumerate() {
        let mut frame = [0xff_u8; 8];
        frame[0] = seq_bits | ((i + 1) as u8);
        frame[1..1 + chunk.len()].copy_from_slice(chunk);
        frames.push(frame);
    }
    Ok(frames)
}

/// CAN id and data of every frame needed to put `msg` on the bus.
pub fn frames_for(msg: &PgnMessage, seq: u8) -> Result<Vec<(u32, Vec<u8>)>, HubError> {
    let id = CanId::of(msg).encode();
    if msg.data.len() <= 8 && !is_fast_packet(msg.pgn) {
        return Ok(vec![(id, msg.data.clone())]);
    }
    Ok(fragment(seq, &msg.data)?
        .into_iter()
        .map(|frame| (id, frame.to_vec()))
        .collect())
}

struct Partial {
    seq: u8,
    expected: usize,
    next_frame: u8,
    data: Vec<u8>,
    started: Instant,
}

/// Reassembles fast packets keyed by `(source, pgn)`.
#[derive(Default)]
pub struct FastPacketAssembler {
    partial: HashMap<(u8, u32), Partial>,
}

impl FastPacketAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one frame. Returns the payload once the last frame arrived.
    /// Single-frame PGNs are returned immediately.
    pub fn push(&mut self, id: CanId, frame: &[u8]) -> Option<Vec<u8>> {
        if !is_fast_packet(id.pgn) {
            return Some(frame.to_vec());
        }
        if frame.is_empty() {
            return None;
        }
        self.partial
            .retain(|_, p| p.started.elapsed() < FAST_PACKET_TIMEOUT);

        let key = (id.src, id.pgn);
        let seq = frame[0] >> 5;
        let counter = frame[0] & 0x1f;

        if counter == 0 {
            if frame.len() < 2 {
                return None;
            }
            let expected = frame[1] as usize;
            let mut data = frame[2..].to_vec();
            if data.len() >= expected {
                data.truncate(expected);
                self.partial.remove(&key);
                return Some(data);
            }
            self.partial.insert(
                key,
                Partial {
                    seq,
                    expected,
                    next_frame: 1,
                    data,
                    started: Instant::now(),
                },
            );
            return None;
        }

        let done = {
            let partial = self.partial.get_mut(&key)?;
            if partial.seq != seq || partial.next_frame != counter {
                // Out of order or a frame went missing; wait for a fresh start.
                self.partial.remove(&key);
                return None;
            }
            partial.data.extend_from_slice(&frame[1..]);
            partial.next_frame = partial.next_frame.wrapping_add(1);
            partial.data.len() >= partial.expected
        };
        if done {
            let mut partial = self.partial.remove(&key)?;
            partial.data.truncate(partial.expected);
            Some(partial.data)
        } else {
            None
        }
    }

    pub fn in_flight(&self) -> usize {
        self.partial.len()
    }
}

/// Result of reacting to another device's address claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Not our address, nothing to do.
    Unaffected,
    /// Contest won; re-announce our claim.
    Defend,
    /// Contest lost; we moved to a new address and must announce it.
    Moved(u8),
    /// No free address left.
    CannotClaim,
}

/// Address-claim state for our own node on the bus.
#[derive(Debug, Clone)]
pub struct AddressClaim {
    name: u64,
    address: u8,
}

impl AddressClaim {
    pub fn new(name: u64, preferred: u8) -> Self {
        Self {
            name,
            address: preferred.min(MAX_CLAIMABLE_ADDRESS),
        }
    }

    /// NAME for a self-configurable marine gateway with the given unique
    /// number.
    pub fn gateway_name(unique_number: u32) -> u64 {
        let unique = u64::from(unique_number & 0x1f_ffff);
        let manufacturer: u64 = 2046; // reserved for experimental use
        let function: u64 = 130; // PC gateway
        let class: u64 = 25; // inter/intranetwork device
        let industry: u64 = 4; // marine
        unique
            | (manufacturer << 21)
            | (function << 40)
            | (class << 49)
            | (industry << 60)
            | (1 << 63) // arbitrary address capable
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    /// The claim frame for the current address.
    pub fn claim_frame(&self) -> (u32, [u8; 8]) {
        let id = CanId {
            prio: 6,
            pgn: PGN_ISO_ADDRESS_CLAIM,
            src: self.address,
            dst: 255,
        };
        (id.encode(), self.name.to_le_bytes())
    }

    /// React to a claim seen on the bus from `src` with NAME `other`.
    pub fn on_claim(&mut self, src: u8, other: u64) -> ClaimOutcome {
        if src != self.address || other == self.name {
            return ClaimOutcome::Unaffected;
        }
        if self.name < other {
            return ClaimOutcome::Defend;
        }
        if self.address >= MAX_CLAIMABLE_ADDRESS {
            self.address = NULL_ADDRESS;
            return ClaimOutcome::CannotClaim;
        }
        self.address += 1;
        ClaimOutcome::Moved(self.address)
    }

    /// Whether a request frame asks for address claims.
    pub fn is_claim_request(pgn: u32, data: &[u8]) -> bool {
        pgn == PGN_ISO_REQUEST
            && data.len() >= 3
            && u32::from(data[0]) | (u32::from(data[1]) << 8) | (u32::from(data[2]) << 16)
                == PGN_ISO_ADDRESS_CLAIM
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pdu2_id_round_trips() {
        let id = CanId {
            prio: 2,
            pgn: 127250,
            src: 35,
            dst: 255,
        };
        let raw = id.encode();
        assert_eq!(raw, 0x09F1_1223);
        assert_eq!(CanId::decode(raw), id);
    }

    #[test]
    fn pdu1_carries_destination() {
        let id = CanId {
            prio: 6,
            pgn: PGN_ISO_REQUEST,
            src: 10,
            dst: 42,
        };
        let decoded = CanId::decode(id.encode());
        assert_eq!(decoded.pgn, PGN_ISO_REQUEST);
        assert_eq!(decoded.dst, 42);
    }

    #[test]
    fn fragment_then_reassemble() {
        let payload: Vec<u8> = (0..20).collect();
        let frames = fragment(3, &payload).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0][0], 3 << 5);
        assert_eq!(frames[0][1], 20);

        let id = CanId {
            prio: 3,
            pgn: 129029,
            src: 5,
            dst: 255,
        };
        let mut asm = FastPacketAssembler::new();
        assert!(asm.push(id, &frames[0]).is_none());
        assert!(asm.push(id, &frames[1]).is_none());
        assert_eq!(asm.push(id, &frames[2]), Some(payload));
        assert_eq!(asm.in_flight(), 0);
    }

    #[test]
    fn missing_frame_discards_partial() {
        let payload: Vec<u8> = (0..20).collect();
        let frames = fragment(0, &payload).unwrap();
        let id = CanId {
            prio: 3,
            pgn: 129029,
            src: 5,
            dst: 255,
        };
        let mut asm = FastPacketAssembler::new();
        asm.push(id, &frames[0]);
        assert!(asm.push(id, &frames[2]).is_none());
        assert_eq!(asm.in_flight(), 0);
    }

    #[test]
    fn single_frame_pgn_passes_through() {
        let id = CanId {
            prio: 2,
            pgn: 127250,
            src: 1,
            dst: 255,
        };
        let mut asm = FastPacketAssembler::new();
        assert_eq!(asm.push(id, &[1, 2, 3]), Some(vec![1, 2, 3]));
    }

    #[test]
    fn frames_for_short_single_frame_message() {
        let msg = PgnMessage::new(127250, 1, 255, 2, vec![0; 8]);
        assert_eq!(frames_for(&msg, 0).unwrap().len(), 1);
        let long = PgnMessage::new(129029, 1, 255, 3, vec![0; 43]);
        assert_eq!(frames_for(&long, 0).unwrap().len(), 7);
    }

    #[test]
    fn largest_fast_packet_round_trips() {
        let payload: Vec<u8> = (0..MAX_FAST_PACKET_LEN).map(|i| i as u8).collect();
        let frames = fragment(5, &payload).unwrap();
        assert_eq!(frames.len(), 32);
        assert_eq!(frames[31][0], (5 << 5) | 31);

        let id = CanId {
            prio: 3,
            pgn: 129029,
            src: 5,
            dst: 255,
        };
        let mut asm = FastPacketAssembler::new();
        let done: Vec<Vec<u8>> = frames.iter().filter_map(|f| asm.push(id, f)).collect();
        assert_eq!(done, vec![payload]);
    }

    #[test]
    fn oversized_payload_is_refused() {
        let payload = vec![0u8; MAX_FAST_PACKET_LEN + 1];
        assert!(matches!(
            fragment(0, &payload),
            Err(HubError::Validation { .. })
        ));
        let msg = PgnMessage::new(129029, 1, 255, 3, vec![0; 300]);
        assert!(frames_for(&msg, 0).is_err());
        assert!(crate::wire::to_candump(&msg, "can0").is_err());
    }

    #[test]
    fn losing_claim_moves_to_next_address() {
        let mut claim = AddressClaim::new(AddressClaim::gateway_name(7), 100);
        // A NAME lower than ours wins the contest.
        assert_eq!(claim.on_claim(100, 1), ClaimOutcome::Moved(101));
        assert_eq!(claim.address(), 101);
        assert_eq!(claim.on_claim(50, 1), ClaimOutcome::Unaffected);
    }

    #[test]
    fn winning_claim_is_defended() {
        let mut claim = AddressClaim::new(1, 100);
        assert_eq!(claim.on_claim(100, u64::MAX), ClaimOutcome::Defend);
        assert_eq!(claim.address(), 100);
    }

    #[test]
    fn claim_request_is_recognised() {
        assert!(AddressClaim::is_claim_request(PGN_ISO_REQUEST, &[0x00, 0xee, 0x00]));
        assert!(!AddressClaim::is_claim_request(PGN_ISO_REQUEST, &[0x14, 0xf0, 0x01]));
    }
}

//! PGN codec seam.
//!
//! The orchestrator only depends on [`PgnCodec`]; [`FrameCodec`] is the
//! built-in implementation covering every text format in [`crate::wire`].

use std::sync::Mutex;

use pgnhub_types::{HubError, PgnMessage, RecordingFormat};

use crate::can::{FastPacketAssembler, is_fast_packet};
use crate::wire::{self, ParsedLine};

/// Decode raw lines into structured messages and encode them back out.
pub trait PgnCodec: Send + Sync {
    /// `Ok(None)` means the line was understood but did not complete a
    /// message yet (one frame of a fast packet).
    fn parse(&self, raw: &str) -> Result<Option<PgnMessage>, HubError>;

    fn encode(&self, msg: &PgnMessage, format: RecordingFormat) -> Result<String, HubError>;
}

/// Stateful line codec. Keeps fast-packet reassembly state across calls,
/// so one instance should serve one input stream.
#[derive(Default)]
pub struct FrameCodec {
    assembler: Mutex<FastPacketAssembler>,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn assemble(&self, frame: wire::RawFrame) -> Option<PgnMessage> {
        let id = frame.id;
        let data = if is_fast_packet(id.pgn) {
            let mut assembler = self
                .assembler
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            assembler.push(id, &frame.data)?
        } else {
            frame.data
        };
        let mut msg = PgnMessage::new(id.pgn, id.src, id.dst, id.prio, data);
        msg.timestamp = frame.timestamp;
        Some(msg)
    }
}

impl PgnCodec for FrameCodec {
    fn parse(&self, raw: &str) -> Result<Option<PgnMessage>, HubError> {
        match wire::parse_line(raw)? {
            ParsedLine::Message(msg) => Ok(Some(msg)),
            ParsedLine::Frame(frame) => Ok(self.assemble(frame)),
        }
    }

    fn encode(&self, msg: &PgnMessage, format: RecordingFormat) -> Result<String, HubError> {
        wire::serialize(format, msg)
    }
}

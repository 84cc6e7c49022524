//! Text wire formats.
//!
//! One pure serializer per [`RecordingFormat`] plus line parsers for the
//! formats that can be read back. Serializers for frame-oriented formats
//! (`ydraw`, `candump`) emit one line per CAN frame, splitting fast packets.
//!
//! | Format | Line shape |
//! |---|---|
//! | `actisense` | `2024-05-01T10:00:00.000Z,2,127250,1,255,8,ff,7f,...` |
//! | `ydraw` | `10:00:00.000 R 09F11201 FF 7F ...` |
//! | `pcdin` | `$PCDIN,01F112,663212A0,01,FF7F...*hh` |
//! | `mxpgn` | `$MXPGN,01F112,2801,FD04...7FFF*hh` |
//! | `candump` | `(1714557600.000000) can0 09F11201#FF7F...` |

use chrono::{DateTime, NaiveTime, TimeZone, Timelike, Utc};
use pgnhub_types::message::hex_bytes;
use pgnhub_types::{HubError, PgnMessage, RecordingFormat};

use crate::can::{CanId, frames_for};

/// Serialize `msg` for `format`. `passthrough` has no structured form and
/// is rejected; callers write the raw line instead.
pub fn serialize(format: RecordingFormat, msg: &PgnMessage) -> Result<String, HubError> {
    match format {
        RecordingFormat::Passthrough => Err(HubError::Unsupported(
            "passthrough records raw input, not decoded messages".into(),
        )),
        RecordingFormat::CanboatJson | RecordingFormat::JsonArray => {
            serde_json::to_string(msg).map_err(|e| HubError::Parse(e.to_string()))
        }
        RecordingFormat::Actisense => to_actisense(msg),
        RecordingFormat::YdRaw => to_ydraw(msg),
        RecordingFormat::Pcdin => to_pcdin(msg),
        RecordingFormat::Mxpgn => to_mxpgn(msg),
        RecordingFormat::Candump => to_candump(msg, "can0"),
    }
}

/// Text written once when a recording file is opened.
pub fn file_header(format: RecordingFormat) -> &'static str {
    match format {
        RecordingFormat::JsonArray => "[\n",
        _ => "",
    }
}

/// Text written once when a recording file is finalised.
pub fn file_trailer(format: RecordingFormat) -> &'static str {
    match format {
        RecordingFormat::JsonArray => "\n]\n",
        _ => "",
    }
}

/// Text placed before a record: a separator for all but the first element
/// of a JSON array.
pub fn record_prefix(format: RecordingFormat, first: bool) -> &'static str {
    match format {
        RecordingFormat::JsonArray if !first => ",\n",
        _ => "",
    }
}

/// Text placed after a record.
pub fn record_suffix(format: RecordingFormat) -> &'static str {
    match format {
        RecordingFormat::JsonArray => "",
        _ => "\n",
    }
}

fn require_payload(msg: &PgnMessage) -> Result<(), HubError> {
    if msg.data.is_empty() {
        Err(HubError::Parse(format!(
            "PGN {} has no binary payload to serialize",
            msg.pgn
        )))
    } else {
        Ok(())
    }
}

fn timestamp_of(msg: &PgnMessage) -> DateTime<Utc> {
    msg.timestamp.unwrap_or_else(Utc::now)
}

fn hex_upper(bytes: &[u8], sep: &str) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(sep)
}

/// NMEA 0183 style XOR checksum of everything between `$`/`!` and `*`.
pub fn nmea_checksum(body: &str) -> u8 {
    body.bytes().fold(0, |acc, b| acc ^ b)
}

pub fn to_actisense(msg: &PgnMessage) -> Result<String, HubError> {
    require_payload(msg)?;
    let data = msg
        .data
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(",");
    Ok(format!(
        "{},{},{},{},{},{},{}",
        timestamp_of(msg).format("%Y-%m-%dT%H:%M:%S%.3fZ"),
        msg.prio,
        msg.pgn,
        msg.src,
        msg.dst,
        msg.data.len(),
        data
    ))
}

pub fn to_ydraw(msg: &PgnMessage) -> Result<String, HubError> {
    require_payload(msg)?;
    let time = timestamp_of(msg).format("%H:%M:%S%.3f").to_string();
    Ok(frames_for(msg, 0)?
        .into_iter()
        .map(|(id, data)| format!("{time} R {id:08X} {}", hex_upper(&data, " ")))
        .collect::<Vec<_>>()
        .join("\n"))
}

/// YDWG RAW lines as accepted by the gateway for transmission
/// (`<canid> <bytes>`, no time or direction).
pub fn to_ydraw_transmit(msg: &PgnMessage, seq: u8) -> Result<Vec<String>, HubError> {
    require_payload(msg)?;
    Ok(frames_for(msg, seq)?
        .into_iter()
        .map(|(id, data)| format!("{id:08X} {}", hex_upper(&data, " ")))
        .collect())
}

pub fn to_pcdin(msg: &PgnMessage) -> Result<String, HubError> {
    require_payload(msg)?;
    let secs = timestamp_of(msg).timestamp().max(0) as u32;
    let body = format!(
        "PCDIN,{:06X},{:08X},{:02X},{}",
        msg.pgn,
        secs,
        msg.src,
        hex_upper(&msg.data, "")
    );
    Ok(format!("${body}*{:02X}", nmea_checksum(&body)))
}

pub fn to_mxpgn(msg: &PgnMessage) -> Result<String, HubError> {
    require_payload(msg)?;
    if msg.data.len() > 8 {
        return Err(HubError::Parse(format!(
            "MXPGN carries single frames only, PGN {} has {} bytes",
            msg.pgn,
            msg.data.len()
        )));
    }
    let attr = (u16::from(msg.prio & 0x7) << 12)
        | ((msg.data.len() as u16 & 0xf) << 8)
        | u16::from(msg.src);
    let mut reversed = msg.data.clone();
    reversed.reverse();
    let body = format!("MXPGN,{:06X},{attr:04X},{}", msg.pgn, hex_upper(&reversed, ""));
    Ok(format!("${body}*{:02X}", nmea_checksum(&body)))
}

pub fn to_candump(msg: &PgnMessage, iface: &str) -> Result<String, HubError> {
    require_payload(msg)?;
    let ts = timestamp_of(msg);
    let stamp = format!("({}.{:06})", ts.timestamp(), ts.timestamp_subsec_micros());
    Ok(frames_for(msg, 0)?
        .into_iter()
        .map(|(id, data)| format!("{stamp} {iface} {id:08X}#{}", hex_upper(&data, "")))
        .collect::<Vec<_>>()
        .join("\n"))
}

// ---------------------------------------------------------------------------
// Parsers
// ---------------------------------------------------------------------------

/// One raw CAN frame read from a frame-oriented line.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    pub id: CanId,
    pub data: Vec<u8>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// A parsed line: either a whole message or a single CAN frame that may
/// still need fast-packet reassembly.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    Message(PgnMessage),
    Frame(RawFrame),
}

/// Recognise the wire format of `line` and parse it.
pub fn parse_line(line: &str) -> Result<ParsedLine, HubError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(HubError::Parse("empty line".into()));
    }
    if line.starts_with('{') {
        return serde_json::from_str::<PgnMessage>(line)
            .map(ParsedLine::Message)
            .map_err(|e| HubError::Parse(format!("invalid canboat JSON: {e}")));
    }
    if line.starts_with("$PCDIN,") {
        return parse_pcdin(line).map(ParsedLine::Message);
    }
    if line.starts_with("$MXPGN,") {
        return parse_mxpgn(line).map(ParsedLine::Message);
    }
    if line.starts_with('(') {
        return parse_candump(line).map(ParsedLine::Frame);
    }
    if line.contains(',') {
        return parse_actisense(line).map(ParsedLine::Message);
    }
    parse_ydraw(line).map(ParsedLine::Frame)
}

fn bad(kind: &str, line: &str) -> HubError {
    HubError::Parse(format!("malformed {kind} line: {line}"))
}

fn split_checksum<'a>(line: &'a str, kind: &str) -> Result<&'a str, HubError> {
    let body = &line[1..];
    let (body, cs) = body.split_once('*').ok_or_else(|| bad(kind, line))?;
    let cs = u8::from_str_radix(cs.trim(), 16).map_err(|_| bad(kind, line))?;
    if nmea_checksum(body) != cs {
        return Err(HubError::Parse(format!("checksum mismatch: {line}")));
    }
    Ok(body)
}

pub fn parse_actisense(line: &str) -> Result<PgnMessage, HubError> {
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    if parts.len() < 7 {
        return Err(bad("actisense", line));
    }
    let byte = |s: &str| s.parse::<u8>().map_err(|_| bad("actisense", line));
    let prio = byte(parts[1])?;
    if prio > 7 {
        return Err(bad("actisense", line));
    }
    let pgn = parts[2]
        .parse::<u32>()
        .map_err(|_| bad("actisense", line))?;
    let src = byte(parts[3])?;
    let dst = byte(parts[4])?;
    let len = parts[5]
        .parse::<usize>()
        .map_err(|_| bad("actisense", line))?;
    let data = parts[6..]
        .iter()
        .map(|b| u8::from_str_radix(b, 16).map_err(|_| bad("actisense", line)))
        .collect::<Result<Vec<u8>, _>>()?;
    if data.len() != len {
        return Err(bad("actisense", line));
    }
    let mut msg = PgnMessage::new(pgn, src, dst, prio, data);
    msg.timestamp = DateTime::parse_from_rfc3339(parts[0])
        .ok()
        .map(|t| t.with_timezone(&Utc));
    Ok(msg)
}

pub fn parse_pcdin(line: &str) -> Result<PgnMessage, HubError> {
    let body = split_checksum(line, "PCDIN")?;
    let parts: Vec<&str> = body.split(',').collect();
    if parts.len() != 5 {
        return Err(bad("PCDIN", line));
    }
    let pgn = u32::from_str_radix(parts[1], 16).map_err(|_| bad("PCDIN", line))?;
    let secs = i64::from_str_radix(parts[2], 16).map_err(|_| bad("PCDIN", line))?;
    let src = u8::from_str_radix(parts[3], 16).map_err(|_| bad("PCDIN", line))?;
    let data = hex_bytes::decode(parts[4]).ok_or_else(|| bad("PCDIN", line))?;
    let mut msg = PgnMessage::new(pgn, src, 255, 3, data);
    msg.timestamp = Utc.timestamp_opt(secs, 0).single();
    Ok(msg)
}

pub fn parse_mxpgn(line: &str) -> Result<PgnMessage, HubError> {
    let body = split_checksum(line, "MXPGN")?;
    let parts: Vec<&str> = body.split(',').collect();
    if parts.len() != 4 {
        return Err(bad("MXPGN", line));
    }
    let pgn = u32::from_str_radix(parts[1], 16).map_err(|_| bad("MXPGN", line))?;
    let attr = u16::from_str_radix(parts[2], 16).map_err(|_| bad("MXPGN", line))?;
    let mut data = hex_bytes::decode(parts[3]).ok_or_else(|| bad("MXPGN", line))?;
    data.reverse();
    let prio = ((attr >> 12) & 0x7) as u8;
    let src = (attr & 0xff) as u8;
    Ok(PgnMessage::new(pgn, src, 255, prio, data))
}

pub fn parse_candump(line: &str) -> Result<RawFrame, HubError> {
    let mut parts = line.split_whitespace();
    let stamp = parts.next().ok_or_else(|| bad("candump", line))?;
    let _iface = parts.next().ok_or_else(|| bad("candump", line))?;
    let frame = parts.next().ok_or_else(|| bad("candump", line))?;
    let (id, data) = frame.split_once('#').ok_or_else(|| bad("candump", line))?;
    let id = u32::from_str_radix(id, 16).map_err(|_| bad("candump", line))?;
    let data = hex_bytes::decode(data).ok_or_else(|| bad("candump", line))?;
    let timestamp = stamp
        .trim_start_matches('(')
        .trim_end_matches(')')
        .split_once('.')
        .and_then(|(s, us)| {
            let secs = s.parse::<i64>().ok()?;
            let micros = us.parse::<u32>().ok()?;
            Utc.timestamp_opt(secs, micros.saturating_mul(1000)).single()
        });
    Ok(RawFrame {
        id: CanId::decode(id),
        data,
        timestamp,
    })
}

pub fn parse_ydraw(line: &str) -> Result<RawFrame, HubError> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    // Either "<time> <R|T> <id> <bytes..>" or the transmit form "<id> <bytes..>".
    let (time, rest) = match tokens.as_slice() {
        [time, dir, rest @ ..] if (*dir == "R" || *dir == "T") && time.contains(':') => {
            (Some(*time), rest)
        }
        rest => (None, rest),
    };
    let (id, bytes) = rest.split_first().ok_or_else(|| bad("YDWG RAW", line))?;
    if id.len() != 8 || bytes.len() > 8 {
        return Err(bad("YDWG RAW", line));
    }
    let id = u32::from_str_radix(id, 16).map_err(|_| bad("YDWG RAW", line))?;
    let data = bytes
        .iter()
        .map(|b| u8::from_str_radix(b, 16).map_err(|_| bad("YDWG RAW", line)))
        .collect::<Result<Vec<u8>, _>>()?;
    let timestamp = time.and_then(|t| {
        let tod = NaiveTime::parse_from_str(t, "%H:%M:%S%.3f").ok()?;
        let today = Utc::now().date_naive();
        Some(today.and_hms_nano_opt(tod.hour(), tod.minute(), tod.second(), tod.nanosecond())?.and_utc())
    });
    Ok(RawFrame {
        id: CanId::decode(id),
        data,
        timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PgnMessage {
        PgnMessage::new(127250, 1, 255, 2, vec![0xff, 0x7f, 0x00, 0x01, 0x02, 0x03, 0x04, 0xfd])
            .with_timestamp(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap())
    }

    #[test]
    fn actisense_line_shape() {
        let line = to_actisense(&sample()).unwrap();
        assert_eq!(
            line,
            "2024-05-01T10:00:00.000Z,2,127250,1,255,8,ff,7f,00,01,02,03,04,fd"
        );
        assert_eq!(parse_actisense(&line).unwrap(), sample());
    }

    #[test]
    fn actisense_fields_out_of_range_are_rejected() {
        for line in [
            "2024-05-01T10:00:00.000Z,2,127250,300,255,2,ff,7f",
            "2024-05-01T10:00:00.000Z,2,127250,1,256,2,ff,7f",
            "2024-05-01T10:00:00.000Z,8,127250,1,255,2,ff,7f",
            "2024-05-01T10:00:00.000Z,258,127250,1,255,2,ff,7f",
            "2024-05-01T10:00:00.000Z,2,127250,-1,255,2,ff,7f",
            "2024-05-01T10:00:00.000Z,2,127250,1,255,3,ff,7f",
        ] {
            assert!(
                matches!(parse_actisense(line), Err(HubError::Parse(_))),
                "accepted {line}"
            );
        }
        let edge = parse_actisense("2024-05-01T10:00:00.000Z,7,127250,255,0,1,ff").unwrap();
        assert_eq!((edge.prio, edge.src, edge.dst), (7, 255, 0));
    }

    #[test]
    fn pcdin_checksum_is_verified() {
        let line = to_pcdin(&sample()).unwrap();
        assert!(line.starts_with("$PCDIN,01F112,"));
        let parsed = parse_pcdin(&line).unwrap();
        assert_eq!(parsed.data, sample().data);

        let mut corrupted = line.clone();
        corrupted.replace_range(8..9, "0");
        assert!(parse_pcdin(&corrupted).is_err());
    }

    #[test]
    fn mxpgn_reverses_payload() {
        let line = to_mxpgn(&sample()).unwrap();
        assert!(line.contains(",FD04030201007FFF*"));
        let parsed = parse_mxpgn(&line).unwrap();
        assert_eq!(parsed.data, sample().data);
        assert_eq!(parsed.prio, 2);
        assert_eq!(parsed.src, 1);
    }

    #[test]
    fn mxpgn_rejects_fast_packets() {
        let msg = PgnMessage::new(129029, 1, 255, 3, vec![0; 43]);
        assert!(to_mxpgn(&msg).is_err());
    }

    #[test]
    fn ydraw_splits_fast_packets() {
        let msg = PgnMessage::new(129029, 1, 255, 3, vec![0; 43])
            .with_timestamp(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap());
        let text = to_ydraw(&msg).unwrap();
        assert_eq!(text.lines().count(), 7);
        assert!(text.starts_with("10:00:00.000 R 0DF80501 "));
    }

    #[test]
    fn candump_line_parses_back() {
        let line = to_candump(&sample(), "can0").unwrap();
        assert_eq!(line, "(1714557600.000000) can0 09F11201#FF7F0001020304FD");
        let frame = parse_candump(&line).unwrap();
        assert_eq!(frame.id.pgn, 127250);
        assert_eq!(frame.data, sample().data);
        assert_eq!(frame.timestamp, sample().timestamp);
    }

    #[test]
    fn ydraw_transmit_form_parses() {
        let frame = parse_ydraw("09F11201 FF 7F 00").unwrap();
        assert_eq!(frame.id.src, 1);
        assert_eq!(frame.data, vec![0xff, 0x7f, 0x00]);
        assert!(frame.timestamp.is_none());
    }

    #[test]
    fn messages_without_payload_cannot_be_binary_encoded() {
        let msg = PgnMessage::new(127250, 1, 255, 2, Vec::new());
        for format in [
            RecordingFormat::Actisense,
            RecordingFormat::YdRaw,
            RecordingFormat::Pcdin,
            RecordingFormat::Mxpgn,
            RecordingFormat::Candump,
        ] {
            assert!(serialize(format, &msg).is_err(), "{format} accepted empty payload");
        }
        assert!(serialize(RecordingFormat::CanboatJson, &msg).is_ok());
    }

    #[test]
    fn parse_line_dispatches_on_shape() {
        assert!(matches!(
            parse_line(r#"{"pgn":127250,"src":1}"#),
            Ok(ParsedLine::Message(_))
        ));
        assert!(matches!(
            parse_line("10:00:00.000 R 09F11201 FF"),
            Ok(ParsedLine::Frame(_))
        ));
        assert!(parse_line("garbage").is_err());
    }

    #[test]
    fn json_array_framing() {
        assert_eq!(file_header(RecordingFormat::JsonArray), "[\n");
        assert_eq!(record_prefix(RecordingFormat::JsonArray, true), "");
        assert_eq!(record_prefix(RecordingFormat::JsonArray, false), ",\n");
        assert_eq!(record_suffix(RecordingFormat::Actisense), "\n");
        assert_eq!(file_trailer(RecordingFormat::CanboatJson), "");
    }
}

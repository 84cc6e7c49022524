//! Message submission: decode a caller's batch, optionally put it on the
//! wire.
//!
//! `input` may be one canboat JSON object, an array of objects and/or text
//! blocks, or a text block of lines in any format the codec reads. Each
//! entry is decoded on its own; a bad entry gets an error in its report and
//! the rest of the batch carries on.

use pgnhub_middleware::PgnCodec;
use pgnhub_types::{HubError, PgnMessage};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubmitRequest {
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub transmit: bool,
}

/// Outcome for one entry of the batch.
///
/// `parsed == false` without an `error` marks a frame that was taken into a
/// fast packet still being assembled; a later line of the same batch
/// carries the message.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReport {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<PgnMessage>,
    pub parsed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transmitted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transmit_error: Option<String>,
}

impl SubmitReport {
    pub fn record_transmit(&mut self, outcome: Result<(), HubError>) {
        match outcome {
            Ok(()) => self.transmitted = Some(true),
            Err(e) => {
                self.transmitted = Some(false);
                self.transmit_error = Some(e.to_string());
            }
        }
    }
}

enum Entry {
    Object(Value),
    Line(String),
}

fn lines(text: &str) -> impl Iterator<Item = Entry> + '_ {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| Entry::Line(l.to_string()))
}

fn entries(input: &Value) -> Result<Vec<Entry>, HubError> {
    let entries: Vec<Entry> = match input {
        Value::Null => return Err(HubError::missing("input")),
        Value::Object(_) => vec![Entry::Object(input.clone())],
        Value::String(text) => lines(text).collect(),
        Value::Array(items) => items
            .iter()
            .flat_map(|item| match item {
                Value::String(text) => lines(text).collect::<Vec<_>>(),
                other => vec![Entry::Object(other.clone())],
            })
            .collect(),
        _ => {
            return Err(HubError::invalid(
                "input",
                "must be an object, an array or text",
            ));
        }
    };
    if entries.is_empty() {
        return Err(HubError::invalid("input", "contains no messages"));
    }
    Ok(entries)
}

/// Decode every entry of `input`. Fails only when `input` itself is
/// unusable.
pub fn decode_batch(input: &Value, codec: &dyn PgnCodec) -> Result<Vec<SubmitReport>, HubError> {
    let reports = entries(input)?
        .into_iter()
        .enumerate()
        .map(|(index, entry)| {
            let mut report = SubmitReport {
                index,
                ..SubmitReport::default()
            };
            let decoded = match entry {
                Entry::Object(value) => serde_json::from_value::<PgnMessage>(value)
                    .map(Some)
                    .map_err(|e| HubError::Parse(format!("invalid message object: {e}"))),
                Entry::Line(line) => {
                    let decoded = codec.parse(&line);
                    report.raw = Some(line);
                    decoded
                }
            };
            match decoded {
                Ok(Some(msg)) => {
                    report.parsed = true;
                    report.message = Some(msg);
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(index, error = %e, "submitted entry rejected");
                    report.error = Some(e.to_string());
                }
            }
            report
        })
        .collect();
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgnhub_middleware::FrameCodec;
    use serde_json::json;

    #[test]
    fn single_object_is_one_message() {
        let codec = FrameCodec::new();
        let reports = decode_batch(&json!({"pgn": 127250, "src": 4, "data": "ff7f"}), &codec).unwrap();
        assert_eq!(reports.len(), 1);
        let msg = reports[0].message.as_ref().unwrap();
        assert_eq!(msg.pgn, 127250);
        assert_eq!(msg.src, 4);
        assert_eq!(msg.data, vec![0xff, 0x7f]);
        assert!(reports[0].raw.is_none());
    }

    #[test]
    fn bad_line_does_not_abort_the_batch() {
        let codec = FrameCodec::new();
        let text = "2024-05-01T10:00:00.000Z,2,127250,1,255,3,ff,7f,00\nnot a frame\n\n{\"pgn\":129025}";
        let reports = decode_batch(&Value::String(text.into()), &codec).unwrap();
        assert_eq!(reports.len(), 3);
        assert!(reports[0].parsed);
        assert!(!reports[1].parsed);
        assert!(reports[1].error.is_some());
        assert_eq!(reports[1].raw.as_deref(), Some("not a frame"));
        assert_eq!(reports[2].message.as_ref().map(|m| m.pgn), Some(129025));
        assert_eq!(reports.iter().map(|r| r.index).collect::<Vec<_>>(), [0, 1, 2]);
    }

    #[test]
    fn array_mixes_objects_and_text() {
        let codec = FrameCodec::new();
        let input = json!([{"pgn": 60928}, "$PCDIN,01F112,00000000,01,FF7F00*55", 42]);
        let reports = decode_batch(&input, &codec).unwrap();
        assert_eq!(reports.len(), 3);
        assert!(reports[0].parsed);
        assert_eq!(reports[1].message.as_ref().map(|m| m.pgn), Some(127250));
        assert!(reports[2].error.is_some());
    }

    #[test]
    fn unusable_input_is_a_validation_error() {
        let codec = FrameCodec::new();
        for input in [Value::Null, json!(""), json!([]), json!(7)] {
            assert!(matches!(
                decode_batch(&input, &codec),
                Err(HubError::Validation { .. })
            ));
        }
    }

    #[test]
    fn transmit_outcome_serializes_camel_case() {
        let mut report = SubmitReport::default();
        report.record_transmit(Err(HubError::NoActiveConnection));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["transmitted"], false);
        assert_eq!(json["transmitError"], "No active connection");
        assert!(json.get("message").is_none());
    }
}

//! Byte stream → line framing.
//!
//! Stream transports (serial, TCP) deliver arbitrary chunks; [`LineSplitter`]
//! buffers them and yields complete lines with the delimiter removed.
//! Datagram transports call [`split_datagram`] since a datagram may carry
//! several messages but never a partial one.

use tracing::warn;

/// Longest line kept while waiting for a delimiter.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

#[derive(Debug)]
pub struct LineSplitter {
    delimiter: Vec<u8>,
    buffer: Vec<u8>,
}

impl LineSplitter {
    /// `delimiter` must be non-empty; an empty one falls back to `\n`.
    pub fn new(delimiter: &str) -> Self {
        let delimiter = if delimiter.is_empty() { "\n" } else { delimiter };
        Self {
            delimiter: delimiter.as_bytes().to_vec(),
            buffer: Vec::new(),
        }
    }

    /// Feed a chunk and return every line completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(pos) = find(&self.buffer[start..], &self.delimiter) {
            let end = start + pos;
            let line = String::from_utf8_lossy(&self.buffer[start..end]);
            if !line.trim().is_empty() {
                lines.push(line.into_owned());
            }
            start = end + self.delimiter.len();
        }
        self.buffer.drain(..start);
        if self.buffer.len() > MAX_LINE_BYTES {
            warn!(
                bytes = self.buffer.len(),
                "no line delimiter within limit, discarding buffered bytes"
            );
            self.buffer.clear();
        }
        lines
    }

    /// Bytes waiting for a delimiter.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Split one datagram on newlines, dropping a trailing `\r` per line.
pub fn split_datagram(datagram: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(datagram)
        .split('\n')
        .map(|l| l.strip_suffix('\r').unwrap_or(l))
        .filter(|l| !l.trim().is_empty())
        .map(str::to_string)
        .collect()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

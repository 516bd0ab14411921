//! Incremental NDJSON framing for the worker's stdout.
//!
//! Bytes arrive in arbitrary chunks. The framer buffers them, splits on
//! `\n`, and parses each complete, non-blank line as JSON. Lines that are
//! not JSON are worker log output: they are reported to the caller as
//! [`Frame::Text`] and never produce a record.

use serde_json::Value;
use tracing::debug;

/// One complete line taken off the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A line that parsed as JSON.
    Record(Value),
    /// A non-blank line that is not JSON.
    Text(String),
}

/// Line framer with an accumulating byte buffer.
///
/// The buffer is raw bytes rather than `String` so that a multi-byte UTF-8
/// sequence split across two chunks is reassembled before decoding.
#[derive(Debug, Default)]
pub struct LineFramer {
    buf: Vec<u8>,
}

impl LineFramer {
    /// Create an empty framer.
    pub const fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Feed a chunk and return every frame it completes, in stream order.
    pub fn feed_frames(&mut self, chunk: &[u8]) -> Vec<Frame> {
        if chunk.is_empty() {
            return Vec::new();
        }

        // Only the new bytes can contain the next newline.
        let scan_from = self.buf.len();
        self.buf.extend_from_slice(chunk);

        let Some(last_newline) = self
            .buf
            .get(scan_from..)
            .and_then(|tail| tail.iter().rposition(|&b| b == b'\n'))
            .map(|pos| pos.saturating_add(scan_from))
        else {
            return Vec::new();
        };

        // Split off everything after the last newline as the new partial.
        let rest = self.buf.split_off(last_newline.saturating_add(1));
        let complete = std::mem::replace(&mut self.buf, rest);

        complete
            .split(|&b| b == b'\n')
            .filter_map(|line| {
                let text = String::from_utf8_lossy(line);
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    return None;
                }
                match serde_json::from_str::<Value>(trimmed) {
                    Ok(value) => Some(Frame::Record(value)),
                    Err(e) => {
                        debug!(error = %e, line = trimmed, "Non-JSON line on worker stdout");
                        Some(Frame::Text(trimmed.to_string()))
                    }
                }
            })
            .collect()
    }

    /// Feed a chunk and return only the JSON records it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.feed_frames(chunk)
            .into_iter()
            .filter_map(|frame| match frame {
                Frame::Record(value) => Some(value),
                Frame::Text(_) => None,
            })
            .collect()
    }

    /// Number of buffered bytes not yet terminated by a newline.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}

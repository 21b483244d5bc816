//! Message framing for the wire protocol.
//!
//! Envelopes travel as one compact JSON object per line. The decoder copes
//! with partial reads and resynchronizes on the next newline after any
//! malformed or oversized line.

use crate::envelope::Envelope;
use crate::WireError;
use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

/// Maximum line length (64 KiB default)
pub const DEFAULT_MAX_LINE_LEN: usize = 64 * 1024;

/// Line terminator
pub const FRAME_DELIMITER: u8 = b'\n';

/// Encode an envelope as a single terminated line
pub fn encode(envelope: &Envelope) -> Result<Bytes, WireError> {
    let body = serde_json::to_vec(&envelope.to_wire())?;
    let mut buf = BytesMut::with_capacity(body.len() + 1);
    buf.put_slice(&body);
    buf.put_u8(FRAME_DELIMITER);
    Ok(buf.freeze())
}

/// Frame decoder for parsing incoming lines
#[derive(Debug)]
pub struct FrameDecoder {
    max_line_len: usize,
    /// Bytes already scanned for a terminator
    scanned: usize,
    /// Dropping the tail of an oversized line
    discarding: bool,
}

impl FrameDecoder {
    /// Create a new frame decoder
    pub fn new() -> Self {
        Self::with_max_line_len(DEFAULT_MAX_LINE_LEN)
    }

    /// Create a decoder with a custom line limit
    pub fn with_max_line_len(max_line_len: usize) -> Self {
        Self {
            max_line_len,
            scanned: 0,
            discarding: false,
        }
    }

    /// Decode one envelope from a buffer.
    ///
    /// Returns `Ok(None)` when the buffer holds no complete line yet. Errors
    /// consume the offending line so the next call starts on a fresh one.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Envelope>, WireError> {
        loop {
            let start = self.scanned.min(buf.len());
            let newline = buf[start..]
                .iter()
                .position(|b| *b == FRAME_DELIMITER)
                .map(|offset| start + offset);

            let Some(pos) = newline else {
                if buf.len() > self.max_line_len {
                    buf.clear();
                    self.scanned = 0;
                    if !self.discarding {
                        self.discarding = true;
                        return Err(WireError::Oversized {
                            limit: self.max_line_len,
                        });
                    }
                } else {
                    self.scanned = buf.len();
                }
                return Ok(None);
            };

            let line = buf.split_to(pos + 1);
            self.scanned = 0;

            if self.discarding {
                self.discarding = false;
                trace!("Dropped tail of oversized line ({} bytes)", line.len());
                continue;
            }

            let body = trim_line(&line[..pos]);
            if body.is_empty() {
                continue;
            }
            if body.len() > self.max_line_len {
                return Err(WireError::Oversized {
                    limit: self.max_line_len,
                });
            }

            let value: serde_json::Value = serde_json::from_slice(body)
                .map_err(|e| WireError::Malformed(e.to_string()))?;
            return Envelope::from_wire(value).map(Some);
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let start = line
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(line.len());
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &line[start..end]
}

//! Reassemble upstream `alt=sse` events from arbitrarily fragmented input.
//!
//! The transport may split an event anywhere, including inside a multi-byte
//! character or between the two halves of a `\r\n\r\n` terminator, so both
//! decoding and framing carry state across fragments.

const DATA_PREFIX: &str = "data: ";
const TERMINATORS: [&str; 3] = ["\n\n", "\r\r", "\r\n\r\n"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: String,
    /// Set on the unterminated remainder flushed at end of input.
    pub partial: bool,
}

impl Frame {
    fn complete(payload: &str) -> Self {
        Self {
            payload: payload.to_string(),
            partial: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct StreamFramer {
    buffer: String,
}

impl StreamFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment and return every event it completed, in order.
    pub fn push(&mut self, fragment: &str) -> Vec<Frame> {
        self.buffer.push_str(fragment);

        let mut frames = Vec::new();
        while let Some((payload_end, consumed)) = next_event(&self.buffer) {
            frames.push(Frame::complete(&self.buffer[DATA_PREFIX.len()..payload_end]));
            self.buffer.drain(..consumed);
        }
        frames
    }

    /// Whatever non-blank text is left once input ends.
    pub fn finish(&mut self) -> Option<Frame> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        if rest.is_empty() {
            return None;
        }
        tracing::debug!(len = rest.len(), "Stream ended on a partial frame");
        Some(Frame {
            payload: rest.to_string(),
            partial: true,
        })
    }
}

/// Locate a complete `data: <payload><terminator>` at the front of `buf`.
/// Returns the end of the payload and the length of the whole event.
fn next_event(buf: &str) -> Option<(usize, usize)> {
    let body = buf.strip_prefix(DATA_PREFIX)?;
    let line_end = DATA_PREFIX.len() + body.find(['\r', '\n'])?;
    let rest = &buf[line_end..];

    TERMINATORS
        .iter()
        .find(|t| rest.starts_with(**t))
        .map(|t| (line_end, line_end + t.len()))
}

/// Incremental UTF-8 decoding of a byte stream.
///
/// A multi-byte sequence cut by a chunk boundary is held back until its
/// remaining bytes arrive; bytes that can never form valid UTF-8 become
/// U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);

        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    /// Flush a truncated trailing sequence, if any.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

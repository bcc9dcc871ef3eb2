//! Byte stream to message framing.
//!
//! Each wire byte `b` decodes to the character with codepoint `b + 1`. A
//! message ends at a decoded codepoint of zero. The shift is deliberately
//! not taken modulo 256: byte `0xFF` decodes to U+0100, so no byte can ever
//! produce the terminator and [`Framer::push`] alone never completes a
//! message. The listener therefore uses [`Framer::decode_batch`] to turn
//! each receive batch into one message.

use crate::error::FrameError;

/// Decoded codepoint that terminates a message.
pub const TERMINATOR_CODEPOINT: u32 = 0;

/// Byte a runtime appends when it wants to terminate a message. Under the
/// unmodulated shift it decodes to U+0100 and does not terminate anything.
pub const WIRE_TERMINATOR: u8 = 0xFF;

#[inline]
pub fn decode_byte(byte: u8) -> u32 {
    u32::from(byte) + 1
}

#[inline]
fn decode_char(byte: u8) -> char {
    char::from_u32(decode_byte(byte)).unwrap_or(char::REPLACEMENT_CHARACTER)
}

/// Scan one message from the front of `bytes`.
///
/// Returns the decoded text and the number of bytes consumed (terminator
/// included) when a terminator was found, `None` otherwise.
pub fn extract_terminated(bytes: &[u8]) -> Option<(String, usize)> {
    let mut text = String::new();
    for (idx, &byte) in bytes.iter().enumerate() {
        if decode_byte(byte) == TERMINATOR_CODEPOINT {
            return Some((text, idx + 1));
        }
        text.push(decode_char(byte));
    }
    None
}

/// Decode bytes with no terminator handling.
pub fn decode_all(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| decode_char(b)).collect()
}

/// Runtime-side encoding: the inverse shift, optionally followed by
/// [`WIRE_TERMINATOR`].
pub fn encode_frame(message: &str, terminated: bool) -> Result<Vec<u8>, FrameError> {
    let mut out = Vec::with_capacity(message.len() + usize::from(terminated));
    for ch in message.chars() {
        let code = u32::from(ch);
        if code == 0 || code > 0x100 {
            return Err(FrameError::Unencodable(ch));
        }
        out.push((code - 1) as u8);
    }
    if terminated {
        out.push(WIRE_TERMINATOR);
    }
    Ok(out)
}

/// Incremental framer holding bytes that have not formed a message yet.
#[derive(Debug, Default, Clone)]
pub struct Framer {
    pending: Vec<u8>,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` and return every message that terminated. Whatever is
    /// left stays pending for the next call.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut messages = Vec::new();
        let mut offset = 0;
        while let Some((text, consumed)) = extract_terminated(&self.pending[offset..]) {
            messages.push(text);
            offset += consumed;
        }
        self.pending.drain(..offset);
        messages
    }

    /// Emit the pending bytes as one message, if any.
    pub fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let text = decode_all(&self.pending);
        self.pending.clear();
        Some(text)
    }

    /// `push` followed by `flush`: one receive batch in, all of it out.
    pub fn decode_batch(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut messages = self.push(bytes);
        messages.extend(self.flush());
        messages
    }

    pub fn remainder(&self) -> &[u8] {
        &self.pending
    }

    pub fn is_incomplete(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn reset(&mut self) {
        self.pending.clear();
    }
}

//! Carriage-return/line-feed framing for the plain ASCII channel.

use super::DecodeError;

/// Trailing `\r\n` appended to outgoing lines.
pub(crate) const OVERHEAD: usize = 2;

pub(crate) const TERMINATOR: &[u8; 2] = b"\r\n";

pub(crate) struct RnDecoder {
    count: usize,
    /// Overrun recovery: swallow everything up to the next line feed.
    discarding: bool,
}

impl RnDecoder {
    pub fn new() -> Self {
        Self {
            count: 0,
            discarding: false,
        }
    }

    pub fn feed(&mut self, byte: u8, out: &mut [u8]) -> Result<Option<usize>, DecodeError> {
        if self.discarding {
            if byte == b'\n' {
                self.discarding = false;
            }
            return Ok(None);
        }
        if byte == b'\n' {
            let count = self.count;
            self.count = 0;
            if count > 0 && out[count - 1] == b'\r' {
                return Ok(Some(count - 1));
            }
            // A line feed without its carriage return resets the buffer.
            return Err(DecodeError::IllegalSequence);
        }
        if self.count >= out.len() {
            self.count = 0;
            self.discarding = true;
            return Err(DecodeError::Overrun);
        }
        out[self.count] = byte;
        self.count += 1;
        Ok(None)
    }

    pub fn in_progress(&self) -> bool {
        self.count > 0 || self.discarding
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.discarding = false;
    }
}

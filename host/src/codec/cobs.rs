//! Consistent overhead byte stuffing, chunked for long frames.
//!
//! A message travels as one or more chunks of at most [`MAX_CHUNK`] payload
//! bytes. The first chunk opens with the `0x00` sync delimiter and a code
//! byte; every further chunk contributes only a code byte, the chunks being
//! separated by the `0xFF` continuation delimiter. The final chunk is closed
//! by `0x00`. Code bytes are the distance to the next stuffed zero plus one;
//! a chunk-filling run without a zero carries the code 254, which implies no
//! zero. This keeps both delimiters out of the stuffed payload.

use super::DecodeError;

/// Maximum payload bytes per chunk.
pub(crate) const MAX_CHUNK: usize = 253;

/// Head and tail bytes added to a single-chunk frame.
pub(crate) const OVERHEAD: usize = 3;

/// Final frame delimiter.
pub(crate) const DELIMITER: u8 = 0x00;

/// Inter-chunk delimiter of an extended message.
pub(crate) const CONTINUE: u8 = 0xFF;

const FULL_RUN: u8 = 254;

/// Stuff one chunk in place.
///
/// The chunk payload occupies `buf[payload..payload + len]`. The byte before
/// it becomes the first code byte and, on the first chunk, the byte before
/// that becomes the sync delimiter. Zeros inside the chunk become the
/// following code bytes. The byte at `buf[payload + len]` is overwritten with
/// the trailing delimiter; when more chunks follow it holds the next chunk's
/// first payload byte, which the caller must back up first.
///
/// Returns the wire range of the encoded chunk.
pub(crate) fn encode_chunk_in_place(
    buf: &mut [u8],
    payload: usize,
    len: usize,
    first: bool,
    more: bool,
) -> core::ops::Range<usize> {
    debug_assert!(len <= MAX_CHUNK);
    debug_assert!(payload >= 2);

    let mut code_slot = payload - 1;
    for i in payload..payload + len {
        if buf[i] == 0 {
            buf[code_slot] = (i - code_slot) as u8;
            code_slot = i;
        }
    }
    buf[code_slot] = (payload + len - code_slot) as u8;
    buf[payload + len] = if more { CONTINUE } else { DELIMITER };

    let start = if first {
        buf[payload - 2] = DELIMITER;
        payload - 2
    } else {
        payload - 1
    };
    start..payload + len + 1
}

/// Streaming decoder with `(code, count)` state.
pub(crate) struct CobsDecoder {
    /// Data bytes left in the current block; 0 means a code byte is due.
    block: u8,
    /// The current block carries the 254 code and implies no zero.
    full_run: bool,
    /// The finished block implies a stuffed zero once the next code arrives.
    pending_zero: bool,
    /// Bytes decoded so far.
    count: usize,
    /// Overrun recovery: swallow everything until the final delimiter.
    discarding: bool,
}

impl CobsDecoder {
    pub fn new() -> Self {
        Self {
            block: 0,
            full_run: false,
            pending_zero: false,
            count: 0,
            discarding: false,
        }
    }

    pub fn feed(&mut self, byte: u8, out: &mut [u8]) -> Result<Option<usize>, DecodeError> {
        if byte == DELIMITER {
            let len = self.count;
            let discarded = self.discarding;
            self.reset();
            return Ok(if len > 0 && !discarded { Some(len) } else { None });
        }
        if self.discarding {
            return Ok(None);
        }
        if self.block == 0 {
            if byte == CONTINUE {
                // Chunk boundary: the last block of a chunk never implies a
                // zero.
                self.pending_zero = false;
                return Ok(None);
            }
            if self.pending_zero {
                self.write(0, out)?;
                self.pending_zero = false;
            }
            self.block = byte - 1;
            self.full_run = byte == FULL_RUN;
            if self.block == 0 {
                self.pending_zero = !self.full_run;
            }
            return Ok(None);
        }
        self.write(byte, out)?;
        self.block -= 1;
        if self.block == 0 {
            self.pending_zero = !self.full_run;
        }
        Ok(None)
    }

    fn write(&mut self, byte: u8, out: &mut [u8]) -> Result<(), DecodeError> {
        if self.count >= out.len() {
            self.discarding = true;
            self.block = 0;
            self.full_run = false;
            self.pending_zero = false;
            self.count = 0;
            return Err(DecodeError::Overrun);
        }
        out[self.count] = byte;
        self.count += 1;
        Ok(())
    }

    pub fn in_progress(&self) -> bool {
        self.count > 0 || self.block > 0 || self.pending_zero || self.discarding
    }

    pub fn reset(&mut self) {
        self.block = 0;
        self.full_run = false;
        self.pending_zero = false;
        self.count = 0;
        self.discarding = false;
    }
}

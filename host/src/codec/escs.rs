//! Escape framing: `0x7E` delimits frames, `0x7D` escapes either special
//! byte by XOR-ing it with `0x20`.

use super::DecodeError;

pub(crate) const DELIMITER: u8 = 0x7E;
pub(crate) const ESCAPE: u8 = 0x7D;
const XOR: u8 = 0x20;

/// Fixed frame overhead: the two delimiters.
pub(crate) const OVERHEAD: usize = 2;

/// Encode a whole frame within one buffer: the payload sits in the upper
/// write area at `src`, the encoded frame grows from offset 0. Returns the
/// encoded length.
///
/// The write cursor can never catch up with the read cursor as long as
/// `len <= src - 2`, which the planner's write-high/encode-low layout
/// guarantees even at the worst-case 2x expansion.
pub(crate) fn encode_in_buffer(buf: &mut [u8], src: usize, len: usize) -> usize {
    debug_assert!(len + OVERHEAD <= src);
    let mut n = 0;
    buf[n] = DELIMITER;
    n += 1;
    for i in 0..len {
        let byte = buf[src + i];
        if byte == DELIMITER || byte == ESCAPE {
            buf[n] = ESCAPE;
            buf[n + 1] = byte ^ XOR;
            n += 2;
        } else {
            buf[n] = byte;
            n += 1;
        }
    }
    buf[n] = DELIMITER;
    n + 1
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    /// Waiting for an opening delimiter.
    Idle,
    InFrame,
    Escape,
}

pub(crate) struct EscsDecoder {
    state: State,
    count: usize,
}

impl EscsDecoder {
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            count: 0,
        }
    }

    pub fn feed(&mut self, byte: u8, out: &mut [u8]) -> Result<Option<usize>, DecodeError> {
        if byte == DELIMITER {
            // Finalize (or begin). A delimiter also closes a dangling escape.
            let len = self.count;
            self.state = State::InFrame;
            self.count = 0;
            return Ok(if len > 0 { Some(len) } else { None });
        }
        match self.state {
            State::Idle => Ok(None),
            State::InFrame => {
                if byte == ESCAPE {
                    self.state = State::Escape;
                    Ok(None)
                } else {
                    self.write(byte, out)
                }
            }
            State::Escape => {
                self.state = State::InFrame;
                self.write(byte ^ XOR, out)
            }
        }
    }

    fn write(&mut self, byte: u8, out: &mut [u8]) -> Result<Option<usize>, DecodeError> {
        if self.count >= out.len() {
            self.state = State::Idle;
            self.count = 0;
            return Err(DecodeError::Overrun);
        }
        out[self.count] = byte;
        self.count += 1;
        Ok(None)
    }

    pub fn in_progress(&self) -> bool {
        self.count > 0 || self.state == State::Escape
    }

    pub fn reset(&mut self) {
        self.state = State::Idle;
        self.count = 0;
    }
}

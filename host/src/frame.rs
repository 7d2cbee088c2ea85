//! Transmit frame bookkeeping.

use alloc::vec::Vec;

/// One transmit buffer (strobe or response) together with the cursors the
/// scheduler and pump advance across ticks.
pub(crate) struct DataFrame {
    pub buf: Vec<u8>,
    /// Tick-granularity period countdown.
    pub countdown: u16,
    /// Byte displaced by the trailing delimiter of the previous COBS chunk.
    pub cobs_backup: u8,
    /// Strobe: a snapshot was captured this cycle. Response: length of a
    /// decoded command awaiting interpretation.
    pub valid: u16,
    /// Payload offset of the COBS chunk currently in flight.
    pub chunk: usize,
    /// The current COBS chunk is already stuffed in place (the transport
    /// returned busy on a previous tick).
    pub chunk_encoded: bool,
    /// Wire offset of the next send for unchunked encodings.
    pub head: usize,
    /// Bytes of the current transmission not yet accepted by the transport:
    /// payload bytes under COBS, wire bytes otherwise.
    pub remaining: usize,
    /// Payload capacity.
    pub bytes_max: usize,
    /// Current payload length, codec prefix excluded.
    pub bytes_total: usize,
    /// Payload start offset inside `buf` (COBS header space or the ESCS
    /// upper-half write area).
    pub prefix: usize,
    /// The buffer already holds wire bytes: a raw advertisement, an RN line,
    /// or the encoded ESCS lower half.
    pub wire_ready: bool,
}

impl DataFrame {
    pub fn unallocated() -> Self {
        Self {
            buf: Vec::new(),
            countdown: 0,
            cobs_backup: 0,
            valid: 0,
            chunk: 0,
            chunk_encoded: false,
            head: 0,
            remaining: 0,
            bytes_max: 0,
            bytes_total: 0,
            prefix: 0,
            wire_ready: false,
        }
    }

    /// No transmission in flight.
    pub fn idle(&self) -> bool {
        self.remaining == 0
    }

    /// The payload area of the buffer.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let start = self.prefix;
        let end = start + self.bytes_max;
        &mut self.buf[start..end]
    }

    /// Arm a transmission of `wire_len` already-encoded bytes at the buffer
    /// start.
    pub fn arm_wire(&mut self, wire_len: usize) {
        self.head = 0;
        self.remaining = wire_len;
        self.wire_ready = true;
        self.chunk = 0;
        self.chunk_encoded = false;
    }

    /// Arm a chunked COBS transmission of the current payload.
    pub fn arm_chunked(&mut self) {
        self.head = 0;
        self.remaining = self.bytes_total;
        self.wire_ready = false;
        self.chunk = 0;
        self.chunk_encoded = false;
    }

    /// Drop whatever is in flight. `valid` is left alone: on the response
    /// frame it carries the pending-command length, which outlives any
    /// transmission.
    pub fn cancel(&mut self) {
        self.remaining = 0;
        self.head = 0;
        self.chunk = 0;
        self.chunk_encoded = false;
        self.wire_ready = false;
    }
}

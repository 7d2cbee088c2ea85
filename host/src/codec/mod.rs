//! Byte-stuffing and line framing codecs with streaming decoders.
//!
//! Encoders run over the transmit frames in place (COBS) or into the send
//! half of a double buffer (ESCS). Decoders are fed one byte at a time from
//! the receive hook and assemble at most one frame in the command buffer.

pub(crate) mod cobs;
pub(crate) mod escs;
pub(crate) mod rn;

use crate::config::CommandEncoding;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum DecodeError {
    /// The decoded frame did not fit the destination buffer.
    Overrun,
    /// The byte stream violated the framing rules.
    IllegalSequence,
}

/// The inline command decoder, selected once at construction.
pub(crate) enum Decoder {
    Rn(rn::RnDecoder),
    Cobs(cobs::CobsDecoder),
    Escs(escs::EscsDecoder),
}

impl Decoder {
    pub fn new(encoding: CommandEncoding) -> Self {
        match encoding {
            CommandEncoding::Rn => Decoder::Rn(rn::RnDecoder::new()),
            CommandEncoding::Cobs => Decoder::Cobs(cobs::CobsDecoder::new()),
            CommandEncoding::Escs => Decoder::Escs(escs::EscsDecoder::new()),
        }
    }

    /// Feed one received byte. `Ok(Some(len))` publishes a complete frame of
    /// `len` bytes in `out`; errors abandon the frame in progress.
    pub fn feed(&mut self, byte: u8, out: &mut [u8]) -> Result<Option<usize>, DecodeError> {
        match self {
            Decoder::Rn(d) => d.feed(byte, out),
            Decoder::Cobs(d) => d.feed(byte, out),
            Decoder::Escs(d) => d.feed(byte, out),
        }
    }

    /// True while a partial frame sits in the decoder. Drives the command
    /// timeout.
    pub fn in_progress(&self) -> bool {
        match self {
            Decoder::Rn(d) => d.in_progress(),
            Decoder::Cobs(d) => d.in_progress(),
            Decoder::Escs(d) => d.in_progress(),
        }
    }

    pub fn reset(&mut self) {
        match self {
            Decoder::Rn(d) => d.reset(),
            Decoder::Cobs(d) => d.reset(),
            Decoder::Escs(d) => d.reset(),
        }
    }
}

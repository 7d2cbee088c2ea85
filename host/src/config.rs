//! Host configuration.
//!
//! The original firmware fixes all of this at compile time; here the same
//! switches form one value that is validated once when the host is built.
//! Invalid combinations are rejected up front so the hot path never has to
//! re-check them.

use bitfield::bitfield;

/// Framing applied to commands and replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandEncoding {
    /// `\r\n` terminated lines, ASCII only.
    Rn,
    /// Consistent overhead byte stuffing, `0x00` delimited.
    Cobs,
    /// `0x7D`/`0x7E` escape framing.
    Escs,
}

/// Framing applied to strobes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StrobeEncoding {
    /// Raw bytes, no framing.
    None,
    Cobs,
    Escs,
}

/// Payload representation for commands and replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Processing {
    Ascii,
    MsgPack,
}

/// Strobe membership policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StrobeDynamics {
    /// Every enabled cell is sampled every cycle.
    Static,
    /// Cells carry per-cell update rates; a mask prefix names the cells
    /// present in each strobe.
    Dynamic,
}

/// Truncation width of the appended CRC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CrcWidth {
    One = 1,
    Two = 2,
    Four = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    TickPeriod,
    CommandBufferSize,
    ResponseBufferSize,
    StrobePeriodBounds,
    CommandTimeout,
    ResponseLatency,
    MaxFrameSize,
    Baudrate,
    MemoryAlign,
    /// RN commands require ASCII processing, a raw strobe and no command CRC.
    RnConstraint,
    /// A stuffed strobe must share the command encoding.
    EncodingMismatch,
    /// Dynamic strobing requires a stuffed strobe.
    DynamicNeedsStuffing,
}

bitfield! {
    /// The 32-bit protocol info word advertised in the signature and
    /// returned by `GetProtocolInfo`. The layout is part of the protocol.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct ProtocolInfo(u32);
    impl Debug;
    pub encoding, set_encoding: 1, 0;
    pub encoding_match, set_encoding_match: 2;
    pub msgpack, set_msgpack: 3;
    pub dynamic, set_dynamic: 4;
    /// CRC width exponent: 0 -> 1 byte, 1 -> 2, 2 -> 4.
    pub crc_width_exp, set_crc_width_exp: 6, 5;
    pub command_crc, set_command_crc: 7;
    pub strobe_crc, set_strobe_crc: 8;
    pub little_endian, set_little_endian: 9;
    /// Command buffer size in 4-byte units.
    pub command_buffer_quads, set_command_buffer_quads: 15, 10;
    /// Response buffer size in 4-byte units.
    pub response_buffer_quads, set_response_buffer_quads: 23, 16;
    /// Maximum frame size in 256-byte units.
    pub frame_size_pages, set_frame_size_pages: 31, 24;
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    /// Scheduler granularity in milliseconds, 1..=249.
    pub tick_period_ms: u8,
    /// Decoded command capacity in bytes, 16..=64.
    pub command_buffer_size: u16,
    /// Reply payload capacity in bytes, 32..=256.
    pub response_buffer_size: u16,
    pub strobe_period_min_ticks: u16,
    pub strobe_period_max_ticks: u16,
    /// Ticks of receive inactivity before a partial command is discarded.
    pub command_timeout_ticks: u16,
    /// Handler-reaction margin added to the reported roundtrip latency.
    pub response_latency_ticks: u16,
    pub command_encoding: CommandEncoding,
    pub strobe_encoding: StrobeEncoding,
    pub processing: Processing,
    pub strobe_dynamics: StrobeDynamics,
    pub crc_width: CrcWidth,
    pub command_crc: bool,
    pub strobe_crc: bool,
    /// Transmit chunk cap for unstuffed frames; a multiple of 256.
    pub max_frame_size: u16,
    /// Used to derive the cycle margin and roundtrip latency figures.
    pub baudrate: u32,
    pub little_endian: bool,
    /// Whether the target tolerates unaligned loads in the sampler.
    pub unaligned_access: bool,
    /// Buffer size rounding, a power of two.
    pub memory_align: u8,
    /// The application builds strobe payloads itself via `submit_strobe`;
    /// cells may then be registered without backing memory.
    pub external_strobe: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tick_period_ms: 10,
            command_buffer_size: 64,
            response_buffer_size: 128,
            strobe_period_min_ticks: 1,
            strobe_period_max_ticks: 1000,
            command_timeout_ticks: 10,
            response_latency_ticks: 2,
            command_encoding: CommandEncoding::Rn,
            strobe_encoding: StrobeEncoding::None,
            processing: Processing::Ascii,
            strobe_dynamics: StrobeDynamics::Static,
            crc_width: CrcWidth::Two,
            command_crc: false,
            strobe_crc: false,
            max_frame_size: 256,
            baudrate: 115_200,
            little_endian: cfg!(target_endian = "little"),
            unaligned_access: true,
            memory_align: 4,
            external_strobe: false,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=249).contains(&self.tick_period_ms) {
            return Err(ConfigError::TickPeriod);
        }
        if !(16..=64).contains(&self.command_buffer_size) {
            return Err(ConfigError::CommandBufferSize);
        }
        if !(32..=256).contains(&self.response_buffer_size) {
            return Err(ConfigError::ResponseBufferSize);
        }
        if self.strobe_period_min_ticks == 0
            || self.strobe_period_min_ticks > self.strobe_period_max_ticks
        {
            return Err(ConfigError::StrobePeriodBounds);
        }
        if self.command_timeout_ticks == 0 {
            return Err(ConfigError::CommandTimeout);
        }
        if self.response_latency_ticks == 0 {
            return Err(ConfigError::ResponseLatency);
        }
        if self.max_frame_size == 0 || self.max_frame_size % 256 != 0 {
            return Err(ConfigError::MaxFrameSize);
        }
        if self.baudrate == 0 {
            return Err(ConfigError::Baudrate);
        }
        if self.memory_align == 0 || !self.memory_align.is_power_of_two() {
            return Err(ConfigError::MemoryAlign);
        }
        if self.command_encoding == CommandEncoding::Rn
            && (self.processing != Processing::Ascii
                || self.strobe_encoding != StrobeEncoding::None
                || self.command_crc)
        {
            return Err(ConfigError::RnConstraint);
        }
        let stuffed_match = match (self.command_encoding, self.strobe_encoding) {
            (_, StrobeEncoding::None) => true,
            (CommandEncoding::Cobs, StrobeEncoding::Cobs) => true,
            (CommandEncoding::Escs, StrobeEncoding::Escs) => true,
            _ => false,
        };
        if !stuffed_match {
            return Err(ConfigError::EncodingMismatch);
        }
        if self.strobe_dynamics == StrobeDynamics::Dynamic
            && self.strobe_encoding == StrobeEncoding::None
        {
            return Err(ConfigError::DynamicNeedsStuffing);
        }
        Ok(())
    }

    /// True when the strobe path stuffs bytes and therefore needs the
    /// MessagePack disambiguator prefix.
    pub(crate) fn strobe_stuffed(&self) -> bool {
        self.strobe_encoding != StrobeEncoding::None
    }

    pub(crate) fn encodings_match(&self) -> bool {
        matches!(
            (self.command_encoding, self.strobe_encoding),
            (CommandEncoding::Rn, StrobeEncoding::None)
                | (CommandEncoding::Cobs, StrobeEncoding::Cobs)
                | (CommandEncoding::Escs, StrobeEncoding::Escs)
        )
    }

    /// Replies may share the wire with an active strobe only when commands
    /// are byte-stuffed.
    pub(crate) fn interleaving(&self) -> bool {
        self.command_encoding != CommandEncoding::Rn
    }

    /// The advertisement cadence is fixed at 250 ms worth of ticks.
    pub(crate) fn advertise_period_ticks(&self) -> u16 {
        let ticks = 250 / self.tick_period_ms as u16;
        ticks.max(1)
    }

    pub(crate) fn crc_bytes(&self) -> usize {
        self.crc_width as usize
    }

    pub fn protocol_info(&self) -> ProtocolInfo {
        let mut info = ProtocolInfo(0);
        info.set_encoding(match self.command_encoding {
            CommandEncoding::Rn => 0,
            CommandEncoding::Cobs => 1,
            CommandEncoding::Escs => 2,
        });
        info.set_encoding_match(self.encodings_match());
        info.set_msgpack(self.processing == Processing::MsgPack);
        info.set_dynamic(self.strobe_dynamics == StrobeDynamics::Dynamic);
        info.set_crc_width_exp(match self.crc_width {
            CrcWidth::One => 0,
            CrcWidth::Two => 1,
            CrcWidth::Four => 2,
        });
        info.set_command_crc(self.command_crc);
        info.set_strobe_crc(self.strobe_crc);
        info.set_little_endian(self.little_endian);
        info.set_command_buffer_quads(self.command_buffer_size as u32 / 4);
        info.set_response_buffer_quads(self.response_buffer_size as u32 / 4);
        info.set_frame_size_pages(self.max_frame_size as u32 / 256);
        info
    }
}

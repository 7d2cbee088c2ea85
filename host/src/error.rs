use num_traits::FromPrimitive;

/// Protocol error codes carried in the trailing field of every reply.
///
/// The numeric values are the errno numbers the original firmware reports and
/// are part of the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    Io = 5,
    PermissionDenied = 13,
    BadAddress = 14,
    Busy = 16,
    InvalidArgument = 22,
    NoSpace = 28,
    NoData = 61,
    Overflow = 75,
    IllegalSequence = 84,
    NotSupported = 95,
    Cancelled = 125,
}

impl Error {
    /// The on-wire code. `0` is success and has no `Error` value.
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::from_u8(code)
    }
}

/// Bootstrap-time registration failures. These are fatal: the host cannot be
/// brought up with a partially registered data space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RegisterError {
    /// The 255-cell index space is exhausted.
    TooManyCells,
    /// A cell without backing memory was registered without opting in to an
    /// external strobe source.
    NullPointer,
    /// `register_mem` has already run; the data space is sealed.
    Sealed,
    /// Buffer allocation failed.
    OutOfMemory,
}

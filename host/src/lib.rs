#![cfg_attr(not(test), no_std)]

// This mod MUST go first, so that the others see its macros.
#[macro_use]
mod fmt;

mod cell;
mod codec;
pub mod config;
mod crc;
mod error;
mod frame;
mod host;
mod interp;
mod planner;
mod sampler;
mod space;
pub mod traits;
mod wire;

extern crate alloc;

#[macro_use]
extern crate num_derive;

pub use cell::{CellData, CellKind, CellType, OnChange, UpdateRate};
pub use config::{
    CommandEncoding, Config, ConfigError, CrcWidth, Processing, ProtocolInfo, StrobeDynamics,
    StrobeEncoding,
};
pub use crc::{crc16_ccitt, xor_checksum, CrcFn};
pub use error::{Error, RegisterError};
pub use host::Host;
pub use traits::{BlockingLink, Hooks, IoLink, Link, NoHooks, SendOutcome};

/// Protocol version reported by `GetProtocolInfo`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Fixed prefix of the periodic advertisement signature.
pub const SIGNATURE: &[u8; 10] = b"lassoHost/";

/// Upper bound on registered data cells; cell indices travel as one byte.
pub const MAX_CELLS: usize = 255;

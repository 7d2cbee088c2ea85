//! Typed value serialization for the command channel.
//!
//! Two representations exist: comma-separated ASCII fields on the RN channel
//! and a small MessagePack subset on stuffed channels. Strobe payloads are
//! raw host memory and never pass through these formatters.

pub(crate) mod ascii;
pub(crate) mod msgpack;

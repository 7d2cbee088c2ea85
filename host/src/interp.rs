//! Command interpretation and reply building.
//!
//! One decoded command frame at a time is parsed, validated, dispatched and
//! answered. GET opcodes are lowercase ASCII, SET opcodes uppercase; `0xC1`
//! frames bypass the interpreter and go to the control hook.

use core::fmt::Write as _;
use core::mem;

use heapless::Vec as HVec;

use crate::cell::{CellKind, DataCell};
use crate::codec::{escs, rn};
use crate::config::{CommandEncoding, Processing};
use crate::crc;
use crate::error::Error;
use crate::host::Host;
use crate::traits::{Hooks, Link};
use crate::wire::{ascii, msgpack};
use crate::VERSION;

/// Reserved first byte of control passthrough frames, identical to the
/// strobe disambiguator: it is not a valid MessagePack head and not an ASCII
/// opcode.
pub(crate) const CONTROL: u8 = 0xC1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Opcode {
    GetProtocolInfo = b'i' as isize,
    GetTimingInfo = b't' as isize,
    GetDataCellCount = b'n' as isize,
    GetDataCellParams = b'p' as isize,
    GetDataCellValue = b'v' as isize,
    SetAdvertise = b'A' as isize,
    SetStrobePeriod = b'P' as isize,
    SetDataCellStrobe = b'S' as isize,
    SetDataCellValue = b'V' as isize,
    SetDataSpaceStrobe = b'W' as isize,
}

impl Opcode {
    pub fn from_u8(byte: u8) -> Option<Self> {
        Some(match byte {
            b'i' => Opcode::GetProtocolInfo,
            b't' => Opcode::GetTimingInfo,
            b'n' => Opcode::GetDataCellCount,
            b'p' => Opcode::GetDataCellParams,
            b'v' => Opcode::GetDataCellValue,
            b'A' => Opcode::SetAdvertise,
            b'P' => Opcode::SetStrobePeriod,
            b'S' => Opcode::SetDataCellStrobe,
            b'V' => Opcode::SetDataCellValue,
            b'W' => Opcode::SetDataSpaceStrobe,
            _ => return None,
        })
    }

    pub fn is_set(self) -> bool {
        (self as u8).is_ascii_uppercase()
    }
}

/// Parsed argument stream, one variant per processing mode.
enum Args<'a> {
    Ascii(ascii::Fields<'a>),
    MsgPack(msgpack::Reader<'a>),
}

impl<'a> Args<'a> {
    fn u16(&mut self) -> Result<u16, Error> {
        match self {
            Args::Ascii(fields) => fields
                .next()
                .and_then(|f| f.parse().ok())
                .ok_or(Error::InvalidArgument),
            Args::MsgPack(reader) => {
                let value = reader.uint()?;
                u16::try_from(value).map_err(|_| Error::InvalidArgument)
            }
        }
    }

    fn u8(&mut self) -> Result<u8, Error> {
        let value = self.u16()?;
        u8::try_from(value).map_err(|_| Error::InvalidArgument)
    }

    fn boolean(&mut self) -> Result<bool, Error> {
        match self {
            Args::Ascii(fields) => match fields.next() {
                Some("0") => Ok(false),
                Some("1") => Ok(true),
                _ => Err(Error::InvalidArgument),
            },
            Args::MsgPack(reader) => reader.boolean(),
        }
    }
}

/// Reply assembly over the response payload area.
enum ReplyWriter<'a> {
    Ascii {
        writer: ascii::SliceWriter<'a>,
        opcode: u8,
    },
    MsgPack {
        writer: msgpack::Writer<'a>,
        /// Offset of the one-byte fixarray header patched on `end`.
        patch: usize,
        fields: u8,
    },
}

impl<'a> ReplyWriter<'a> {
    fn new(processing: Processing, buf: &'a mut [u8], opcode: u8) -> Result<Self, Error> {
        match processing {
            Processing::Ascii => {
                let mut writer = ascii::SliceWriter::new(buf);
                writer.push(opcode).map_err(|_| Error::NoSpace)?;
                Ok(ReplyWriter::Ascii { writer, opcode })
            }
            Processing::MsgPack => {
                let mut writer = msgpack::Writer::new(buf);
                writer.array(3)?;
                writer.uint(opcode as u64)?;
                let patch = writer.pos();
                writer.array(0)?;
                Ok(ReplyWriter::MsgPack {
                    writer,
                    patch,
                    fields: 0,
                })
            }
        }
    }

    fn u64(&mut self, value: u64) -> Result<(), Error> {
        match self {
            ReplyWriter::Ascii { writer, .. } => {
                write!(writer, ",{value}").map_err(|_| Error::NoSpace)
            }
            ReplyWriter::MsgPack { writer, fields, .. } => {
                *fields += 1;
                writer.uint(value)
            }
        }
    }

    fn u32(&mut self, value: u32) -> Result<(), Error> {
        self.u64(value as u64)
    }

    fn i64(&mut self, value: i64) -> Result<(), Error> {
        match self {
            ReplyWriter::Ascii { writer, .. } => {
                write!(writer, ",{value}").map_err(|_| Error::NoSpace)
            }
            ReplyWriter::MsgPack { writer, fields, .. } => {
                *fields += 1;
                writer.int(value)
            }
        }
    }

    fn f32(&mut self, value: f32) -> Result<(), Error> {
        match self {
            ReplyWriter::Ascii { writer, .. } => {
                write!(writer, ",{value:.6}").map_err(|_| Error::NoSpace)
            }
            ReplyWriter::MsgPack { writer, fields, .. } => {
                *fields += 1;
                writer.f32(value)
            }
        }
    }

    fn f64(&mut self, value: f64) -> Result<(), Error> {
        match self {
            ReplyWriter::Ascii { writer, .. } => {
                write!(writer, ",{value:.6}").map_err(|_| Error::NoSpace)
            }
            // Doubles do not travel in MessagePack mode.
            ReplyWriter::MsgPack { .. } => Err(Error::NotSupported),
        }
    }

    fn str(&mut self, value: &str) -> Result<(), Error> {
        match self {
            ReplyWriter::Ascii { writer, .. } => {
                write!(writer, ",{value}").map_err(|_| Error::NoSpace)
            }
            ReplyWriter::MsgPack { writer, fields, .. } => {
                *fields += 1;
                writer.str(value)
            }
        }
    }

    /// Drop any partially written payload, keeping the opcode.
    fn reset_payload(&mut self) {
        match self {
            ReplyWriter::Ascii { writer, opcode } => {
                writer.rewind();
                let _ = writer.push(*opcode);
            }
            ReplyWriter::MsgPack {
                writer,
                patch,
                fields,
            } => {
                writer.rewind_to(*patch + 1);
                *fields = 0;
            }
        }
    }

    /// Terminate with the error code and return the payload length.
    fn end(self, error: u8) -> Result<usize, Error> {
        match self {
            ReplyWriter::Ascii { mut writer, .. } => {
                write!(writer, ",{error}").map_err(|_| Error::NoSpace)?;
                Ok(writer.pos())
            }
            ReplyWriter::MsgPack {
                mut writer,
                patch,
                fields,
            } => {
                writer.patch(patch, 0x90 | fields.min(15));
                writer.int(error as i64)?;
                Ok(writer.pos())
            }
        }
    }
}

/// What happened to the reply.
enum Disposition {
    Reply,
    Silent,
}

impl<L: Link, H: Hooks> Host<L, H> {
    /// Interpret the decoded command of `len` bytes sitting in the command
    /// buffer and, unless policy says otherwise, arm the response frame.
    pub(crate) fn interpret(&mut self, len: usize) {
        let cmd = mem::take(&mut self.cmd);
        let mut rbuf = mem::take(&mut self.response.buf);

        let prefix = self.response.prefix;
        let max = self.response.bytes_max;
        let crc_bytes = if self.cfg.command_crc {
            self.cfg.crc_bytes()
        } else {
            0
        };
        let payload_cap = max - crc_bytes;

        let total = self.run_command(&cmd[..len], &mut rbuf[prefix..prefix + payload_cap]);

        self.cmd = cmd;
        self.response.buf = rbuf;

        if let Some(total) = total {
            self.finish_response(total);
        }
    }

    /// Parse, dispatch, build the reply payload. Returns the payload length
    /// to transmit, or `None` when the reply is suppressed.
    fn run_command(&mut self, cmd: &[u8], payload: &mut [u8]) -> Option<usize> {
        let cmd = match self.strip_command_crc(cmd) {
            Some(cmd) => cmd,
            None => {
                warn!("command crc mismatch");
                return None;
            }
        };
        if cmd.is_empty() {
            return None;
        }
        if cmd[0] == CONTROL {
            self.hooks.on_control(&cmd[1..]);
            return None;
        }

        let (opcode_byte, args) = match self.parse_command(cmd) {
            Some(parsed) => parsed,
            None => {
                warn!("malformed command frame");
                return None;
            }
        };

        // With a non-interleaving encoding, replies cannot share the wire
        // with an active strobe: GETs are ignored outright, SETs run without
        // a reply.
        let suppress_all = self.strobing && !self.cfg.interleaving();

        let opcode = match Opcode::from_u8(opcode_byte) {
            Some(opcode) => opcode,
            None => {
                if suppress_all {
                    return None;
                }
                return self.tiny_reply(payload, opcode_byte, Error::NotSupported);
            }
        };

        if suppress_all && !opcode.is_set() {
            return None;
        }

        let mut writer = match ReplyWriter::new(self.cfg.processing, payload, opcode_byte) {
            Ok(writer) => writer,
            Err(_) => return None,
        };

        let outcome = self.dispatch(opcode, args, &mut writer);

        if suppress_all {
            return None;
        }
        match outcome {
            Ok(Disposition::Silent) => None,
            Ok(Disposition::Reply) => writer.end(0).ok(),
            Err(error) => {
                // A failed handler may have written part of a payload;
                // restart as the tiny [opcode, error] reply.
                writer.reset_payload();
                writer.end(error.code()).ok()
            }
        }
    }

    fn tiny_reply(&self, payload: &mut [u8], opcode: u8, error: Error) -> Option<usize> {
        let writer = ReplyWriter::new(self.cfg.processing, payload, opcode).ok()?;
        writer.end(error.code()).ok()
    }

    fn strip_command_crc<'a>(&self, cmd: &'a [u8]) -> Option<&'a [u8]> {
        if !self.cfg.command_crc {
            return Some(cmd);
        }
        if !crc::verify(self.crc, cmd, self.cfg.crc_width) {
            return None;
        }
        Some(&cmd[..cmd.len() - self.cfg.crc_bytes()])
    }

    fn parse_command<'a>(&self, cmd: &'a [u8]) -> Option<(u8, Args<'a>)> {
        match self.cfg.processing {
            Processing::Ascii => {
                let (opcode, fields) = ascii::split_command(cmd)?;
                Some((opcode, Args::Ascii(fields)))
            }
            Processing::MsgPack => {
                let mut reader = msgpack::Reader::new(cmd);
                let arity = reader.array().ok()?;
                if !(1..=2).contains(&arity) {
                    return None;
                }
                let opcode = u8::try_from(reader.uint().ok()?).ok()?;
                if arity == 2 {
                    reader.array().ok()?;
                }
                Some((opcode, Args::MsgPack(reader)))
            }
        }
    }

    fn dispatch(
        &mut self,
        opcode: Opcode,
        mut args: Args<'_>,
        writer: &mut ReplyWriter<'_>,
    ) -> Result<Disposition, Error> {
        match opcode {
            Opcode::GetProtocolInfo => {
                writer.u32(self.cfg.protocol_info().0)?;
                writer.str(VERSION)?;
                Ok(Disposition::Reply)
            }
            Opcode::GetTimingInfo => {
                writer.u32(self.cfg.tick_period_ms as u32)?;
                writer.u32(self.cfg.command_timeout_ticks as u32)?;
                writer.u32(self.roundtrip_latency_ticks() as u32)?;
                writer.u32(self.cfg.strobe_period_min_ticks as u32)?;
                writer.u32(self.cfg.strobe_period_max_ticks as u32)?;
                writer.u32(self.strobe_period as u32)?;
                writer.f32(self.cycle_margin())?;
                writer.u32(self.overdrive as u32)?;
                Ok(Disposition::Reply)
            }
            Opcode::GetDataCellCount => {
                writer.u32(self.space.count() as u32)?;
                Ok(Disposition::Reply)
            }
            Opcode::GetDataCellParams => {
                let index = args.u8()?;
                let (cell, offset) = self.space.seek(index).ok_or(Error::BadAddress)?;
                writer.str(cell.name)?;
                writer.u32(cell.ty.reported() as u32)?;
                writer.u32(cell.count as u32)?;
                writer.str(cell.unit)?;
                writer.u32(cell.rate.reload as u32)?;
                writer.u32(offset as u32)?;
                Ok(Disposition::Reply)
            }
            Opcode::GetDataCellValue => {
                let index = args.u8()?;
                let cell = self.space.get(index).ok_or(Error::BadAddress)?;
                write_cell_value(writer, cell)?;
                Ok(Disposition::Reply)
            }
            Opcode::SetAdvertise => {
                self.enter_advertise();
                Ok(Disposition::Silent)
            }
            Opcode::SetStrobePeriod => {
                let requested = args.u16()?;
                if !(self.cfg.strobe_period_min_ticks..=self.cfg.strobe_period_max_ticks)
                    .contains(&requested)
                {
                    return Err(Error::InvalidArgument);
                }
                let applied = self.hooks.on_period_change(requested);
                self.strobe_period = applied;
                if self.strobe.countdown > applied {
                    self.strobe.countdown = applied;
                }
                if self.advertise {
                    // First client interaction drops the host out of
                    // advertising, silently.
                    self.advertise = false;
                    return Ok(Disposition::Silent);
                }
                Ok(Disposition::Reply)
            }
            Opcode::SetDataCellStrobe => {
                let index = args.u8()?;
                let enable = args.boolean()?;
                if self.strobing {
                    return Err(Error::Busy);
                }
                self.space.set_enabled(index, enable)?;
                self.strobe.bytes_total = self.strobe_fixed + self.space.data_enabled;
                Ok(Disposition::Reply)
            }
            Opcode::SetDataCellValue => {
                let index = args.u8()?;
                let cell = self.space.get(index).ok_or(Error::BadAddress)?;
                if !cell.ty.writeable() {
                    return Err(Error::PermissionDenied);
                }
                let staged = stage_value(&mut args, cell)?;
                if let Some(hook) = cell.on_change {
                    if !hook(&staged) {
                        return Ok(Disposition::Reply);
                    }
                }
                if let Some(ptr) = cell.ptr {
                    unsafe {
                        core::ptr::copy_nonoverlapping(staged.as_ptr(), ptr.as_ptr(), staged.len())
                    };
                }
                Ok(Disposition::Reply)
            }
            Opcode::SetDataSpaceStrobe => {
                let enable = args.boolean()?;
                if enable {
                    if self.advertise {
                        // Cancel any in-flight advertisement before it keeps
                        // the wire busy.
                        self.advertise = false;
                        self.strobe.cancel();
                    }
                    if !self.strobing {
                        self.strobing = true;
                        self.strobe.countdown = 1;
                        self.hooks.on_activation(true);
                    }
                    // A reply would collide with the strobes about to start
                    // on a non-interleaving channel.
                    if !self.cfg.interleaving() {
                        return Ok(Disposition::Silent);
                    }
                } else {
                    self.advertise = false;
                    if self.strobing {
                        self.strobing = false;
                        self.hooks.on_activation(false);
                    }
                }
                Ok(Disposition::Reply)
            }
        }
    }

    /// Append the CRC, frame the payload for the wire and arm transmission.
    fn finish_response(&mut self, mut total: usize) {
        let prefix = self.response.prefix;
        if self.cfg.command_crc {
            let buf = &mut self.response.buf[prefix..];
            total = crc::append(self.crc, buf, total, self.cfg.crc_width);
        }
        self.response.bytes_total = total;
        match self.cfg.command_encoding {
            CommandEncoding::Rn => {
                self.response.buf[prefix + total..prefix + total + 2]
                    .copy_from_slice(rn::TERMINATOR);
                self.response.arm_wire(total + 2);
            }
            CommandEncoding::Cobs => {
                self.response.arm_chunked();
            }
            CommandEncoding::Escs => {
                let wire = escs::encode_in_buffer(&mut self.response.buf, prefix, total);
                self.response.arm_wire(wire);
            }
        }
    }
}

/// Read a cell's current value into the reply.
fn write_cell_value(writer: &mut ReplyWriter<'_>, cell: &DataCell) -> Result<(), Error> {
    let kind = cell.ty.kind().ok_or(Error::NotSupported)?;
    let ptr = cell.ptr.ok_or(Error::NoData)?;
    let width = cell.ty.byte_width();
    let count = cell.count as usize;

    if kind == CellKind::Char {
        let bytes = unsafe { core::slice::from_raw_parts(ptr.as_ptr(), count) };
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(count);
        let text = core::str::from_utf8(&bytes[..end]).map_err(|_| Error::IllegalSequence)?;
        return writer.str(text);
    }

    for i in 0..count {
        unsafe {
            let base = ptr.as_ptr();
            match (kind, width) {
                (CellKind::Bool, _) => writer.u32((base.add(i).read() != 0) as u32)?,
                (CellKind::Uint, 1) => writer.u64(base.add(i).read() as u64)?,
                (CellKind::Uint, 2) => writer.u64(base.cast::<u16>().add(i).read() as u64)?,
                (CellKind::Uint, 4) => writer.u64(base.cast::<u32>().add(i).read() as u64)?,
                (CellKind::Uint, _) => writer.u64(base.cast::<u64>().add(i).read())?,
                (CellKind::Int, 1) => writer.i64(base.cast::<i8>().add(i).read() as i64)?,
                (CellKind::Int, 2) => writer.i64(base.cast::<i16>().add(i).read() as i64)?,
                (CellKind::Int, 4) => writer.i64(base.cast::<i32>().add(i).read() as i64)?,
                (CellKind::Int, _) => writer.i64(base.cast::<i64>().add(i).read())?,
                (CellKind::Float, 4) => writer.f32(base.cast::<f32>().add(i).read())?,
                (CellKind::Float, _) => writer.f64(base.cast::<f64>().add(i).read())?,
                (CellKind::Char, _) => unreachable!(),
            }
        }
    }
    Ok(())
}

/// Decode the write payload of `SetDataCellValue` into native-order bytes.
fn stage_value(args: &mut Args<'_>, cell: &DataCell) -> Result<HVec<u8, 64>, Error> {
    let kind = cell.ty.kind().ok_or(Error::NotSupported)?;
    let width = cell.ty.byte_width();
    let count = cell.count as usize;
    let mut staged = HVec::new();

    if kind == CellKind::Char {
        let bytes = match args {
            Args::Ascii(fields) => fields.remainder().unwrap_or("").as_bytes(),
            Args::MsgPack(reader) => reader.str()?.as_bytes(),
        };
        // Length-limited, zero-padded.
        let take = bytes.len().min(count);
        staged
            .extend_from_slice(&bytes[..take])
            .map_err(|_| Error::Overflow)?;
        while staged.len() < count {
            staged.push(0).map_err(|_| Error::Overflow)?;
        }
        return Ok(staged);
    }

    if count > 1 {
        if let Args::MsgPack(reader) = args {
            if reader.array()? != count {
                return Err(Error::InvalidArgument);
            }
        }
    }

    for _ in 0..count {
        let mut push = |bytes: &[u8]| staged.extend_from_slice(bytes).map_err(|_| Error::Overflow);
        match (kind, width) {
            (CellKind::Bool, _) => {
                let value = match args {
                    Args::Ascii(fields) => match fields.next() {
                        Some("0") => false,
                        Some("1") => true,
                        _ => return Err(Error::InvalidArgument),
                    },
                    Args::MsgPack(reader) => reader.boolean()?,
                };
                push(&[value as u8])?;
            }
            (CellKind::Uint, _) => {
                let value = match args {
                    Args::Ascii(fields) => fields
                        .next()
                        .and_then(|f| f.parse::<u64>().ok())
                        .ok_or(Error::InvalidArgument)?,
                    Args::MsgPack(reader) => reader.uint()? as u64,
                };
                match width {
                    1 => push(&u8::try_from(value).map_err(|_| Error::Overflow)?.to_ne_bytes())?,
                    2 => push(&u16::try_from(value).map_err(|_| Error::Overflow)?.to_ne_bytes())?,
                    4 => push(&u32::try_from(value).map_err(|_| Error::Overflow)?.to_ne_bytes())?,
                    _ => push(&value.to_ne_bytes())?,
                }
            }
            (CellKind::Int, _) => {
                let value = match args {
                    Args::Ascii(fields) => fields
                        .next()
                        .and_then(|f| f.parse::<i64>().ok())
                        .ok_or(Error::InvalidArgument)?,
                    Args::MsgPack(reader) => reader.int()? as i64,
                };
                match width {
                    1 => push(&i8::try_from(value).map_err(|_| Error::Overflow)?.to_ne_bytes())?,
                    2 => push(&i16::try_from(value).map_err(|_| Error::Overflow)?.to_ne_bytes())?,
                    4 => push(&i32::try_from(value).map_err(|_| Error::Overflow)?.to_ne_bytes())?,
                    _ => push(&value.to_ne_bytes())?,
                }
            }
            (CellKind::Float, 4) => {
                let value = match args {
                    Args::Ascii(fields) => fields
                        .next()
                        .and_then(|f| f.parse::<f32>().ok())
                        .ok_or(Error::InvalidArgument)?,
                    Args::MsgPack(reader) => reader.f32()?,
                };
                push(&value.to_ne_bytes())?;
            }
            (CellKind::Float, _) => {
                let value = match args {
                    Args::Ascii(fields) => fields
                        .next()
                        .and_then(|f| f.parse::<f64>().ok())
                        .ok_or(Error::InvalidArgument)?,
                    // Doubles are not supported in MessagePack mode.
                    Args::MsgPack(_) => return Err(Error::NotSupported),
                };
                push(&value.to_ne_bytes())?;
            }
            (CellKind::Char, _) => unreachable!(),
        }
    }
    Ok(staged)
}

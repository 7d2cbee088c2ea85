//! The host engine: one owned value driven by a periodic tick and a
//! byte-at-a-time receive hook.

use alloc::vec::Vec;
use core::ptr::NonNull;

use crate::cell::{CellData, CellKind, CellType, DataCell, OnChange, UpdateRate};
use crate::codec::{cobs, escs, rn, Decoder};
use crate::config::{Config, ConfigError, StrobeEncoding};
use crate::crc::{self, xor_checksum, CrcFn};
use crate::error::{Error, RegisterError};
use crate::frame::DataFrame;
use crate::planner::{self, ADVERTISEMENT_LEN, STROBE_TAG};
use crate::sampler;
use crate::space::DataSpace;
use crate::traits::{Hooks, Link, NoHooks, SendOutcome};
use crate::SIGNATURE;

/// The lasso host. Construct it, register the data space, seal it with
/// [`Host::register_mem`], then drive [`Host::handle_com`] from the periodic
/// tick source and [`Host::receive_byte`] from the transport.
///
/// All methods take `&mut self`; the embedder is responsible for serializing
/// the tick and receive contexts (single-threaded cooperative model).
pub struct Host<L: Link, H: Hooks = NoHooks> {
    pub(crate) cfg: Config,
    pub(crate) link: L,
    pub(crate) hooks: H,
    pub(crate) crc: CrcFn,
    pub(crate) space: DataSpace,
    pub(crate) strobe: DataFrame,
    pub(crate) response: DataFrame,
    /// Decoded command bytes; `response.valid` holds the pending length.
    pub(crate) cmd: Vec<u8>,
    pub(crate) decoder: Decoder,
    pub(crate) rx_timeout: u16,
    pub(crate) mask_bytes: usize,
    /// Fixed strobe payload overhead (tag + mask + CRC).
    pub(crate) strobe_fixed: usize,
    pub(crate) registered: bool,
    pub(crate) strobing: bool,
    pub(crate) advertise: bool,
    pub(crate) strobe_period: u16,
    pub(crate) advertise_countdown: u16,
    pub(crate) overdrive: bool,
    pub(crate) ticks: u32,
}

impl<L: Link> Host<L, NoHooks> {
    pub fn new(cfg: Config, link: L) -> Result<Self, ConfigError> {
        Self::with_hooks(cfg, link, NoHooks)
    }
}

impl<L: Link, H: Hooks> Host<L, H> {
    pub fn with_hooks(cfg: Config, link: L, hooks: H) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let decoder = Decoder::new(cfg.command_encoding);
        let advertise_countdown = cfg.advertise_period_ticks();
        let strobe_period = cfg.strobe_period_min_ticks;
        Ok(Self {
            cfg,
            link,
            hooks,
            crc: xor_checksum,
            space: DataSpace::new(),
            strobe: DataFrame::unallocated(),
            response: DataFrame::unallocated(),
            cmd: Vec::new(),
            decoder,
            rx_timeout: 0,
            mask_bytes: 0,
            strobe_fixed: 0,
            registered: false,
            strobing: false,
            advertise: true,
            strobe_period,
            advertise_countdown,
            overdrive: false,
            ticks: 0,
        })
    }

    /// Append a cell to the data space.
    ///
    /// # Safety
    ///
    /// `ptr` (when non-null) must reference `count * byte_width` bytes that
    /// stay valid and writable for the host's lifetime, aligned to the
    /// element width. The application may keep mutating them; sampling is
    /// deliberately non-atomic. A null `ptr` is only accepted with an
    /// external strobe source configured.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn register_cell(
        &mut self,
        ty: CellType,
        count: u16,
        ptr: *mut u8,
        name: &'static str,
        unit: &'static str,
        on_change: Option<OnChange>,
        rate: UpdateRate,
    ) -> Result<u8, RegisterError> {
        if self.registered {
            return Err(RegisterError::Sealed);
        }
        let ptr = NonNull::new(ptr);
        if ptr.is_none() && !self.cfg.external_strobe {
            return Err(RegisterError::NullPointer);
        }
        self.space.register(DataCell {
            ty,
            count,
            ptr,
            name,
            unit,
            on_change,
            rate,
        })
    }

    /// Typed registration convenience: an enabled cell backed by `count`
    /// elements of `T` at `ptr`.
    ///
    /// # Safety
    ///
    /// As [`Host::register_cell`].
    pub unsafe fn register_slice<T: CellData>(
        &mut self,
        name: &'static str,
        unit: &'static str,
        ptr: *mut T,
        count: usize,
        writeable: bool,
    ) -> Result<u8, RegisterError> {
        let mut ty = CellType::new(T::KIND, T::WIDTH);
        ty.set_enabled(true);
        ty.set_writeable(writeable);
        self.register_cell(
            ty,
            count as u16,
            ptr.cast(),
            name,
            unit,
            None,
            UpdateRate::default(),
        )
    }

    /// Register an enabled character-string cell of `capacity` bytes.
    /// Client writes are length-limited and zero-padded; reads stop at the
    /// first NUL.
    ///
    /// # Safety
    ///
    /// As [`Host::register_cell`].
    pub unsafe fn register_string(
        &mut self,
        name: &'static str,
        unit: &'static str,
        ptr: *mut u8,
        capacity: usize,
        writeable: bool,
    ) -> Result<u8, RegisterError> {
        let mut ty = CellType::new(CellKind::Char, 1);
        ty.set_enabled(true);
        ty.set_writeable(writeable);
        self.register_cell(
            ty,
            capacity as u16,
            ptr,
            name,
            unit,
            None,
            UpdateRate::default(),
        )
    }

    /// Seal the data space: plan the buffer layout and allocate the strobe,
    /// response and command buffers. Registration is rejected afterwards.
    pub fn register_mem(&mut self) -> Result<(), RegisterError> {
        if self.registered {
            return Err(RegisterError::Sealed);
        }
        let layout = planner::plan(&self.cfg, self.space.count(), self.space.data_max);
        self.mask_bytes = layout.mask_bytes;
        self.strobe_fixed = layout.strobe_fixed;

        alloc_buffer(&mut self.strobe.buf, layout.strobe_alloc)?;
        self.strobe.prefix = layout.strobe_prefix;
        self.strobe.bytes_max = layout.strobe_max;
        self.strobe.bytes_total = layout.strobe_fixed + self.space.data_enabled;

        alloc_buffer(&mut self.response.buf, layout.response_alloc)?;
        self.response.prefix = layout.response_prefix;
        self.response.bytes_max = layout.response_max;

        alloc_buffer(&mut self.cmd, self.cfg.command_buffer_size as usize)?;

        self.registered = true;
        info!(
            "data space sealed: {} cells, {} strobe bytes",
            self.space.count(),
            self.strobe.bytes_total
        );
        Ok(())
    }

    /// Install the production CRC primitive.
    pub fn set_crc(&mut self, crc: CrcFn) {
        self.crc = crc;
    }

    /// Monotonic tick counter; lets clients detect strobe gaps.
    pub fn ticks(&self) -> u32 {
        self.ticks
    }

    /// Sticky: a strobe cycle elapsed while the previous frame was still in
    /// flight.
    pub fn overdrive(&self) -> bool {
        self.overdrive
    }

    pub fn strobing(&self) -> bool {
        self.strobing
    }

    pub fn advertising(&self) -> bool {
        self.advertise
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Byte ingress from the transport. Only the receive state is touched;
    /// a complete frame is published through the response frame's `valid`
    /// length and blocks further ingress until interpreted.
    pub fn receive_byte(&mut self, byte: u8) {
        if !self.registered {
            return;
        }
        if self.response.valid > 0 {
            // One in-flight decoded command only.
            warn!("command dropped, interpreter busy");
            return;
        }
        match self.decoder.feed(byte, &mut self.cmd) {
            Ok(Some(len)) => {
                self.response.valid = len as u16;
                self.rx_timeout = 0;
            }
            Ok(None) => {
                self.rx_timeout = self.cfg.command_timeout_ticks;
            }
            Err(_) => {
                // The decoder discards on its own; keep the timeout armed so
                // a stalled discard still gets cleaned up.
                warn!("receive framing error");
                self.rx_timeout = self.cfg.command_timeout_ticks;
            }
        }
    }

    /// The tick handler. Call at the configured tick period.
    pub fn handle_com(&mut self) {
        if !self.registered {
            return;
        }
        self.ticks = self.ticks.wrapping_add(1);

        // Discard a stale partial receive frame.
        if self.decoder.in_progress() {
            self.rx_timeout = self.rx_timeout.saturating_sub(1);
            if self.rx_timeout == 0 {
                warn!("command receive timeout");
                self.decoder.reset();
            }
        }

        // Advertisement cadence.
        if self.advertise && !self.strobing {
            self.advertise_countdown -= 1;
            if self.advertise_countdown == 0 {
                self.advertise_countdown = self.cfg.advertise_period_ticks();
                if self.strobe.idle() {
                    self.load_advertisement();
                }
            }
        }

        // Strobe cycle.
        if self.strobing {
            self.strobe.countdown -= 1;
            if self.strobe.countdown == 0 {
                self.strobe.countdown = self.strobe_period;
                if !self.strobe.idle() {
                    if !self.overdrive {
                        warn!("strobe overdrive");
                    }
                    self.overdrive = true;
                } else if !self.cfg.external_strobe {
                    sampler::sample(
                        &mut self.strobe,
                        &mut self.space,
                        &self.cfg,
                        self.crc,
                        self.mask_bytes,
                    );
                    self.prepare_strobe_wire();
                }
            }
        }

        // Interpret at most one pending command, once the previous reply has
        // drained.
        if self.response.valid > 0 && self.response.idle() {
            let len = self.response.valid as usize;
            self.response.valid = 0;
            self.interpret(len);
        }

        // Exactly one transmit attempt, strobe first.
        self.pump();
    }

    /// External strobe source: hand a prebuilt payload to the strobe frame.
    /// The tag prefix and CRC are still applied by the host.
    pub fn submit_strobe(&mut self, payload: &[u8]) -> Result<(), Error> {
        if !self.cfg.external_strobe || !self.registered {
            return Err(Error::NotSupported);
        }
        if !self.strobe.idle() {
            return Err(Error::Busy);
        }
        let base = self.strobe.prefix;
        let tag = usize::from(self.cfg.strobe_stuffed());
        let crc_bytes = if self.cfg.strobe_crc {
            self.cfg.crc_bytes()
        } else {
            0
        };
        if tag + payload.len() + crc_bytes > self.strobe.bytes_max {
            return Err(Error::NoSpace);
        }
        if tag == 1 {
            self.strobe.buf[base] = STROBE_TAG;
        }
        self.strobe.buf[base + tag..base + tag + payload.len()].copy_from_slice(payload);
        let mut total = tag + payload.len();
        if crc_bytes > 0 {
            total = crc::append(
                self.crc,
                &mut self.strobe.buf[base..],
                total,
                self.cfg.crc_width,
            );
        }
        self.strobe.bytes_total = total;
        self.strobe.valid = 1;
        self.prepare_strobe_wire();
        Ok(())
    }

    /// Reported roundtrip latency in ticks: worst-case command in plus reply
    /// out at the configured baudrate, plus the handler-reaction margin.
    pub fn roundtrip_latency_ticks(&self) -> u16 {
        let bytes = (self.cfg.command_buffer_size + self.cfg.response_buffer_size) as u64;
        let wire_us = bytes * 10 * 1_000_000 / self.cfg.baudrate as u64;
        let tick_us = self.cfg.tick_period_ms as u64 * 1000;
        let ticks = wire_us.div_ceil(tick_us);
        ticks as u16 + self.cfg.response_latency_ticks
    }

    /// Fraction of channel bandwidth left over by the current strobe at the
    /// current period. Negative when the strobe cannot keep up.
    pub fn cycle_margin(&self) -> f32 {
        let wire = self.strobe_wire_len() as f32;
        let capacity = self.cfg.baudrate as f32 / 10.0
            * (self.strobe_period as u32 * self.cfg.tick_period_ms as u32) as f32
            / 1000.0;
        1.0 - wire / capacity
    }

    fn strobe_wire_len(&self) -> usize {
        let total = self.strobe_fixed + self.space.data_enabled;
        match self.cfg.strobe_encoding {
            StrobeEncoding::None => total,
            StrobeEncoding::Cobs => {
                let chunks = total.div_ceil(cobs::MAX_CHUNK).max(1);
                total + 1 + 2 * chunks
            }
            StrobeEncoding::Escs => total + escs::OVERHEAD,
        }
    }

    /// Drop everything and go back to advertising.
    pub(crate) fn enter_advertise(&mut self) {
        if self.strobing {
            self.hooks.on_activation(false);
        }
        self.strobing = false;
        self.advertise = true;
        self.advertise_countdown = self.cfg.advertise_period_ticks();
        // Cancel an in-flight advertisement or strobe before it keeps the
        // wire busy.
        self.strobe.cancel();
        self.strobe.valid = 0;
    }

    /// Replace the strobe contents with the fixed raw signature. The
    /// signature is scannable during discovery and bypasses the strobe
    /// encoder.
    fn load_advertisement(&mut self) {
        let info = self.cfg.protocol_info().0;
        let buf = &mut self.strobe.buf;
        buf[..10].copy_from_slice(SIGNATURE);
        buf[10..14].copy_from_slice(&info.to_le_bytes());
        buf[14..16].copy_from_slice(rn::TERMINATOR);
        self.strobe.arm_wire(ADVERTISEMENT_LEN);
    }

    /// Frame a freshly sampled strobe payload for the wire.
    fn prepare_strobe_wire(&mut self) {
        match self.cfg.strobe_encoding {
            StrobeEncoding::None => {
                let total = self.strobe.bytes_total;
                self.strobe.arm_wire(total);
            }
            StrobeEncoding::Cobs => self.strobe.arm_chunked(),
            StrobeEncoding::Escs => {
                let total = self.strobe.bytes_total;
                let prefix = self.strobe.prefix;
                let wire = escs::encode_in_buffer(&mut self.strobe.buf, prefix, total);
                self.strobe.arm_wire(wire);
            }
        }
    }

    /// One transmit attempt per tick. The strobe preempts the response.
    fn pump(&mut self) {
        let Host {
            link,
            strobe,
            response,
            cfg,
            ..
        } = self;
        let is_strobe = !strobe.idle();
        let frame = if is_strobe {
            strobe
        } else if !response.idle() {
            response
        } else {
            return;
        };

        if frame.wire_ready {
            // Raw or pre-encoded bytes, chunked by the frame size cap.
            let n = usize::min(cfg.max_frame_size as usize, frame.remaining);
            let chunk = &frame.buf[frame.head..frame.head + n];
            match link.send(chunk) {
                Ok(SendOutcome::Sent) => {
                    frame.head += n;
                    frame.remaining -= n;
                    if frame.remaining == 0 {
                        frame.wire_ready = false;
                        if is_strobe {
                            frame.valid = 0;
                        }
                    }
                }
                Ok(SendOutcome::Busy) => {}
                Err(_) => {
                    warn!("transport error, frame dropped");
                    frame.cancel();
                }
            }
        } else {
            // Chunked COBS with lazy re-encode after busy.
            let chunk_len = usize::min(cobs::MAX_CHUNK, frame.remaining);
            let start = frame.prefix + frame.chunk;
            let first = frame.chunk == 0;
            if !frame.chunk_encoded {
                if !first {
                    // Restore the payload byte the previous trailer displaced.
                    frame.buf[start] = frame.cobs_backup;
                }
                let more = frame.remaining > chunk_len;
                if more {
                    frame.cobs_backup = frame.buf[start + chunk_len];
                }
                let range = cobs::encode_chunk_in_place(&mut frame.buf, start, chunk_len, first, more);
                frame.head = range.start;
                frame.chunk_encoded = true;
            }
            let wire_len = chunk_len + if first { 3 } else { 2 };
            let chunk = &frame.buf[frame.head..frame.head + wire_len];
            match link.send(chunk) {
                Ok(SendOutcome::Sent) => {
                    frame.remaining -= chunk_len;
                    frame.chunk += chunk_len;
                    frame.chunk_encoded = false;
                    if frame.remaining == 0 && is_strobe {
                        frame.valid = 0;
                    }
                }
                Ok(SendOutcome::Busy) => {}
                Err(_) => {
                    warn!("transport error, frame dropped");
                    frame.cancel();
                }
            }
        }
    }
}

fn alloc_buffer(buf: &mut Vec<u8>, size: usize) -> Result<(), RegisterError> {
    buf.try_reserve_exact(size)
        .map_err(|_| RegisterError::OutOfMemory)?;
    buf.resize(size, 0);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellKind;
    use crate::config::{CommandEncoding, CrcWidth, Processing};
    use crate::traits::{Hooks, IoLink};
    use crate::wire::msgpack;
    use link_mocks::MockSerial;

    type MockLink = IoLink<MockSerial>;

    fn mock_link() -> MockLink {
        IoLink(MockSerial::new())
    }

    fn serial<H: Hooks>(host: &mut Host<MockLink, H>) -> &mut MockSerial {
        &mut host.link_mut().0
    }

    fn feed(host: &mut Host<MockLink, impl Hooks>, bytes: &[u8]) {
        for &byte in bytes {
            host.receive_byte(byte);
        }
    }

    fn tick(host: &mut Host<MockLink, impl Hooks>, times: usize) {
        for _ in 0..times {
            host.handle_com();
        }
    }

    /// 10 ms tick, 115200 baud, `float speed` and
    /// `uint16[4] pwm` cells, RN/ASCII channel.
    fn ascii_host() -> (Host<MockLink>, *mut f32, *mut u16) {
        let cfg = Config::default();
        let mut host = Host::new(cfg, mock_link()).unwrap();
        let speed = Box::leak(Box::new([20.0f32])).as_mut_ptr();
        let pwm = Box::leak(Box::new([0x1111u16, 0x2222, 0x3333, 0x4444])).as_mut_ptr();
        unsafe {
            host.register_slice("speed", "m/s", speed, 1, true).unwrap();
            host.register_slice("pwm", "rpm", pwm, 4, false).unwrap();
        }
        host.register_mem().unwrap();
        (host, speed, pwm)
    }

    fn msgpack_cfg() -> Config {
        Config {
            command_encoding: CommandEncoding::Cobs,
            strobe_encoding: StrobeEncoding::Cobs,
            processing: Processing::MsgPack,
            ..Config::default()
        }
    }

    fn cobs_wire(payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; payload.len() + 4];
        buf[2..2 + payload.len()].copy_from_slice(payload);
        let range = cobs::encode_chunk_in_place(&mut buf, 2, payload.len(), true, false);
        buf[range].to_vec()
    }

    fn cobs_decode_stream(wire: &[u8]) -> Vec<Vec<u8>> {
        let mut decoder = cobs::CobsDecoder::new();
        let mut out = vec![0u8; 1024];
        let mut frames = Vec::new();
        for &byte in wire {
            if let Some(len) = decoder.feed(byte, &mut out).unwrap() {
                frames.push(out[..len].to_vec());
            }
        }
        frames
    }

    #[test]
    fn cell_count_query() {
        let (mut host, _, _) = ascii_host();
        feed(&mut host, b"n\r\n");
        tick(&mut host, 2);
        assert!(serial(&mut host)
            .frames()
            .contains(&b"n,2,0\r\n".to_vec()));
    }

    #[test]
    fn cell_params_query() {
        let (mut host, _, _) = ascii_host();
        feed(&mut host, b"p,1\r\n");
        tick(&mut host, 2);
        assert!(serial(&mut host)
            .frames()
            .contains(&b"p,pwm,34,4,rpm,1,4,0\r\n".to_vec()));
    }

    #[test]
    fn start_stop_strobe() {
        let (mut host, _, _) = ascii_host();

        // Move the strobe period to 10 ticks; silent while advertising, and
        // the first client interaction leaves advertising.
        feed(&mut host, b"P,10\r\n");
        tick(&mut host, 1);
        assert!(!host.advertising());
        assert!(serial(&mut host).take_frames().is_empty());

        // Start strobing; no reply on the RN channel.
        feed(&mut host, b"W,1\r\n");
        tick(&mut host, 1);
        assert!(host.strobing());
        assert!(serial(&mut host).take_frames().is_empty());

        // 4 bytes float + 8 bytes uint16[4], every 10 ticks.
        tick(&mut host, 21);
        let frames = serial(&mut host).take_frames();
        assert_eq!(3, frames.len());
        assert!(frames.iter().all(|frame| frame.len() == 12));

        // Stop; silent while strobing, no strobes afterwards.
        feed(&mut host, b"W,0\r\n");
        tick(&mut host, 25);
        assert!(!host.strobing());
        assert!(serial(&mut host).take_frames().is_empty());
    }

    #[test]
    fn set_value_writes_memory() {
        let (mut host, speed, _) = ascii_host();
        feed(&mut host, b"W,0\r\n");
        tick(&mut host, 1);
        serial(&mut host).take_frames();

        feed(&mut host, b"V,0,3.25\r\n");
        tick(&mut host, 2);
        assert_eq!(3.25f32, unsafe { speed.read() });
        assert!(serial(&mut host).frames().contains(&b"V,0\r\n".to_vec()));
    }

    #[test]
    fn read_only_cell_is_permission_denied() {
        let (mut host, _, pwm) = ascii_host();
        feed(&mut host, b"W,0\r\n");
        tick(&mut host, 1);
        serial(&mut host).take_frames();

        feed(&mut host, b"V,1,9,9,9,9\r\n");
        tick(&mut host, 2);
        assert_eq!(0x1111, unsafe { pwm.read() });
        assert!(serial(&mut host).frames().contains(&b"V,13\r\n".to_vec()));
    }

    #[test]
    fn overdrive_and_negative_margin() {
        let cfg = Config::default();
        let mut host = Host::new(cfg, mock_link()).unwrap();
        let big = Box::leak(Box::new([0u8; 200])).as_mut_ptr();
        unsafe {
            host.register_slice("trace", "", big, 200, false).unwrap();
        }
        host.register_mem().unwrap();

        // Strobe period stays at the 1-tick minimum; 200 bytes per 10 ms
        // exceeds what 115200 baud carries.
        assert!(host.cycle_margin() < 0.0);

        feed(&mut host, b"W,1\r\n");
        tick(&mut host, 1);
        serial(&mut host).busy_next(8);
        tick(&mut host, 3);
        assert!(host.overdrive());
    }

    #[test]
    fn advertisement_signature() {
        let (mut host, _, _) = ascii_host();
        tick(&mut host, 25);
        let frames = serial(&mut host).take_frames();
        assert_eq!(1, frames.len());
        let frame = &frames[0];
        assert_eq!(ADVERTISEMENT_LEN, frame.len());
        assert_eq!(b"lassoHost/", &frame[..10]);
        let info = u32::from_le_bytes(frame[10..14].try_into().unwrap());
        assert_eq!(host.cfg.protocol_info().0, info);
        assert_eq!(b"\r\n", &frame[14..16]);
    }

    #[test]
    fn set_advertise_is_idempotent() {
        let (mut host, _, _) = ascii_host();
        feed(&mut host, b"W,1\r\n");
        tick(&mut host, 3);
        assert!(host.strobing());

        feed(&mut host, b"A\r\n");
        tick(&mut host, 1);
        assert!(!host.strobing());
        assert!(host.advertising());
        assert!(host.strobe.idle());

        feed(&mut host, b"A\r\n");
        tick(&mut host, 1);
        assert!(!host.strobing());
        assert!(host.advertising());
    }

    #[test]
    fn command_timeout_discards_partial_frame() {
        let (mut host, _, _) = ascii_host();
        feed(&mut host, b"p");
        tick(&mut host, 11);
        // The stale prefix is gone; a fresh command parses cleanly.
        feed(&mut host, b"n\r\n");
        tick(&mut host, 2);
        let frames = serial(&mut host).take_frames();
        assert_eq!(vec![b"n,2,0\r\n".to_vec()], frames);
    }

    #[test]
    fn partial_frame_survives_within_timeout() {
        let (mut host, _, _) = ascii_host();
        feed(&mut host, b"p,");
        tick(&mut host, 3);
        feed(&mut host, b"1\r\n");
        tick(&mut host, 2);
        assert!(serial(&mut host)
            .frames()
            .contains(&b"p,pwm,34,4,rpm,1,4,0\r\n".to_vec()));
    }

    #[test]
    fn second_frame_before_consumption_is_dropped() {
        let (mut host, _, _) = ascii_host();
        feed(&mut host, b"n\r\n");
        feed(&mut host, b"n\r\n");
        tick(&mut host, 4);
        let replies: Vec<_> = serial(&mut host)
            .frames()
            .iter()
            .filter(|frame| frame.starts_with(b"n,"))
            .cloned()
            .collect();
        assert_eq!(1, replies.len());
    }

    #[test]
    fn rn_ignores_gets_while_strobing() {
        let (mut host, _, _) = ascii_host();
        feed(&mut host, b"P,10\r\n");
        tick(&mut host, 1);
        feed(&mut host, b"W,1\r\n");
        tick(&mut host, 1);
        serial(&mut host).take_frames();

        feed(&mut host, b"n\r\n");
        tick(&mut host, 12);
        let frames = serial(&mut host).take_frames();
        // Only 12-byte strobes, no "n," reply.
        assert!(!frames.is_empty());
        assert!(frames.iter().all(|frame| frame.len() == 12));
    }

    #[test]
    fn busy_transport_retries_the_same_frame() {
        let (mut host, _, _) = ascii_host();
        feed(&mut host, b"n\r\n");
        serial(&mut host).busy_next(1);
        tick(&mut host, 1);
        assert!(serial(&mut host).frames().is_empty());
        tick(&mut host, 1);
        assert_eq!(
            vec![b"n,2,0\r\n".to_vec()],
            serial(&mut host).take_frames()
        );
    }

    #[test]
    fn transport_error_drops_the_frame() {
        let (mut host, _, _) = ascii_host();
        feed(&mut host, b"n\r\n");
        serial(&mut host).fail_next();
        tick(&mut host, 3);
        assert!(serial(&mut host).frames().is_empty());
        // The engine keeps running.
        feed(&mut host, b"n\r\n");
        tick(&mut host, 2);
        assert_eq!(
            vec![b"n,2,0\r\n".to_vec()],
            serial(&mut host).take_frames()
        );
    }

    #[test]
    fn registration_is_sealed_by_register_mem() {
        let (mut host, _, _) = ascii_host();
        let extra = Box::leak(Box::new([0u32; 1])).as_mut_ptr();
        let result = unsafe { host.register_slice("late", "", extra, 1, false) };
        assert_eq!(Err(RegisterError::Sealed), result);
        assert_eq!(Err(RegisterError::Sealed), host.register_mem());
    }

    #[test]
    fn null_pointer_requires_external_strobe() {
        let cfg = Config::default();
        let mut host = Host::new(cfg, mock_link()).unwrap();
        let result = unsafe {
            host.register_cell(
                CellType::new(CellKind::Uint, 1),
                1,
                core::ptr::null_mut(),
                "ghost",
                "",
                None,
                UpdateRate::default(),
            )
        };
        assert_eq!(Err(RegisterError::NullPointer), result);
    }

    #[test]
    fn msgpack_cobs_end_to_end() {
        let mut host = Host::new(msgpack_cfg(), mock_link()).unwrap();
        let speed = Box::leak(Box::new([1.5f32])).as_mut_ptr();
        unsafe {
            host.register_slice("speed", "m/s", speed, 1, true).unwrap();
        }
        host.register_mem().unwrap();

        // [opcode 'n', []]
        feed(&mut host, &cobs_wire(&[0x92, 0x6E, 0x90]));
        tick(&mut host, 2);

        let wire = serial(&mut host).wire();
        let frames = cobs_decode_stream(&wire);
        assert_eq!(1, frames.len());
        let mut reader = msgpack::Reader::new(&frames[0]);
        assert_eq!(3, reader.array().unwrap());
        assert_eq!(b'n' as u32, reader.uint().unwrap());
        assert_eq!(1, reader.array().unwrap());
        assert_eq!(1, reader.uint().unwrap());
        assert_eq!(0, reader.int().unwrap());
    }

    #[test]
    fn msgpack_set_value_round_trip() {
        let mut host = Host::new(msgpack_cfg(), mock_link()).unwrap();
        let speed = Box::leak(Box::new([1.5f32])).as_mut_ptr();
        unsafe {
            host.register_slice("speed", "m/s", speed, 1, true).unwrap();
        }
        host.register_mem().unwrap();

        // ['V', [0, 3.25f32]]
        let mut cmd = vec![0x92, 0x56, 0x92, 0x00, 0xCA];
        cmd.extend_from_slice(&3.25f32.to_be_bytes());
        feed(&mut host, &cobs_wire(&cmd));
        tick(&mut host, 2);

        assert_eq!(3.25f32, unsafe { speed.read() });
        let frames = cobs_decode_stream(&serial(&mut host).wire());
        let mut reader = msgpack::Reader::new(&frames[0]);
        assert_eq!(3, reader.array().unwrap());
        assert_eq!(b'V' as u32, reader.uint().unwrap());
        assert_eq!(0, reader.array().unwrap());
        assert_eq!(0, reader.int().unwrap());
    }

    #[test]
    fn stuffed_strobes_carry_the_disambiguator_and_interleave_with_replies() {
        let cfg = Config {
            strobe_period_min_ticks: 2,
            ..msgpack_cfg()
        };
        let mut host = Host::new(cfg, mock_link()).unwrap();
        let value = Box::leak(Box::new([0xAAu8; 4])).as_mut_ptr();
        unsafe {
            host.register_slice("raw", "", value, 4, false).unwrap();
        }
        host.register_mem().unwrap();

        // ['W', [true]]; in a stuffed encoding the SET is acknowledged.
        feed(&mut host, &cobs_wire(&[0x92, 0x57, 0x91, 0xC3]));
        let mut frames_per_tick = Vec::new();
        for _ in 0..8 {
            let before = serial(&mut host).frames().len();
            tick(&mut host, 1);
            frames_per_tick.push(serial(&mut host).frames().len() - before);
        }
        // Exactly one transmit attempt per tick.
        assert!(frames_per_tick.iter().all(|&n| n <= 1));

        let frames = cobs_decode_stream(&serial(&mut host).wire());
        let strobes: Vec<_> = frames
            .iter()
            .filter(|frame| frame[0] == STROBE_TAG)
            .collect();
        let replies: Vec<_> = frames
            .iter()
            .filter(|frame| frame[0] != STROBE_TAG)
            .collect();
        assert!(strobes.len() >= 2);
        assert_eq!(1, replies.len());
        // tag + 4 data bytes
        assert!(strobes.iter().all(|frame| frame.len() == 5));
    }

    #[test]
    fn strobe_preempts_pending_reply() {
        let cfg = Config {
            strobe_period_min_ticks: 2,
            ..msgpack_cfg()
        };
        let mut host = Host::new(cfg, mock_link()).unwrap();
        let value = Box::leak(Box::new([0x55u8; 4])).as_mut_ptr();
        unsafe {
            host.register_slice("raw", "", value, 4, false).unwrap();
        }
        host.register_mem().unwrap();

        feed(&mut host, &cobs_wire(&[0x92, 0x57, 0x91, 0xC3]));
        tick(&mut host, 2);
        serial(&mut host).take_frames();

        // Queue a query whose reply gets stuck behind backpressure, then let
        // the next strobe cycle contend for the wire.
        feed(&mut host, &cobs_wire(&[0x92, 0x6E, 0x90]));
        serial(&mut host).busy_next(1);
        tick(&mut host, 1);
        tick(&mut host, 2);
        let frames = cobs_decode_stream(&serial(&mut host).wire());
        // The strobe went out first even though the reply was ready earlier.
        assert!(frames.len() >= 2);
        assert_eq!(STROBE_TAG, frames[0][0]);
        assert_ne!(STROBE_TAG, frames[1][0]);
    }

    #[test]
    fn multi_chunk_cobs_strobe() {
        let cfg = Config {
            strobe_period_min_ticks: 10,
            ..msgpack_cfg()
        };
        let mut host = Host::new(cfg, mock_link()).unwrap();
        let big = (0..300u16).map(|i| i as u8).collect::<Vec<u8>>().leak();
        let ptr = big.as_mut_ptr();
        unsafe {
            host.register_slice("blob", "", ptr, 300, false).unwrap();
        }
        host.register_mem().unwrap();

        feed(&mut host, &cobs_wire(&[0x92, 0x57, 0x91, 0xC3]));
        tick(&mut host, 5);

        let wire = serial(&mut host).wire();
        let frames = cobs_decode_stream(&wire);
        // 301 payload bytes (tag + 300) reassembled across two chunks.
        let strobe = frames
            .iter()
            .find(|frame| frame[0] == STROBE_TAG)
            .expect("no strobe decoded");
        assert_eq!(301, strobe.len());
        assert_eq!((0..300u16).map(|i| i as u8).collect::<Vec<_>>(), strobe[1..]);
    }

    #[test]
    fn command_crc_gates_interpretation() {
        let cfg = Config {
            command_crc: true,
            crc_width: CrcWidth::One,
            ..msgpack_cfg()
        };
        let mut host = Host::new(cfg, mock_link()).unwrap();
        let value = Box::leak(Box::new([7u8])).as_mut_ptr();
        unsafe {
            host.register_slice("v", "", value, 1, false).unwrap();
        }
        host.register_mem().unwrap();

        // Correct XOR appended: frame folds to zero.
        let payload = [0x92u8, 0x6E, 0x90];
        let crc = payload.iter().fold(0u8, |acc, b| acc ^ b);
        let mut good = payload.to_vec();
        good.push(crc);
        feed(&mut host, &cobs_wire(&good));
        tick(&mut host, 2);
        let frames = cobs_decode_stream(&serial(&mut host).wire());
        assert_eq!(1, frames.len());
        // The reply carries its own checksum.
        assert_eq!(0, frames[0].iter().fold(0u8, |acc, b| acc ^ b));

        // A corrupted frame is dropped without a reply.
        let mut bad = payload.to_vec();
        bad.push(crc ^ 0x5A);
        feed(&mut host, &cobs_wire(&bad));
        tick(&mut host, 3);
        assert_eq!(1, cobs_decode_stream(&serial(&mut host).wire()).len());
    }

    #[test]
    fn escs_end_to_end() {
        let cfg = Config {
            command_encoding: CommandEncoding::Escs,
            strobe_encoding: StrobeEncoding::Escs,
            processing: Processing::MsgPack,
            ..Config::default()
        };
        let mut host = Host::new(cfg, mock_link()).unwrap();
        let value = Box::leak(Box::new([0x7Eu8, 0x7D])).as_mut_ptr();
        unsafe {
            host.register_slice("tricky", "", value, 2, false).unwrap();
        }
        host.register_mem().unwrap();

        feed(&mut host, &[0x7E, 0x92, 0x6E, 0x90, 0x7E]);
        tick(&mut host, 2);

        let wire = serial(&mut host).wire();
        let mut decoder = escs::EscsDecoder::new();
        let mut out = [0u8; 64];
        let mut reply = None;
        for &byte in &wire {
            if let Some(len) = decoder.feed(byte, &mut out).unwrap() {
                reply = Some(out[..len].to_vec());
            }
        }
        let reply = reply.expect("no reply frame");
        let mut reader = msgpack::Reader::new(&reply);
        assert_eq!(3, reader.array().unwrap());
        assert_eq!(b'n' as u32, reader.uint().unwrap());
    }

    #[test]
    fn unknown_opcode_is_not_supported() {
        let (mut host, _, _) = ascii_host();
        feed(&mut host, b"q\r\n");
        tick(&mut host, 2);
        assert!(serial(&mut host).frames().contains(&b"q,95\r\n".to_vec()));
    }

    #[test]
    fn unknown_cell_is_bad_address() {
        let (mut host, _, _) = ascii_host();
        feed(&mut host, b"p,7\r\n");
        tick(&mut host, 2);
        assert!(serial(&mut host).frames().contains(&b"p,14\r\n".to_vec()));
    }

    #[test]
    fn set_cell_strobe_requires_strobing_off() {
        let (mut host, _, _) = ascii_host();
        feed(&mut host, b"W,0\r\n");
        tick(&mut host, 1);
        serial(&mut host).take_frames();

        feed(&mut host, b"S,1,0\r\n");
        tick(&mut host, 2);
        assert!(serial(&mut host).take_frames().contains(&b"S,0\r\n".to_vec()));
        // 4 bytes of float remain once the pwm block is out.
        assert_eq!(4, host.space.data_enabled);
        assert_eq!(4, host.strobe.bytes_total);

        feed(&mut host, b"W,1\r\n");
        tick(&mut host, 1);
        feed(&mut host, b"S,1,1\r\n");
        tick(&mut host, 2);
        // Rejected while strobing; the data space is unchanged.
        assert_eq!(4, host.space.data_enabled);
    }

    #[test]
    fn get_timing_info_shape() {
        let (mut host, _, _) = ascii_host();
        feed(&mut host, b"t\r\n");
        tick(&mut host, 2);
        let frames = serial(&mut host).take_frames();
        let reply = core::str::from_utf8(&frames[0]).unwrap();
        let fields: Vec<_> = reply.trim_end().split(',').collect();
        // t, tick, timeout, roundtrip, min, max, period, margin, overdrive, 0
        assert_eq!(10, fields.len());
        assert_eq!("t", fields[0]);
        assert_eq!("10", fields[1]);
        assert_eq!("10", fields[2]);
        assert_eq!("0", fields[8]);
        assert_eq!("0", fields[9]);
    }

    #[test]
    fn get_protocol_info_reports_word_and_version() {
        let (mut host, _, _) = ascii_host();
        let word = host.cfg.protocol_info().0;
        feed(&mut host, b"i\r\n");
        tick(&mut host, 2);
        let expected = format!("i,{},{},0\r\n", word, crate::VERSION);
        assert!(serial(&mut host)
            .frames()
            .contains(&expected.into_bytes()));
    }

    #[test]
    fn get_value_formats_arrays_and_scalars() {
        let (mut host, _, _) = ascii_host();
        feed(&mut host, b"W,0\r\n");
        tick(&mut host, 1);
        serial(&mut host).take_frames();

        feed(&mut host, b"v,0\r\n");
        tick(&mut host, 2);
        assert!(serial(&mut host)
            .take_frames()
            .contains(&b"v,20.000000,0\r\n".to_vec()));

        feed(&mut host, b"v,1\r\n");
        tick(&mut host, 2);
        let expected = format!("v,{},{},{},{},0\r\n", 0x1111, 0x2222, 0x3333, 0x4444);
        assert!(serial(&mut host)
            .take_frames()
            .contains(&expected.into_bytes()));
    }

    #[test]
    fn char_cells_read_and_write_strings() {
        let cfg = Config::default();
        let mut host = Host::new(cfg, mock_link()).unwrap();
        let label = Box::leak(Box::new(*b"idle\0\0\0\0")).as_mut_ptr();
        unsafe {
            host.register_string("label", "", label, 8, true).unwrap();
        }
        host.register_mem().unwrap();

        feed(&mut host, b"W,0\r\n");
        tick(&mut host, 1);
        serial(&mut host).take_frames();

        feed(&mut host, b"v,0\r\n");
        tick(&mut host, 2);
        assert!(serial(&mut host)
            .take_frames()
            .contains(&b"v,idle,0\r\n".to_vec()));

        feed(&mut host, b"V,0,run\r\n");
        tick(&mut host, 2);
        let stored = unsafe { core::slice::from_raw_parts(label, 8) };
        assert_eq!(b"run\0\0\0\0\0", stored);
        assert!(serial(&mut host).frames().contains(&b"V,0\r\n".to_vec()));
    }

    fn reject_all(_: &[u8]) -> bool {
        false
    }

    #[test]
    fn on_change_hook_vetoes_the_write() {
        let cfg = Config::default();
        let mut host = Host::new(cfg, mock_link()).unwrap();
        let value = Box::leak(Box::new([5u32])).as_mut_ptr();
        let mut ty = CellType::new(CellKind::Uint, 4);
        ty.set_enabled(true);
        ty.set_writeable(true);
        unsafe {
            host.register_cell(
                ty,
                1,
                value.cast(),
                "guarded",
                "",
                Some(reject_all),
                UpdateRate::default(),
            )
            .unwrap();
        }
        host.register_mem().unwrap();

        feed(&mut host, b"W,0\r\n");
        tick(&mut host, 1);
        serial(&mut host).take_frames();

        feed(&mut host, b"V,0,99\r\n");
        tick(&mut host, 2);
        // Vetoed but not an error.
        assert_eq!(5, unsafe { value.read() });
        assert!(serial(&mut host).frames().contains(&b"V,0\r\n".to_vec()));
    }

    #[derive(Default)]
    struct RecordingHooks {
        activations: Vec<bool>,
        control: Vec<Vec<u8>>,
    }

    impl Hooks for RecordingHooks {
        fn on_activation(&mut self, active: bool) {
            self.activations.push(active);
        }

        fn on_period_change(&mut self, ticks: u16) -> u16 {
            ticks.max(20)
        }

        fn on_control(&mut self, message: &[u8]) {
            self.control.push(message.to_vec());
        }
    }

    #[test]
    fn hooks_see_activation_period_and_control() {
        let cfg = Config::default();
        let mut host = Host::with_hooks(cfg, mock_link(), RecordingHooks::default()).unwrap();
        let value = Box::leak(Box::new([1u8])).as_mut_ptr();
        unsafe {
            host.register_slice("x", "", value, 1, false).unwrap();
        }
        host.register_mem().unwrap();

        feed(&mut host, b"P,5\r\n");
        tick(&mut host, 1);
        // The hook quantized the request up to 20 ticks.
        assert_eq!(20, host.strobe_period);

        feed(&mut host, b"W,1\r\n");
        tick(&mut host, 1);
        feed(&mut host, b"W,0\r\n");
        tick(&mut host, 1);
        assert_eq!(vec![true, false], host.hooks.activations);

        feed(&mut host, &[0xC1, 0x10, 0x20, b'\r', b'\n']);
        tick(&mut host, 1);
        assert_eq!(vec![vec![0x10, 0x20]], host.hooks.control);
    }

    #[test]
    fn external_strobe_submission() {
        let cfg = Config {
            external_strobe: true,
            ..msgpack_cfg()
        };
        let mut host = Host::new(cfg, mock_link()).unwrap();
        unsafe {
            host.register_cell(
                CellType::new(CellKind::Uint, 1),
                8,
                core::ptr::null_mut(),
                "virtual",
                "",
                None,
                UpdateRate::default(),
            )
            .unwrap();
        }
        host.register_mem().unwrap();

        host.submit_strobe(&[1, 2, 3, 4]).unwrap();
        tick(&mut host, 1);
        let frames = cobs_decode_stream(&serial(&mut host).wire());
        assert_eq!(1, frames.len());
        assert_eq!(&[STROBE_TAG, 1, 2, 3, 4], frames[0].as_slice());
    }

    #[test]
    fn dynamic_strobe_masks_on_the_wire() {
        let cfg = Config {
            strobe_dynamics: crate::config::StrobeDynamics::Dynamic,
            strobe_period_min_ticks: 1,
            ..msgpack_cfg()
        };
        let mut host = Host::new(cfg, mock_link()).unwrap();
        let fast = Box::leak(Box::new([0x11u8])).as_mut_ptr();
        let slow = Box::leak(Box::new([0x22u8])).as_mut_ptr();
        unsafe {
            host.register_slice("fast", "", fast, 1, false).unwrap();
            let slow_index = host.register_slice("slow", "", slow, 1, false).unwrap();
            host.space.cells_mut()[slow_index as usize].rate = UpdateRate::every(2);
        }
        host.register_mem().unwrap();

        feed(&mut host, &cobs_wire(&[0x92, 0x57, 0x91, 0xC3]));
        tick(&mut host, 4);

        let frames = cobs_decode_stream(&serial(&mut host).wire());
        let strobes: Vec<_> = frames
            .iter()
            .filter(|frame| frame[0] == STROBE_TAG)
            .collect();
        assert!(strobes.len() >= 2);
        // First cycle: only the fast cell, mask 0b01. Second: both, 0b11.
        assert_eq!(&[STROBE_TAG, 0b01, 0x11], strobes[0].as_slice());
        assert_eq!(&[STROBE_TAG, 0b11, 0x11, 0x22], strobes[1].as_slice());
    }
}

//! Seams to the embedding target: the serial link and the target callbacks.

/// Outcome of a non-blocking transmit attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SendOutcome {
    /// The whole frame was accepted by the transmitter.
    Sent,
    /// The transmitter cannot take a frame right now; retry next tick.
    Busy,
}

/// A byte-oriented transmit primitive.
///
/// `send` must either accept the whole frame, report [`SendOutcome::Busy`]
/// without consuming anything, or fail. The host never blocks on it.
pub trait Link {
    type Error: embedded_io::Error;

    fn send(&mut self, frame: &[u8]) -> Result<SendOutcome, Self::Error>;
}

/// Target-specific callbacks invoked by the host.
///
/// All methods have no-op defaults; implement only what the target cares
/// about.
pub trait Hooks {
    /// A client started (`true`) or stopped (`false`) a strobe session.
    fn on_activation(&mut self, _active: bool) {}

    /// A client requested a new strobe period. The returned value is the
    /// period actually applied, which lets the target quantize or refuse the
    /// request.
    fn on_period_change(&mut self, ticks: u16) -> u16 {
        ticks
    }

    /// An opaque control frame (leading `0xC1`) arrived.
    fn on_control(&mut self, _message: &[u8]) {}
}

/// The no-op hook set.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl Hooks for NoHooks {}

/// Adapts any blocking [`embedded_io::Write`] into an always-ready [`Link`].
pub struct BlockingLink<W>(pub W);

impl<W: embedded_io::Write> Link for BlockingLink<W> {
    type Error = W::Error;

    fn send(&mut self, frame: &[u8]) -> Result<SendOutcome, Self::Error> {
        self.0.write_all(frame)?;
        self.0.flush()?;
        Ok(SendOutcome::Sent)
    }
}

/// Adapts a non-blocking [`embedded_io`] writer into a [`Link`]: a transmitter
/// that is not ready reports busy backpressure instead of blocking the tick.
pub struct IoLink<W>(pub W);

impl<W: embedded_io::Write + embedded_io::WriteReady> Link for IoLink<W> {
    type Error = W::Error;

    fn send(&mut self, frame: &[u8]) -> Result<SendOutcome, Self::Error> {
        if !self.0.write_ready()? {
            return Ok(SendOutcome::Busy);
        }
        self.0.write_all(frame)?;
        self.0.flush()?;
        Ok(SendOutcome::Sent)
    }
}

//! Scriptable serial mocks for driving a lasso host in tests.
//!
//! [`MockSerial`] implements the `embedded-io` write traits, so a host wraps
//! it in its non-blocking link adapter exactly like a real UART handle.

use std::collections::VecDeque;

use embedded_io::{ErrorType, Write, WriteReady};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialError;

impl embedded_io::Error for SerialError {
    fn kind(&self) -> embedded_io::ErrorKind {
        embedded_io::ErrorKind::Other
    }
}

/// Outcome scripted for one future transmit attempt.
#[derive(Debug, Clone, Copy)]
enum Script {
    Busy,
    Fail,
}

/// Records every frame written to it. Future transmit attempts can be
/// scripted to report busy backpressure (via `write_ready`) or a transport
/// failure.
#[derive(Debug, Default)]
pub struct MockSerial {
    frames: Vec<Vec<u8>>,
    script: VecDeque<Script>,
    fail_armed: bool,
}

impl MockSerial {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `times` transmit attempts see a not-ready transmitter.
    pub fn busy_next(&mut self, times: usize) {
        for _ in 0..times {
            self.script.push_back(Script::Busy);
        }
    }

    /// The next transmit attempt fails with a transport error.
    pub fn fail_next(&mut self) {
        self.script.push_back(Script::Fail);
    }

    /// Frames accepted so far, oldest first.
    pub fn frames(&self) -> &[Vec<u8>] {
        &self.frames
    }

    /// Drain the recorded frames.
    pub fn take_frames(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.frames)
    }

    /// Everything accepted so far, concatenated in wire order.
    pub fn wire(&self) -> Vec<u8> {
        self.frames.concat()
    }
}

impl ErrorType for MockSerial {
    type Error = SerialError;
}

impl WriteReady for MockSerial {
    fn write_ready(&mut self) -> Result<bool, Self::Error> {
        match self.script.front() {
            Some(Script::Busy) => {
                self.script.pop_front();
                Ok(false)
            }
            Some(Script::Fail) => {
                // Let the write itself report the failure.
                self.script.pop_front();
                self.fail_armed = true;
                Ok(true)
            }
            None => Ok(true),
        }
    }
}

impl Write for MockSerial {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        if self.fail_armed {
            self.fail_armed = false;
            return Err(SerialError);
        }
        self.frames.push(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

pub mod driver;
pub mod identity;
pub mod measurement;
pub mod port_monitor;

pub use driver::{CrInstrument, PtsInstrument};
pub use identity::InstrumentIdentity;
pub use measurement::MeasurementResult;
pub use port_monitor::{list_ports, PollingPortMonitor, PortEvent, PortMonitor};

use serde::{Deserialize, Serialize};

use crate::transport::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceFamily {
    Pts,
    Cr,
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Measurement failed: {0}")]
    MeasurementFailed(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
}

pub type Result<T> = std::result::Result<T, DeviceError>;

/// Cursor over a fixed-layout binary payload.
pub(crate) struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(DeviceError::MalformedPayload(format!(
                "needed {} more bytes at offset {}, {} available",
                n,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16_be(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u32_be(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn f32_be(&mut self) -> Result<f32> {
        let b = self.take(4)?;
        Ok(f32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// A string prefixed by a one-byte length. Instrument firmware emits
    /// ASCII; anything else is decoded lossily.
    pub fn prefixed_string(&mut self) -> Result<String> {
        let len = self.u8()? as usize;
        let bytes = self.take(len)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn flag(&mut self) -> Result<bool> {
        Ok(self.u8()? != 0)
    }
}

//! Modbus framing: RTU over serial and the MBAP variant over TCP.

use std::sync::atomic::{AtomicU16, Ordering};

use super::{ByteWindow, CodecError, Frame, FrameCodec, Result};

/// Keepalive probe sent during idle periods: a single-register read
/// addressed to unit 1, as captured from the vendor tooling.
pub const TCP_PROBE: [u8; 8] = [0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x01, 0x08];

const MBAP_HEADER: usize = 7;
// Sanity cap on the MBAP declared length (unit + PDU).
const MAX_MBAP_LEN: usize = 256;

/// CRC16 with polynomial 0xA001 (reflected 0x8005), seed 0xFFFF.
pub fn crc16(bytes: &[u8]) -> u16 {
    let mut crc = 0xFFFFu16;
    for byte in bytes {
        crc ^= *byte as u16;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Modbus-RTU codec for a fixed unit address.
///
/// Responses are `address | function | count | data | CRC16(LE)`, or the
/// five-byte exception form when the function has its high bit set. A CRC
/// failure surfaces `ChecksumMismatch` after discarding a single byte
/// rather than flushing the buffer, since nothing distinguishes an address
/// byte from line noise. Valid frames addressed to a different unit are
/// skipped whole.
#[derive(Debug, Clone, Copy)]
pub struct RtuCodec {
    unit: u8,
}

impl RtuCodec {
    pub fn new(unit: u8) -> Self {
        Self { unit }
    }

    pub fn unit(&self) -> u8 {
        self.unit
    }
}

impl FrameCodec for RtuCodec {
    fn encode(&self, function: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + payload.len());
        out.push(self.unit);
        out.push(function);
        out.extend_from_slice(payload);
        let crc = crc16(&out);
        out.extend_from_slice(&crc.to_le_bytes());
        out
    }

    fn extract(&self, window: &mut ByteWindow) -> Result<Option<Frame>> {
        loop {
            if window.len() < 5 {
                return Ok(None);
            }
            let total = {
                let u = window.unread();
                if u[1] & 0x80 != 0 {
                    // Exception response: address, function, code, CRC
                    5
                } else {
                    3 + u[2] as usize + 2
                }
            };
            if window.len() < total {
                return Ok(None);
            }
            let (address, computed, received) = {
                let u = window.unread();
                (
                    u[0],
                    crc16(&u[..total - 2]),
                    u16::from_le_bytes([u[total - 2], u[total - 1]]),
                )
            };
            if computed != received {
                log::trace!("RTU CRC mismatch, resynchronizing by one byte");
                window.consume(1);
                return Err(CodecError::ChecksumMismatch { computed, received });
            }
            if address != self.unit {
                log::debug!(
                    "Skipping RTU frame addressed to unit {}, ours is {}",
                    address,
                    self.unit
                );
                window.consume(total);
                continue;
            }
            let frame = {
                let u = window.unread();
                Frame {
                    opcode: u[1],
                    status: u[0],
                    payload: u[2..total - 2].to_vec(),
                    checksum: received,
                }
            };
            window.consume(total);
            return Ok(Some(frame));
        }
    }
}

/// Modbus over TCP with the MBAP header:
/// `txn(2, BE) | protocol(2, BE, =0) | length(2, BE) | unit | PDU`.
/// The length field covers the unit byte and the PDU.
#[derive(Debug)]
pub struct MbapCodec {
    unit: u8,
    txn: AtomicU16,
}

impl MbapCodec {
    pub fn new(unit: u8) -> Self {
        Self {
            unit,
            txn: AtomicU16::new(0),
        }
    }
}

impl FrameCodec for MbapCodec {
    fn encode(&self, function: u8, payload: &[u8]) -> Vec<u8> {
        let txn = self.txn.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let len = (2 + payload.len()) as u16;
        let mut out = Vec::with_capacity(MBAP_HEADER + 1 + payload.len());
        out.extend_from_slice(&txn.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&len.to_be_bytes());
        out.push(self.unit);
        out.push(function);
        out.extend_from_slice(payload);
        out
    }

    fn extract(&self, window: &mut ByteWindow) -> Result<Option<Frame>> {
        loop {
            if window.len() < MBAP_HEADER + 1 {
                return Ok(None);
            }
            let (protocol, len) = {
                let u = window.unread();
                (
                    u16::from_be_bytes([u[2], u[3]]),
                    u16::from_be_bytes([u[4], u[5]]) as usize,
                )
            };
            if protocol != 0 || len < 2 || len > MAX_MBAP_LEN {
                log::warn!(
                    "Invalid MBAP header (protocol {}, length {}), resynchronizing",
                    protocol,
                    len
                );
                window.consume(1);
                continue;
            }
            let total = 6 + len;
            if window.len() < total {
                return Ok(None);
            }
            let frame = {
                let u = window.unread();
                Frame {
                    opcode: u[7],
                    status: u[6],
                    payload: u[8..total].to_vec(),
                    checksum: 0,
                }
            };
            window.consume(total);
            return Ok(Some(frame));
        }
    }
}

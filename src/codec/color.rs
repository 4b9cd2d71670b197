//! Framed binary protocol spoken by the PTS and CR instruments.
//!
//! Requests:  `55 AA | opcode | len(4, BE) | payload | sum(2, BE)`
//! Responses: `55 AA | opcode | ack | len(4, BE) | payload | sum(2, BE)`
//!
//! The length field covers the payload plus the two trailing checksum
//! bytes. The checksum is a wrapping 16-bit sum over the four length bytes
//! and every payload byte. An ack of zero means success.

use super::{ByteWindow, CodecError, Frame, FrameCodec, Result};

pub const SYNC: [u8; 2] = [0x55, 0xAA];

/// Identify/handshake opcode.
pub const OP_IDENTIFY: u8 = 0xA1;
/// Trigger-measurement opcode.
pub const OP_MEASURE: u8 = 0xA6;

const REQUEST_HEADER: usize = 7;
const RESPONSE_HEADER: usize = 8;
const MIN_REQUEST: usize = REQUEST_HEADER + 2;
const MIN_RESPONSE: usize = RESPONSE_HEADER + 2;
// Sanity cap on the declared length field; measurement payloads are small.
const MAX_BODY: usize = 64 * 1024;

/// Whether a checksum mismatch rejects the frame.
///
/// The instruments in the field ship firmware that emits checksums not
/// matching the documented sum rule, so `Lenient` (log and accept) is the
/// default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumMode {
    Strict,
    #[default]
    Lenient,
}

/// Wrapping 16-bit sum of all bytes.
pub fn sum16(bytes: &[u8]) -> u16 {
    bytes.iter().fold(0u16, |acc, b| acc.wrapping_add(*b as u16))
}

fn verify_checksum(computed: u16, received: u16, mode: ChecksumMode) -> Result<()> {
    if computed == received {
        return Ok(());
    }
    match mode {
        ChecksumMode::Strict => Err(CodecError::ChecksumMismatch { computed, received }),
        ChecksumMode::Lenient => {
            log::warn!(
                "Accepting frame with bad checksum: computed {:#06x}, received {:#06x}",
                computed,
                received
            );
            Ok(())
        }
    }
}

pub fn encode_request(opcode: u8, payload: &[u8]) -> Vec<u8> {
    let len = (payload.len() + 2) as u32;
    let mut out = Vec::with_capacity(MIN_REQUEST + payload.len());
    out.extend_from_slice(&SYNC);
    out.push(opcode);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    let sum = sum16(&out[3..]);
    out.extend_from_slice(&sum.to_be_bytes());
    out
}

pub fn encode_response(opcode: u8, ack: u8, payload: &[u8]) -> Vec<u8> {
    let len = (payload.len() + 2) as u32;
    let mut out = Vec::with_capacity(MIN_RESPONSE + payload.len());
    out.extend_from_slice(&SYNC);
    out.push(opcode);
    out.push(ack);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    let sum = sum16(&out[4..]);
    out.extend_from_slice(&sum.to_be_bytes());
    out
}

pub fn decode_request(buf: &[u8], mode: ChecksumMode) -> Result<Frame> {
    if buf.len() < MIN_REQUEST {
        return Err(CodecError::MalformedFrame(format!(
            "request too short: {} bytes",
            buf.len()
        )));
    }
    if buf[..2] != SYNC {
        return Err(CodecError::MalformedFrame("bad sync bytes".into()));
    }
    let len = u32::from_be_bytes([buf[3], buf[4], buf[5], buf[6]]) as usize;
    if len < 2 || REQUEST_HEADER + len > buf.len() {
        return Err(CodecError::MalformedFrame(format!(
            "declared length {} exceeds buffer",
            len
        )));
    }
    let payload_end = REQUEST_HEADER + len - 2;
    let received = u16::from_be_bytes([buf[payload_end], buf[payload_end + 1]]);
    verify_checksum(sum16(&buf[3..payload_end]), received, mode)?;
    Ok(Frame {
        opcode: buf[2],
        status: 0,
        payload: buf[REQUEST_HEADER..payload_end].to_vec(),
        checksum: received,
    })
}

pub fn decode_response(buf: &[u8], mode: ChecksumMode) -> Result<Frame> {
    if buf.len() < MIN_RESPONSE {
        return Err(CodecError::MalformedFrame(format!(
            "response too short: {} bytes",
            buf.len()
        )));
    }
    if buf[..2] != SYNC {
        return Err(CodecError::MalformedFrame("bad sync bytes".into()));
    }
    let len = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
    if len < 2 || RESPONSE_HEADER + len > buf.len() {
        return Err(CodecError::MalformedFrame(format!(
            "declared length {} exceeds buffer",
            len
        )));
    }
    let payload_end = RESPONSE_HEADER + len - 2;
    let received = u16::from_be_bytes([buf[payload_end], buf[payload_end + 1]]);
    verify_checksum(sum16(&buf[4..payload_end]), received, mode)?;
    Ok(Frame {
        opcode: buf[2],
        status: buf[3],
        payload: buf[RESPONSE_HEADER..payload_end].to_vec(),
        checksum: received,
    })
}

/// Instrument-protocol codec: encodes requests, extracts responses.
#[derive(Debug, Clone, Copy, Default)]
pub struct ColorCodec {
    mode: ChecksumMode,
}

impl ColorCodec {
    pub fn new(mode: ChecksumMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> ChecksumMode {
        self.mode
    }
}

impl FrameCodec for ColorCodec {
    fn encode(&self, opcode: u8, payload: &[u8]) -> Vec<u8> {
        encode_request(opcode, payload)
    }

    fn extract(&self, window: &mut ByteWindow) -> Result<Option<Frame>> {
        loop {
            if !window.seek_marker(SYNC) {
                return Ok(None);
            }
            if window.len() < RESPONSE_HEADER {
                return Ok(None);
            }
            let len = {
                let u = window.unread();
                u32::from_be_bytes([u[4], u[5], u[6], u[7]]) as usize
            };
            if len < 2 || len > MAX_BODY {
                log::warn!("Implausible frame length {}, resynchronizing", len);
                window.consume(2);
                continue;
            }
            let total = RESPONSE_HEADER + len;
            if window.len() < total {
                // Need more data; nothing consumed
                return Ok(None);
            }
            let (frame, computed) = {
                let u = window.unread();
                let payload_end = RESPONSE_HEADER + len - 2;
                let received = u16::from_be_bytes([u[payload_end], u[payload_end + 1]]);
                let frame = Frame {
                    opcode: u[2],
                    status: u[3],
                    payload: u[RESPONSE_HEADER..payload_end].to_vec(),
                    checksum: received,
                };
                (frame, sum16(&u[4..payload_end]))
            };
            window.consume(total);
            verify_checksum(computed, frame.checksum, self.mode)?;
            return Ok(Some(frame));
        }
    }
}

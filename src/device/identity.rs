//! Instrument identity parsed from the identify/handshake response.

use serde::{Deserialize, Serialize};

use super::{PayloadReader, Result};

/// Answers to the identify opcode. Populated once per successful
/// handshake and discarded on disconnect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentIdentity {
    pub name: String,
    pub model: String,
    pub firmware_version: String,
    pub internal_whiteboard_sn: String,
    pub external_whiteboard_sn: String,
    pub max_storage: u16,
    pub stored_std_count: u16,
    pub stored_sample_count: u16,
    pub white_calibrated: bool,
    pub black_calibrated: bool,
}

impl InstrumentIdentity {
    /// Fixed layout: five length-prefixed strings (name, model, firmware
    /// version, internal and external whiteboard serials), four u16
    /// big-endian counters of which the last is reserved, then the white
    /// and black calibration flags.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut reader = PayloadReader::new(payload);
        let name = reader.prefixed_string()?;
        let model = reader.prefixed_string()?;
        let firmware_version = reader.prefixed_string()?;
        let internal_whiteboard_sn = reader.prefixed_string()?;
        let external_whiteboard_sn = reader.prefixed_string()?;
        let max_storage = reader.u16_be()?;
        let stored_std_count = reader.u16_be()?;
        let stored_sample_count = reader.u16_be()?;
        let _reserved = reader.u16_be()?;
        let white_calibrated = reader.flag()?;
        let black_calibrated = reader.flag()?;
        Ok(Self {
            name,
            model,
            firmware_version,
            internal_whiteboard_sn,
            external_whiteboard_sn,
            max_storage,
            stored_std_count,
            stored_sample_count,
            white_calibrated,
            black_calibrated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceError;

    fn push_str(buf: &mut Vec<u8>, s: &str) {
        buf.push(s.len() as u8);
        buf.extend_from_slice(s.as_bytes());
    }

    fn sample_payload() -> Vec<u8> {
        let mut buf = Vec::new();
        push_str(&mut buf, "CR-10");
        push_str(&mut buf, "CR10-Plus");
        push_str(&mut buf, "2.4.1");
        push_str(&mut buf, "WB-INT-0042");
        push_str(&mut buf, "WB-EXT-0007");
        buf.extend_from_slice(&1000u16.to_be_bytes());
        buf.extend_from_slice(&12u16.to_be_bytes());
        buf.extend_from_slice(&87u16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.push(1);
        buf.push(0);
        buf
    }

    #[test]
    fn test_parse_full_identity() {
        let identity = InstrumentIdentity::parse(&sample_payload()).unwrap();
        assert_eq!(identity.name, "CR-10");
        assert_eq!(identity.model, "CR10-Plus");
        assert_eq!(identity.firmware_version, "2.4.1");
        assert_eq!(identity.internal_whiteboard_sn, "WB-INT-0042");
        assert_eq!(identity.external_whiteboard_sn, "WB-EXT-0007");
        assert_eq!(identity.max_storage, 1000);
        assert_eq!(identity.stored_std_count, 12);
        assert_eq!(identity.stored_sample_count, 87);
        assert!(identity.white_calibrated);
        assert!(!identity.black_calibrated);
    }

    #[test]
    fn test_parse_truncated_payload_fails() {
        let payload = sample_payload();
        for cut in [0, 3, payload.len() - 1] {
            let err = InstrumentIdentity::parse(&payload[..cut]).unwrap_err();
            assert!(matches!(err, DeviceError::MalformedPayload(_)));
        }
    }

    #[test]
    fn test_parse_lying_string_length_fails() {
        // Name claims 200 bytes but the payload ends first
        let mut buf = vec![200u8];
        buf.extend_from_slice(b"short");
        assert!(InstrumentIdentity::parse(&buf).is_err());
    }
}

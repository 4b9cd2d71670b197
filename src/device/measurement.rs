//! Measurement results parsed from measurement responses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{PayloadReader, Result};

/// One measurement. Ownership passes to the caller; drivers do not
/// retain results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementResult {
    pub sample_id: u32,
    pub name: String,
    /// Receipt time; the instruments carry no clock of their own.
    pub timestamp: DateTime<Utc>,
    pub material: String,
    pub optical_structure: String,
    pub instrument_serial: String,
    pub values: Vec<f32>,
}

impl MeasurementResult {
    /// Layout: sample id (u32 BE), three length-prefixed strings (name,
    /// material, optical structure), a u16 BE value count, then that many
    /// f32 BE spectral values. The instrument serial comes from the
    /// handshake identity, not the wire.
    pub fn parse(payload: &[u8], instrument_serial: &str) -> Result<Self> {
        let mut reader = PayloadReader::new(payload);
        let sample_id = reader.u32_be()?;
        let name = reader.prefixed_string()?;
        let material = reader.prefixed_string()?;
        let optical_structure = reader.prefixed_string()?;
        let count = reader.u16_be()? as usize;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(reader.f32_be()?);
        }
        Ok(Self {
            sample_id,
            name,
            timestamp: Utc::now(),
            material,
            optical_structure,
            instrument_serial: instrument_serial.to_string(),
            values,
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

    fn sample_payload(values: &[f32]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&77u32.to_be_bytes());
        push_str(&mut buf, "Sample A");
        push_str(&mut buf, "Plastic");
        push_str(&mut buf, "D65/10");
        buf.extend_from_slice(&(values.len() as u16).to_be_bytes());
        for v in values {
            buf.extend_from_slice(&v.to_be_bytes());
        }
        buf
    }

    #[test]
    fn test_parse_measurement() {
        let values = [31.5f32, 42.25, 0.125];
        let result = MeasurementResult::parse(&sample_payload(&values), "WB-INT-0042").unwrap();
        assert_eq!(result.sample_id, 77);
        assert_eq!(result.name, "Sample A");
        assert_eq!(result.material, "Plastic");
        assert_eq!(result.optical_structure, "D65/10");
        assert_eq!(result.instrument_serial, "WB-INT-0042");
        assert_eq!(result.values, values);
    }

    #[test]
    fn test_parse_empty_value_list() {
        let result = MeasurementResult::parse(&sample_payload(&[]), "sn").unwrap();
        assert!(result.values.is_empty());
    }

    #[test]
    fn test_parse_truncated_values_fails() {
        let mut payload = sample_payload(&[1.0, 2.0]);
        payload.truncate(payload.len() - 2);
        let err = MeasurementResult::parse(&payload, "sn").unwrap_err();
        assert!(matches!(err, DeviceError::MalformedPayload(_)));
    }
}

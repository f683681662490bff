//! Fixed 43-byte telemetry datagram.
//!
//! ```text
//! START (1) | MSG_ID (1) |
//! ACC_X (4) | ACC_Y (4) | ACC_Z (4) |
//! GYRO_X (4) | GYRO_Y (4) | GYRO_Z (4) |
//! PRESSURE (4) | TEMPERATURE (4) | ALTITUDE (4) |
//! CRC32 (4) | END (1)
//! ```
//!
//! Multi-byte fields are little-endian. The CRC covers every byte before
//! the checksum field.

use thiserror::Error;

use crate::checksum::checksum;
use crate::telemetry::{Barometric, TelemetrySample, Vector3};

pub const DATAGRAM_LEN: usize = 43;
pub const START_BYTE: u8 = 0x20;
pub const END_BYTE: u8 = 0x30;

const MSG_ID_OFFSET: usize = 1;
const ACCEL_OFFSET: usize = 2;
const GYRO_OFFSET: usize = 14;
const BARO_OFFSET: usize = 26;
const CRC_OFFSET: usize = 38;
const END_OFFSET: usize = DATAGRAM_LEN - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("framing error: start={start:#04x} end={end:#04x}")]
    FramingError { start: u8, end: u8 },

    #[error("checksum mismatch: computed {expected:#010x}, trailer {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
}

impl DecodeError {
    /// Stable reason code for logs and counters.
    pub fn reason(&self) -> &'static str {
        match self {
            DecodeError::LengthMismatch { .. } => "length_mismatch",
            DecodeError::FramingError { .. } => "framing_error",
            DecodeError::ChecksumMismatch { .. } => "checksum_mismatch",
        }
    }
}

/// Validates and parses one datagram. Checks run in order (length,
/// sentinels, CRC) and stop at the first failure; nothing is returned
/// unless every check passes.
pub fn decode(buf: &[u8]) -> Result<TelemetrySample, DecodeError> {
    if buf.len() != DATAGRAM_LEN {
        return Err(DecodeError::LengthMismatch { expected: DATAGRAM_LEN, actual: buf.len() });
    }

    let (start, end) = (buf[0], buf[END_OFFSET]);
    if start != START_BYTE || end != END_BYTE {
        return Err(DecodeError::FramingError { start, end });
    }

    let expected = checksum(&buf[..CRC_OFFSET]);
    let actual = read_u32(buf, CRC_OFFSET);
    if expected != actual {
        return Err(DecodeError::ChecksumMismatch { expected, actual });
    }

    Ok(TelemetrySample {
        message_id: buf[MSG_ID_OFFSET],
        acceleration: read_vec3(buf, ACCEL_OFFSET),
        angular_rate: read_vec3(buf, GYRO_OFFSET),
        barometric: Barometric {
            pressure: read_f32(buf, BARO_OFFSET),
            temperature: read_f32(buf, BARO_OFFSET + 4),
            altitude: read_f32(buf, BARO_OFFSET + 8),
        },
    })
}

/// Builds the wire form of `sample`, sentinels and CRC included.
pub fn encode(sample: &TelemetrySample) -> [u8; DATAGRAM_LEN] {
    let mut buf = [0u8; DATAGRAM_LEN];
    buf[0] = START_BYTE;
    buf[MSG_ID_OFFSET] = sample.message_id;
    write_vec3(&mut buf, ACCEL_OFFSET, &sample.acceleration);
    write_vec3(&mut buf, GYRO_OFFSET, &sample.angular_rate);
    let b = &sample.barometric;
    for (i, v) in [b.pressure, b.temperature, b.altitude].into_iter().enumerate() {
        buf[BARO_OFFSET + i * 4..BARO_OFFSET + i * 4 + 4].copy_from_slice(&v.to_le_bytes());
    }
    let crc = checksum(&buf[..CRC_OFFSET]);
    buf[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());
    buf[END_OFFSET] = END_BYTE;
    buf
}

// Callers have already checked the length, so these slices are in range.
fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn read_f32(buf: &[u8], at: usize) -> f32 {
    f32::from_bits(read_u32(buf, at))
}

fn read_vec3(buf: &[u8], at: usize) -> Vector3 {
    Vector3::new(read_f32(buf, at), read_f32(buf, at + 4), read_f32(buf, at + 8))
}

fn write_vec3(buf: &mut [u8], at: usize, v: &Vector3) {
    buf[at..at + 4].copy_from_slice(&v.x.to_le_bytes());
    buf[at + 4..at + 8].copy_from_slice(&v.y.to_le_bytes());
    buf[at + 8..at + 12].copy_from_slice(&v.z.to_le_bytes());
}

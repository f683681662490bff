pub mod checksum;
pub mod datagram;
pub mod telemetry;

pub use datagram::{decode, encode, DecodeError, DATAGRAM_LEN, END_BYTE, START_BYTE};
pub use telemetry::{Barometric, TelemetrySample, Vector3};

//! CRC-32 integrity trailer.
//!
//! Reflected polynomial 0xEDB88320, init 0xFFFFFFFF, final XOR 0xFFFFFFFF
//! (CRC-32/ISO-HDLC, the Ethernet/ZIP variant).

use crc::{Crc, CRC_32_ISO_HDLC};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub fn checksum(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

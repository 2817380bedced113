//! 32-bit checksums used by the frame header.
//!
//! Client and server must agree on the variant; nothing on the wire says
//! which one produced a frame.

use crc::{Crc, CRC_32_ISCSI, CRC_32_ISO_HDLC};
use serde::Deserialize;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Checksum algorithm applied to both the size field and the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumKind {
    /// Standard CRC-32 (ISO-HDLC polynomial, as in zlib).
    Crc32,
    /// CRC-32C (Castagnoli polynomial).
    #[default]
    Crc32c,
}

impl ChecksumKind {
    /// Compute the checksum of `data`.
    #[inline]
    pub fn checksum(self, data: &[u8]) -> u32 {
        match self {
            ChecksumKind::Crc32 => CRC32.checksum(data),
            ChecksumKind::Crc32c => CRC32C.checksum(data),
        }
    }
}

impl std::fmt::Display for ChecksumKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChecksumKind::Crc32 => f.write_str("crc32"),
            ChecksumKind::Crc32c => f.write_str("crc32c"),
        }
    }
}

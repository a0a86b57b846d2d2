//! Per-fragment checksums.
//!
//! Each fragment of a call carries a checksum computed over its covered bytes,
//! seeded with the checksum of the previous fragment. The first fragment is
//! seeded with 0. For CRC algorithms the chained value of the last fragment
//! equals the checksum of all covered bytes concatenated.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Checksum algorithm named by the checksum type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ChecksumType {
    /// No checksum. The checksum field is written as zero.
    None,
    /// CRC-32 (IEEE).
    Crc32,
    /// CRC-32C (Castagnoli).
    #[default]
    Crc32C,
}

impl ChecksumType {
    /// Wire code reserved for farmhash, which is not supported.
    pub const FARMHASH_CODE: u8 = 0x02;

    /// Decode a checksum type byte.
    ///
    /// # Errors
    ///
    /// Unknown and unsupported codes are rejected, never treated as `None`.
    pub fn from_code(code: u8) -> Result<Self, ProtocolError> {
        match code {
            0x00 => Ok(ChecksumType::None),
            0x01 => Ok(ChecksumType::Crc32),
            0x03 => Ok(ChecksumType::Crc32C),
            _ => Err(ProtocolError::UnsupportedChecksum { code }),
        }
    }

    /// The one-byte wire code.
    pub const fn code(self) -> u8 {
        match self {
            ChecksumType::None => 0x00,
            ChecksumType::Crc32 => 0x01,
            ChecksumType::Crc32C => 0x03,
        }
    }

    /// Extend a running checksum with `parts`, in order.
    pub fn chain(self, seed: u32, parts: &[&[u8]]) -> u32 {
        match self {
            ChecksumType::None => 0,
            ChecksumType::Crc32 => {
                let mut hasher = crc32fast::Hasher::new_with_initial(seed);
                for part in parts {
                    hasher.update(part);
                }
                hasher.finalize()
            }
            ChecksumType::Crc32C => parts
                .iter()
                .fold(seed, |crc, part| crc32c::crc32c_append(crc, part)),
        }
    }
}

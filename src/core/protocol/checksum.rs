//! Checksum calculation algorithms
//!
//! Every codec takes the record bytes plus a list of byte ranges to leave
//! out (typically the field that carries the checksum itself), so the
//! encoder and the decoder can run the exact same call over the exact same
//! buffer.
//!
//! Supports: additive byte sum, Sum-8/Sum-16, XOR, CRC-16 (Modbus, IBM,
//! CCITT, XMODEM)

use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Checksum algorithm types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChecksumType {
    /// No checksum
    None,
    /// XOR of all bytes
    Xor,
    /// Unsigned sum of all bytes, no modulus applied
    Sum,
    /// Simple sum mod 256
    Sum8,
    /// Simple sum mod 65536
    Sum16,
    /// CRC-16 Modbus (polynomial 0x8005, init 0xFFFF, reflect)
    Crc16Modbus,
    /// CRC-16 IBM / ARC (polynomial 0x8005, init 0x0000, reflect)
    Crc16Ibm,
    /// CRC-16 CCITT (polynomial 0x1021, init 0xFFFF)
    Crc16Ccitt,
    /// CRC-16 XMODEM (polynomial 0x1021, init 0x0000)
    Crc16Xmodem,
}

impl ChecksumType {
    /// Get all available checksum types
    pub fn all() -> &'static [ChecksumType] {
        &[
            ChecksumType::None,
            ChecksumType::Xor,
            ChecksumType::Sum,
            ChecksumType::Sum8,
            ChecksumType::Sum16,
            ChecksumType::Crc16Modbus,
            ChecksumType::Crc16Ibm,
            ChecksumType::Crc16Ccitt,
            ChecksumType::Crc16Xmodem,
        ]
    }

    /// Get name of checksum type
    pub fn name(&self) -> &'static str {
        match self {
            ChecksumType::None => "None",
            ChecksumType::Xor => "XOR",
            ChecksumType::Sum => "Sum",
            ChecksumType::Sum8 => "Sum-8",
            ChecksumType::Sum16 => "Sum-16",
            ChecksumType::Crc16Modbus => "CRC-16/Modbus",
            ChecksumType::Crc16Ibm => "CRC-16/IBM",
            ChecksumType::Crc16Ccitt => "CRC-16/CCITT",
            ChecksumType::Crc16Xmodem => "CRC-16/XMODEM",
        }
    }

    /// Width in bytes of the value as carried inside a record
    pub fn size(&self) -> usize {
        match self {
            ChecksumType::None => 0,
            ChecksumType::Xor | ChecksumType::Sum8 => 1,
            ChecksumType::Sum
            | ChecksumType::Sum16
            | ChecksumType::Crc16Modbus
            | ChecksumType::Crc16Ibm
            | ChecksumType::Crc16Ccitt
            | ChecksumType::Crc16Xmodem => 2,
        }
    }

    /// Mask a computed value to the carried width
    pub fn truncate(&self, value: u32) -> u32 {
        match self.size() {
            0 => 0,
            1 => value & 0xFF,
            _ => value & 0xFFFF,
        }
    }
}

/// Calculate checksum for data, skipping the excluded ranges.
///
/// The result is the raw codec output; [`ChecksumType::Sum`] is not reduced
/// to its carried width here.
pub fn calculate(data: &[u8], exclude: &[Range<usize>], algorithm: ChecksumType) -> u32 {
    match algorithm {
        ChecksumType::None => 0,
        ChecksumType::Xor => u32::from(xor_checksum(data, exclude)),
        ChecksumType::Sum => additive_sum(data, exclude),
        ChecksumType::Sum8 => u32::from(sum8_checksum(data, exclude)),
        ChecksumType::Sum16 => u32::from(sum16_checksum(data, exclude)),
        ChecksumType::Crc16Modbus => u32::from(crc16_modbus(data, exclude)),
        ChecksumType::Crc16Ibm => u32::from(crc16_ibm(data, exclude)),
        ChecksumType::Crc16Ccitt => u32::from(crc16_ccitt(data, exclude)),
        ChecksumType::Crc16Xmodem => u32::from(crc16_xmodem(data, exclude)),
    }
}

/// Compare a computed checksum against the value carried in the record
pub fn verify(data: &[u8], exclude: &[Range<usize>], carried: u32, algorithm: ChecksumType) -> bool {
    algorithm.truncate(calculate(data, exclude, algorithm)) == carried
}

/// Iterate the bytes of `data` that fall outside every excluded range
pub fn covered<'a>(data: &'a [u8], exclude: &'a [Range<usize>]) -> impl Iterator<Item = u8> + 'a {
    data.iter()
        .enumerate()
        .filter(move |(i, _)| !exclude.iter().any(|r| r.contains(i)))
        .map(|(_, &b)| b)
}

/// Checksum carried in the last bytes of a binary record.
///
/// Covers every byte before the carried value except the first
/// `skip_leading` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrailingChecksum {
    /// Algorithm
    pub algorithm: ChecksumType,
    /// Byte order of the carried value
    pub big_endian: bool,
    /// Leading bytes (sync/marker) left out of the sum
    pub skip_leading: usize,
}

impl TrailingChecksum {
    /// Trailing checksum covering the whole record body
    pub fn new(algorithm: ChecksumType) -> Self {
        Self {
            algorithm,
            big_endian: false,
            skip_leading: 0,
        }
    }

    /// Carried value is big-endian
    #[must_use]
    pub fn big_endian(mut self) -> Self {
        self.big_endian = true;
        self
    }

    /// Leave the first `n` bytes out of the sum
    #[must_use]
    pub fn skip_leading(mut self, n: usize) -> Self {
        self.skip_leading = n;
        self
    }

    fn layout(&self, len: usize) -> Option<[Range<usize>; 2]> {
        let size = self.algorithm.size();
        if len < size + self.skip_leading {
            return None;
        }
        Some([0..self.skip_leading, len - size..len])
    }

    /// `(computed, carried)` for a record, `None` if it is too short
    pub fn check(&self, record: &[u8]) -> Option<(u32, u32)> {
        let exclude = self.layout(record.len())?;
        let trailer = &record[exclude[1].clone()];
        let carried = if self.big_endian {
            trailer.iter().fold(0u32, |acc, &b| (acc << 8) | u32::from(b))
        } else {
            trailer.iter().rev().fold(0u32, |acc, &b| (acc << 8) | u32::from(b))
        };
        let computed = self.algorithm.truncate(calculate(record, &exclude, self.algorithm));
        Some((computed, carried))
    }

    /// Whether the carried value matches
    pub fn is_valid(&self, record: &[u8]) -> bool {
        self.check(record).is_some_and(|(computed, carried)| computed == carried)
    }

    /// Append the checksum of `body` to it
    pub fn append(&self, body: &mut Vec<u8>) {
        let size = self.algorithm.size();
        let covered = &body[self.skip_leading.min(body.len())..];
        let value = self.algorithm.truncate(calculate(covered, &[], self.algorithm));
        let bytes = value.to_le_bytes();
        if self.big_endian {
            body.extend(bytes[..size].iter().rev());
        } else {
            body.extend_from_slice(&bytes[..size]);
        }
    }
}

// ============ Individual checksum implementations ============

/// Additive checksum - plain unsigned sum of byte values
pub fn additive_sum(data: &[u8], exclude: &[Range<usize>]) -> u32 {
    covered(data, exclude).fold(0u32, |acc, b| acc.wrapping_add(u32::from(b)))
}

/// XOR checksum - XOR of all bytes
pub fn xor_checksum(data: &[u8], exclude: &[Range<usize>]) -> u8 {
    covered(data, exclude).fold(0u8, |acc, b| acc ^ b)
}

/// Simple 8-bit sum
pub fn sum8_checksum(data: &[u8], exclude: &[Range<usize>]) -> u8 {
    covered(data, exclude).fold(0u8, |acc, b| acc.wrapping_add(b))
}

/// Simple 16-bit sum
pub fn sum16_checksum(data: &[u8], exclude: &[Range<usize>]) -> u16 {
    covered(data, exclude).fold(0u16, |acc, b| acc.wrapping_add(u16::from(b)))
}

/// CRC-16/Modbus
/// Polynomial: 0x8005, Init: 0xFFFF, RefIn: true, RefOut: true, XorOut: 0x0000
pub fn crc16_modbus(data: &[u8], exclude: &[Range<usize>]) -> u16 {
    crc16_reflected(covered(data, exclude), 0xFFFF)
}

/// CRC-16/IBM (CRC-16/ARC)
/// Polynomial: 0x8005, Init: 0x0000, RefIn: true, RefOut: true
pub fn crc16_ibm(data: &[u8], exclude: &[Range<usize>]) -> u16 {
    crc16_reflected(covered(data, exclude), 0x0000)
}

/// CRC-16/CCITT (FALSE)
/// Polynomial: 0x1021, Init: 0xFFFF, RefIn: false, RefOut: false
pub fn crc16_ccitt(data: &[u8], exclude: &[Range<usize>]) -> u16 {
    crc16_msb_first(covered(data, exclude), 0xFFFF)
}

/// CRC-16/XMODEM
/// Polynomial: 0x1021, Init: 0x0000, RefIn: false, RefOut: false
pub fn crc16_xmodem(data: &[u8], exclude: &[Range<usize>]) -> u16 {
    crc16_msb_first(covered(data, exclude), 0x0000)
}

fn crc16_reflected(bytes: impl Iterator<Item = u8>, init: u16) -> u16 {
    let mut crc = init;

    for byte in bytes {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }

    crc
}

fn crc16_msb_first(bytes: impl Iterator<Item = u8>, init: u16) -> u16 {
    let mut crc = init;

    for byte in bytes {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }

    crc
}

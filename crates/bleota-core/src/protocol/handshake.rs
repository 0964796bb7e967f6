//! Handshake parsing.
//!
//! The first message of every session declares the image size. Two forms
//! are accepted:
//!
//! - Legacy: ASCII decimal size, e.g. `1024`.
//! - Sequenced: `<size>:<chunk_count>:<crc32 hex>`, e.g. `1024:4:1c291ca3`.
//!   Chunks then carry a sequence header and the image is CRC-checked.

use std::fmt;

use thiserror::Error;

use super::constants::{HANDSHAKE_SEPARATOR, MAX_HANDSHAKE_LEN};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("Empty handshake")]
    Empty,
    #[error("Handshake too long: {len} bytes, maximum {max}")]
    TooLong { len: usize, max: usize },
    #[error("Handshake is not ASCII text")]
    NotAscii,
    #[error("Invalid size field: {0:?}")]
    InvalidSize(String),
    #[error("Declared size must be greater than zero")]
    ZeroSize,
    #[error("Invalid chunk count field: {0:?}")]
    InvalidChunkCount(String),
    #[error("Invalid checksum field: {0:?}")]
    InvalidChecksum(String),
    #[error("Malformed handshake: expected 1 or 3 fields, got {0}")]
    FieldCount(usize),
}

/// Integrity parameters announced by a sequenced handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Integrity {
    /// Number of data chunks the sender will write.
    pub chunk_count: u32,
    /// CRC-32 (IEEE) of the whole image.
    pub crc32: u32,
}

/// Parsed handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    /// Total image size in bytes.
    pub expected_size: u64,
    /// Present when the sender uses sequenced framing.
    pub integrity: Option<Integrity>,
}

impl Handshake {
    /// Legacy handshake declaring only the size.
    pub fn legacy(expected_size: u64) -> Self {
        Self {
            expected_size,
            integrity: None,
        }
    }

    /// Sequenced handshake.
    pub fn sequenced(expected_size: u64, chunk_count: u32, crc32: u32) -> Self {
        Self {
            expected_size,
            integrity: Some(Integrity { chunk_count, crc32 }),
        }
    }

    pub fn is_sequenced(&self) -> bool {
        self.integrity.is_some()
    }

    /// Parse a raw inbound message.
    pub fn parse(message: &[u8]) -> Result<Self, HandshakeError> {
        if message.len() > MAX_HANDSHAKE_LEN {
            return Err(HandshakeError::TooLong {
                len: message.len(),
                max: MAX_HANDSHAKE_LEN,
            });
        }

        // Phone apps commonly append a newline or a C string terminator.
        let text = std::str::from_utf8(message).map_err(|_| HandshakeError::NotAscii)?;
        let text = text.trim_end_matches('\0').trim();
        if text.is_empty() {
            return Err(HandshakeError::Empty);
        }
        if !text.is_ascii() {
            return Err(HandshakeError::NotAscii);
        }

        let fields: Vec<&str> = text.split(HANDSHAKE_SEPARATOR).collect();
        match fields.as_slice() {
            [size] => Ok(Self::legacy(parse_size(size)?)),
            [size, count, crc] => {
                let expected_size = parse_size(size)?;
                let chunk_count = parse_decimal(count)
                    .and_then(|v| u32::try_from(v).ok())
                    .filter(|&c| c > 0)
                    .ok_or_else(|| HandshakeError::InvalidChunkCount(count.to_string()))?;
                if crc.is_empty() || crc.len() > 8 || !crc.bytes().all(|b| b.is_ascii_hexdigit()) {
                    return Err(HandshakeError::InvalidChecksum(crc.to_string()));
                }
                let crc32 = u32::from_str_radix(crc, 16)
                    .map_err(|_| HandshakeError::InvalidChecksum(crc.to_string()))?;
                Ok(Self::sequenced(expected_size, chunk_count, crc32))
            }
            other => Err(HandshakeError::FieldCount(other.len())),
        }
    }

    /// Encode as the wire message a sender writes.
    pub fn to_message(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.integrity {
            None => write!(f, "{}", self.expected_size),
            Some(Integrity { chunk_count, crc32 }) => write!(
                f,
                "{}{sep}{}{sep}{:08x}",
                self.expected_size,
                chunk_count,
                crc32,
                sep = HANDSHAKE_SEPARATOR
            ),
        }
    }
}

/// Digits only: `str::parse` would also take a leading `+`.
fn parse_decimal(field: &str) -> Option<u64> {
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    field.parse().ok()
}

fn parse_size(field: &str) -> Result<u64, HandshakeError> {
    match parse_decimal(field) {
        Some(0) => Err(HandshakeError::ZeroSize),
        Some(size) => Ok(size),
        None => Err(HandshakeError::InvalidSize(field.to_string())),
    }
}

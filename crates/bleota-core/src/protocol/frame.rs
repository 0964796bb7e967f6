//! Sequenced chunk framing.
//!
//! ```text
//! +----------------+---------------------+
//! | seq (u32 LE)   | payload (N bytes)   |
//! +----------------+---------------------+
//! ```
//!
//! Legacy sessions carry the payload bare, without the header.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use thiserror::Error;

use super::constants::SEQ_HEADER_LEN;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame too short: {actual} bytes, header needs 4")]
    TooShort { actual: usize },
}

/// A borrowed view of one sequenced chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequencedFrame<'a> {
    pub seq: u32,
    pub payload: &'a [u8],
}

impl<'a> SequencedFrame<'a> {
    /// Split a raw message into header and payload.
    pub fn parse(message: &'a [u8]) -> Result<Self, FrameError> {
        if message.len() < SEQ_HEADER_LEN {
            return Err(FrameError::TooShort {
                actual: message.len(),
            });
        }
        let (header, payload) = message.split_at(SEQ_HEADER_LEN);
        Ok(Self {
            seq: LittleEndian::read_u32(header),
            payload,
        })
    }
}

/// Build a sequenced chunk message.
pub fn encode_sequenced(seq: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(SEQ_HEADER_LEN + payload.len());
    // Writing into a Vec cannot fail.
    let _ = out.write_u32::<LittleEndian>(seq);
    out.extend_from_slice(payload);
    out
}

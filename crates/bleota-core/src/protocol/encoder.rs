//! Sender-side transfer planning.
//!
//! Splits an image into the message sequence a sender writes to the
//! inbound characteristic: one handshake followed by data chunks, each
//! bounded by the transport's payload limit.

use thiserror::Error;

use super::constants::SEQ_HEADER_LEN;
use super::frame::encode_sequenced;
use super::handshake::Handshake;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("Image is empty")]
    EmptyImage,
    #[error("Message limit {limit} leaves no room for payload")]
    LimitTooSmall { limit: usize },
    #[error("Image needs {chunks} chunks, more than a u32 sequence can address")]
    TooManyChunks { chunks: usize },
}

/// Chunk framing used for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    /// Bare payload; completion by byte count.
    #[default]
    Legacy,
    /// Sequence header per chunk plus whole-image CRC-32.
    Sequenced,
}

/// Message plan for one image.
#[derive(Debug)]
pub struct TransferPlan<'a> {
    image: &'a [u8],
    payload_len: usize,
    framing: Framing,
}

impl<'a> TransferPlan<'a> {
    /// Plan a transfer whose messages never exceed `max_message_len`.
    pub fn new(image: &'a [u8], max_message_len: usize, framing: Framing) -> Result<Self, PlanError> {
        if image.is_empty() {
            return Err(PlanError::EmptyImage);
        }
        let overhead = match framing {
            Framing::Legacy => 0,
            Framing::Sequenced => SEQ_HEADER_LEN,
        };
        if max_message_len <= overhead {
            return Err(PlanError::LimitTooSmall {
                limit: max_message_len,
            });
        }
        let plan = Self {
            image,
            payload_len: max_message_len - overhead,
            framing,
        };
        let chunks = plan.chunk_count();
        if u32::try_from(chunks).is_err() {
            return Err(PlanError::TooManyChunks { chunks });
        }
        Ok(plan)
    }

    /// Number of data chunks (the handshake is not counted).
    pub fn chunk_count(&self) -> usize {
        self.image.len().div_ceil(self.payload_len)
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Payload bytes per chunk (last chunk may be shorter).
    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    pub fn handshake(&self) -> Handshake {
        let size = self.image.len() as u64;
        match self.framing {
            Framing::Legacy => Handshake::legacy(size),
            Framing::Sequenced => Handshake::sequenced(
                size,
                self.chunk_count() as u32,
                crc32fast::hash(self.image),
            ),
        }
    }

    /// Iterate over the data chunk messages in send order.
    pub fn chunks(&self) -> ChunkMessages<'a> {
        ChunkMessages {
            pieces: self.image.chunks(self.payload_len),
            framing: self.framing,
            seq: 0,
        }
    }

    /// Handshake followed by every chunk.
    pub fn messages(&self) -> Vec<Vec<u8>> {
        std::iter::once(self.handshake().to_message())
            .chain(self.chunks())
            .collect()
    }
}

/// Iterator over framed chunk messages.
pub struct ChunkMessages<'a> {
    pieces: std::slice::Chunks<'a, u8>,
    framing: Framing,
    seq: u32,
}

impl Iterator for ChunkMessages<'_> {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        let piece = self.pieces.next()?;
        let message = match self.framing {
            Framing::Legacy => piece.to_vec(),
            Framing::Sequenced => encode_sequenced(self.seq, piece),
        };
        self.seq = self.seq.wrapping_add(1);
        Some(message)
    }
}

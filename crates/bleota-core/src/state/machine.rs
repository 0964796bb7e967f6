//! Transfer session state machine.
//!
//! Turns the inbound message stream (one handshake, then data chunks)
//! into a byte-exact staged image.

use std::fmt;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::protocol::{FrameError, Handshake, HandshakeError, Integrity, SequencedFrame};
use crate::storage::{StagingStore, StorageError};
use crate::writer::ChunkWriter;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Invalid handshake: {0}")]
    InvalidHandshake(#[from] HandshakeError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Chunk of {len} bytes overflows declared size ({received}/{expected})")]
    Overflow { len: u64, received: u64, expected: u64 },

    #[error("Malformed chunk: {0}")]
    Frame(#[from] FrameError),

    #[error("Out-of-order chunk: expected seq {expected}, got {actual}")]
    SequenceMismatch { expected: u32, actual: u32 },

    #[error("Chunk count mismatch: declared {declared}, received {received}")]
    ChunkCountMismatch { declared: u32, received: u32 },

    #[error("Checksum mismatch: expected 0x{expected:08X}, got 0x{actual:08X}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("Transfer already complete")]
    AlreadyComplete,
}

impl SessionError {
    /// Whether the session must be reset after this error.
    ///
    /// A rejected handshake leaves the session waiting for another one.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionError::InvalidHandshake(_))
    }
}

/// Session phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferPhase {
    /// Next message is a size declaration.
    #[default]
    AwaitingHandshake,
    /// Data chunks are being appended.
    Receiving,
    /// Every declared byte has been staged.
    Complete,
}

impl fmt::Display for TransferPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferPhase::AwaitingHandshake => write!(f, "AWAITING_HANDSHAKE"),
            TransferPhase::Receiving => write!(f, "RECEIVING"),
            TransferPhase::Complete => write!(f, "COMPLETE"),
        }
    }
}

/// Result of ingesting one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    HandshakeAccepted { expected_size: u64, sequenced: bool },
    ChunkAccepted { received: u64, expected: u64 },
    TransferComplete { total: u64 },
}

/// Sequence and CRC tracking for sequenced sessions.
struct IntegrityTracker {
    declared: Integrity,
    next_seq: u32,
    hasher: crc32fast::Hasher,
}

impl IntegrityTracker {
    fn new(declared: Integrity) -> Self {
        Self {
            declared,
            next_seq: 0,
            hasher: crc32fast::Hasher::new(),
        }
    }
}

/// One OTA transfer session.
pub struct TransferSession<S: StagingStore> {
    phase: TransferPhase,
    expected_size: u64,
    received_bytes: u64,
    segment_index: u64,
    integrity: Option<IntegrityTracker>,
    writer: Option<ChunkWriter<S::Writer>>,
}

impl<S: StagingStore> Default for TransferSession<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: StagingStore> TransferSession<S> {
    pub fn new() -> Self {
        Self {
            phase: TransferPhase::AwaitingHandshake,
            expected_size: 0,
            received_bytes: 0,
            segment_index: 0,
            integrity: None,
            writer: None,
        }
    }

    pub fn phase(&self) -> TransferPhase {
        self.phase
    }

    pub fn expected_size(&self) -> u64 {
        self.expected_size
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    pub fn segment_index(&self) -> u64 {
        self.segment_index
    }

    pub fn is_sequenced(&self) -> bool {
        self.integrity.is_some()
    }

    pub fn is_receiving(&self) -> bool {
        self.phase == TransferPhase::Receiving
    }

    fn goto_phase(&mut self, phase: TransferPhase) {
        info!(from = %self.phase, to = %phase, "Session transition");
        self.phase = phase;
    }

    /// Process one inbound message.
    ///
    /// On any error the counters are left exactly as they were before
    /// the message, except when the image was fully written and only
    /// failed its integrity check.
    pub fn ingest(&mut self, message: &[u8], store: &mut S) -> Result<IngestOutcome, SessionError> {
        match self.phase {
            TransferPhase::AwaitingHandshake => self.accept_handshake(message, store),
            TransferPhase::Receiving => self.accept_chunk(message),
            TransferPhase::Complete => Err(SessionError::AlreadyComplete),
        }
    }

    fn accept_handshake(
        &mut self,
        message: &[u8],
        store: &mut S,
    ) -> Result<IngestOutcome, SessionError> {
        let handshake = Handshake::parse(message).inspect_err(|e| {
            warn!(error = %e, len = message.len(), "Rejected handshake");
        })?;

        let writer = ChunkWriter::new(store.create()?);
        self.writer = Some(writer);
        self.expected_size = handshake.expected_size;
        self.received_bytes = 0;
        self.integrity = handshake.integrity.map(IntegrityTracker::new);
        self.segment_index += 1;
        self.goto_phase(TransferPhase::Receiving);

        info!(
            expected_size = self.expected_size,
            sequenced = handshake.is_sequenced(),
            "Handshake accepted"
        );
        Ok(IngestOutcome::HandshakeAccepted {
            expected_size: self.expected_size,
            sequenced: handshake.is_sequenced(),
        })
    }

    fn accept_chunk(&mut self, message: &[u8]) -> Result<IngestOutcome, SessionError> {
        let payload = match &self.integrity {
            None => message,
            Some(tracker) => {
                let frame = SequencedFrame::parse(message)?;
                if frame.seq != tracker.next_seq {
                    return Err(SessionError::SequenceMismatch {
                        expected: tracker.next_seq,
                        actual: frame.seq,
                    });
                }
                if tracker.next_seq >= tracker.declared.chunk_count {
                    return Err(SessionError::ChunkCountMismatch {
                        declared: tracker.declared.chunk_count,
                        received: tracker.next_seq.saturating_add(1),
                    });
                }
                frame.payload
            }
        };

        let len = payload.len() as u64;
        if self.received_bytes + len > self.expected_size {
            return Err(SessionError::Overflow {
                len,
                received: self.received_bytes,
                expected: self.expected_size,
            });
        }

        let writer = self.writer.as_mut().ok_or(StorageError::Missing)?;
        writer.append(payload)?;

        self.received_bytes += len;
        self.segment_index += 1;
        if let Some(tracker) = self.integrity.as_mut() {
            tracker.hasher.update(payload);
            tracker.next_seq += 1;
        }
        debug!(
            segment = self.segment_index,
            received = self.received_bytes,
            expected = self.expected_size,
            "Chunk accepted"
        );

        if self.received_bytes == self.expected_size {
            return self.complete();
        }
        if let Some(tracker) = &self.integrity
            && tracker.next_seq == tracker.declared.chunk_count
        {
            return Err(SessionError::ChunkCountMismatch {
                declared: tracker.declared.chunk_count,
                received: tracker.next_seq,
            });
        }

        Ok(IngestOutcome::ChunkAccepted {
            received: self.received_bytes,
            expected: self.expected_size,
        })
    }

    fn complete(&mut self) -> Result<IngestOutcome, SessionError> {
        if let Some(tracker) = &self.integrity {
            if tracker.next_seq != tracker.declared.chunk_count {
                return Err(SessionError::ChunkCountMismatch {
                    declared: tracker.declared.chunk_count,
                    received: tracker.next_seq,
                });
            }
            let actual = tracker.hasher.clone().finalize();
            if actual != tracker.declared.crc32 {
                return Err(SessionError::ChecksumMismatch {
                    expected: tracker.declared.crc32,
                    actual,
                });
            }
        }

        if let Some(writer) = self.writer.take() {
            writer.close()?;
        }
        self.goto_phase(TransferPhase::Complete);
        Ok(IngestOutcome::TransferComplete {
            total: self.received_bytes,
        })
    }

    /// Return to `AwaitingHandshake`, releasing the staging handle.
    ///
    /// The staged image itself is left in the store.
    pub fn reset(&mut self) {
        if self.phase != TransferPhase::AwaitingHandshake {
            self.goto_phase(TransferPhase::AwaitingHandshake);
        }
        self.writer = None;
        self.integrity = None;
        self.expected_size = 0;
        self.received_bytes = 0;
        self.segment_index = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Framing, TransferPlan, encode_sequenced};
    use crate::storage::MemoryStagingStore;

    type Session = TransferSession<MemoryStagingStore>;

    fn image(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn test_chunks_concatenate_in_order() {
        let mut store = MemoryStagingStore::default();
        let mut session = Session::new();
        let data = image(1000);

        session.ingest(b"1000", &mut store).unwrap();
        let mut offset = 0;
        for len in [1, 99, 300, 17, 583] {
            session.ingest(&data[offset..offset + len], &mut store).unwrap();
            offset += len;
        }

        assert_eq!(session.phase(), TransferPhase::Complete);
        assert_eq!(session.received_bytes(), 1000);
        assert_eq!(session.segment_index(), 6);
        assert_eq!(store.staged().unwrap(), data);
    }

    #[test]
    fn test_completion_only_on_last_chunk() {
        let mut store = MemoryStagingStore::default();
        let mut session = Session::new();

        assert_eq!(
            session.ingest(b"100", &mut store).unwrap(),
            IngestOutcome::HandshakeAccepted {
                expected_size: 100,
                sequenced: false
            }
        );
        assert_eq!(
            session.ingest(&[1u8; 60], &mut store).unwrap(),
            IngestOutcome::ChunkAccepted {
                received: 60,
                expected: 100
            }
        );
        assert_eq!(session.phase(), TransferPhase::Receiving);
        assert_eq!(
            session.ingest(&[2u8; 40], &mut store).unwrap(),
            IngestOutcome::TransferComplete { total: 100 }
        );
        assert!(matches!(
            session.ingest(&[3u8; 1], &mut store),
            Err(SessionError::AlreadyComplete)
        ));
    }

    #[test]
    fn test_invalid_handshake_keeps_waiting() {
        let mut store = MemoryStagingStore::default();
        let mut session = Session::new();

        let err = session.ingest(b"abc", &mut store).unwrap_err();
        assert!(matches!(err, SessionError::InvalidHandshake(_)));
        assert!(!err.is_terminal());
        assert_eq!(session.phase(), TransferPhase::AwaitingHandshake);
        assert_eq!(session.segment_index(), 0);
        assert!(store.staged().is_none());

        session.ingest(b"10", &mut store).unwrap();
        assert_eq!(session.phase(), TransferPhase::Receiving);
        assert_eq!(session.segment_index(), 1);
    }

    #[test]
    fn test_overflow_rejected_without_writing() {
        let mut store = MemoryStagingStore::default();
        let mut session = Session::new();
        session.ingest(b"10", &mut store).unwrap();
        session.ingest(&[0u8; 6], &mut store).unwrap();

        let err = session.ingest(&[0u8; 5], &mut store).unwrap_err();
        assert!(matches!(err, SessionError::Overflow { len: 5, .. }));
        assert_eq!(session.received_bytes(), 6);
        assert_eq!(session.segment_index(), 2);
        assert_eq!(store.staged().unwrap().len(), 6);
    }

    #[test]
    fn test_storage_error_does_not_advance() {
        let mut store = MemoryStagingStore::default();
        let mut session = Session::new();
        session.ingest(b"10", &mut store).unwrap();
        session.ingest(&[0u8; 4], &mut store).unwrap();

        store.fail_appends(true);
        let err = session.ingest(&[0u8; 4], &mut store).unwrap_err();
        assert!(matches!(err, SessionError::Storage(_)));
        assert!(err.is_terminal());
        assert_eq!(session.received_bytes(), 4);
        assert_eq!(session.segment_index(), 2);
    }

    #[test]
    fn test_reset_allows_new_handshake() {
        let mut store = MemoryStagingStore::default();
        let mut session = Session::new();
        session.ingest(b"10", &mut store).unwrap();
        session.ingest(&[0u8; 4], &mut store).unwrap();

        session.reset();
        assert_eq!(session.phase(), TransferPhase::AwaitingHandshake);
        assert_eq!(session.segment_index(), 0);
        assert_eq!(session.received_bytes(), 0);

        session.ingest(b"4", &mut store).unwrap();
        assert_eq!(store.staged().unwrap(), Vec::<u8>::new());
        assert_eq!(
            session.ingest(&[9u8; 4], &mut store).unwrap(),
            IngestOutcome::TransferComplete { total: 4 }
        );
    }

    #[test]
    fn test_sequenced_transfer() {
        let mut store = MemoryStagingStore::default();
        let mut session = Session::new();
        let data = image(700);
        let plan = TransferPlan::new(&data, 244, Framing::Sequenced).unwrap();

        let mut last = None;
        for msg in plan.messages() {
            last = Some(session.ingest(&msg, &mut store).unwrap());
        }
        assert!(session.is_sequenced());
        assert_eq!(last, Some(IngestOutcome::TransferComplete { total: 700 }));
        assert_eq!(store.staged().unwrap(), data);
    }

    #[test]
    fn test_sequenced_out_of_order() {
        let mut store = MemoryStagingStore::default();
        let mut session = Session::new();
        let data = image(8);
        let hs = Handshake::sequenced(8, 2, crc32fast::hash(&data));

        session.ingest(&hs.to_message(), &mut store).unwrap();
        let err = session
            .ingest(&encode_sequenced(1, &data[4..]), &mut store)
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::SequenceMismatch {
                expected: 0,
                actual: 1
            }
        ));
        assert_eq!(session.received_bytes(), 0);
    }

    #[test]
    fn test_sequenced_checksum_mismatch() {
        let mut store = MemoryStagingStore::default();
        let mut session = Session::new();
        let data = image(8);
        let hs = Handshake::sequenced(8, 2, crc32fast::hash(&data) ^ 1);

        session.ingest(&hs.to_message(), &mut store).unwrap();
        session
            .ingest(&encode_sequenced(0, &data[..4]), &mut store)
            .unwrap();
        let err = session
            .ingest(&encode_sequenced(1, &data[4..]), &mut store)
            .unwrap_err();
        assert!(matches!(err, SessionError::ChecksumMismatch { .. }));
        assert_ne!(session.phase(), TransferPhase::Complete);
    }

    #[test]
    fn test_sequenced_chunk_count_mismatch() {
        let mut store = MemoryStagingStore::default();
        let mut session = Session::new();
        let data = image(8);
        let hs = Handshake::sequenced(8, 1, crc32fast::hash(&data));

        session.ingest(&hs.to_message(), &mut store).unwrap();
        let err = session
            .ingest(&encode_sequenced(0, &data[..4]), &mut store)
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::ChunkCountMismatch {
                declared: 1,
                received: 1
            }
        ));
    }
}

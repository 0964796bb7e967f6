//! Chunk writer: owns the staged image handle for one session.

use std::io::{ErrorKind, Write};

use tracing::trace;

use crate::storage::StorageError;

/// Appends chunk payloads to the staged image.
///
/// The handle stays open for the whole session and is released by
/// [`ChunkWriter::close`] or by dropping the writer.
#[derive(Debug)]
pub struct ChunkWriter<W: Write> {
    handle: W,
    bytes_written: u64,
}

impl<W: Write> ChunkWriter<W> {
    pub fn new(handle: W) -> Self {
        Self {
            handle,
            bytes_written: 0,
        }
    }

    /// Append `bytes` and flush them to the store.
    ///
    /// Returns the number of bytes appended, always `bytes.len()` on success.
    pub fn append(&mut self, bytes: &[u8]) -> Result<usize, StorageError> {
        let mut written = 0;
        while written < bytes.len() {
            match self.handle.write(&bytes[written..]) {
                Ok(0) => {
                    return Err(StorageError::ShortWrite {
                        requested: bytes.len(),
                        written,
                    });
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        self.handle.flush()?;
        self.bytes_written += bytes.len() as u64;
        trace!(len = bytes.len(), total = self.bytes_written, "Chunk appended");
        Ok(bytes.len())
    }

    /// Flush and release the handle.
    pub fn close(mut self) -> Result<u64, StorageError> {
        self.handle.flush()?;
        Ok(self.bytes_written)
    }
}

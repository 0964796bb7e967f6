//! In-memory storage collaborators for testing.

use std::io::{self, Cursor, Write};
use std::sync::{Arc, Mutex};

use super::traits::{FlashError, FlashTarget, StagingStore, StorageError};

#[derive(Debug, Default)]
struct StagingInner {
    staged: Option<Vec<u8>>,
    capacity: u64,
    fail_appends: bool,
    removals: usize,
}

/// Mock staging store backed by a shared buffer.
///
/// Clones share state, so a test can keep one handle while the
/// receiver owns another.
#[derive(Debug, Clone)]
pub struct MemoryStagingStore {
    inner: Arc<Mutex<StagingInner>>,
}

impl MemoryStagingStore {
    pub fn new(capacity: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StagingInner {
                capacity,
                ..Default::default()
            })),
        }
    }

    /// Simulate an image left behind by an interrupted session.
    pub fn with_leftover(self, bytes: &[u8]) -> Self {
        self.inner.lock().unwrap().staged = Some(bytes.to_vec());
        self
    }

    /// Current staged image contents.
    pub fn staged(&self) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().staged.clone()
    }

    /// Make every subsequent append fail with an I/O error.
    pub fn fail_appends(&self, fail: bool) {
        self.inner.lock().unwrap().fail_appends = fail;
    }

    /// Number of successful removals.
    pub fn removals(&self) -> usize {
        self.inner.lock().unwrap().removals
    }
}

impl Default for MemoryStagingStore {
    fn default() -> Self {
        Self::new(1024 * 1024)
    }
}

/// Append handle into a [`MemoryStagingStore`].
pub struct MemoryAppender {
    inner: Arc<Mutex<StagingInner>>,
}

impl Write for MemoryAppender {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_appends {
            return Err(io::Error::other("injected append failure"));
        }
        let capacity = inner.capacity;
        let staged = inner
            .staged
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "staged image removed"))?;
        let room = capacity.saturating_sub(staged.len() as u64) as usize;
        let n = buf.len().min(room);
        staged.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl StagingStore for MemoryStagingStore {
    type Writer = MemoryAppender;
    type Reader = Cursor<Vec<u8>>;

    fn create(&mut self) -> Result<Self::Writer, StorageError> {
        self.inner.lock().unwrap().staged = Some(Vec::new());
        Ok(MemoryAppender {
            inner: Arc::clone(&self.inner),
        })
    }

    fn open_read(&mut self) -> Result<Self::Reader, StorageError> {
        self.inner
            .lock()
            .unwrap()
            .staged
            .clone()
            .map(Cursor::new)
            .ok_or(StorageError::Missing)
    }

    fn staged_size(&self) -> Result<Option<u64>, StorageError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .staged
            .as_ref()
            .map(|s| s.len() as u64))
    }

    fn remove(&mut self) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock().unwrap();
        let existed = inner.staged.take().is_some();
        if existed {
            inner.removals += 1;
        }
        Ok(existed)
    }

    fn total_bytes(&self) -> u64 {
        self.inner.lock().unwrap().capacity
    }

    fn used_bytes(&self) -> u64 {
        self.staged_size().ok().flatten().unwrap_or(0)
    }
}

#[derive(Debug)]
struct FlashInner {
    capacity: u64,
    image: Vec<u8>,
    open_size: Option<u64>,
    write_limit: Option<usize>,
    begin_error: Option<FlashError>,
    finalize_result: Result<bool, FlashError>,
    finalized: bool,
    aborted: bool,
    begin_calls: usize,
}

/// Mock flash primitive with fault injection.
#[derive(Debug, Clone)]
pub struct MockFlash {
    inner: Arc<Mutex<FlashInner>>,
}

impl MockFlash {
    pub fn new(capacity: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FlashInner {
                capacity,
                image: Vec::new(),
                open_size: None,
                write_limit: None,
                begin_error: None,
                finalize_result: Ok(true),
                finalized: false,
                aborted: false,
                begin_calls: 0,
            })),
        }
    }

    /// Accept at most `total` bytes over the whole update, then short-write.
    pub fn limit_writes(&self, total: usize) {
        self.inner.lock().unwrap().write_limit = Some(total);
    }

    /// Fail `begin` with the given error.
    pub fn fail_begin(&self, err: FlashError) {
        self.inner.lock().unwrap().begin_error = Some(err);
    }

    /// Override what `finalize` reports.
    pub fn set_finalize_result(&self, result: Result<bool, FlashError>) {
        self.inner.lock().unwrap().finalize_result = result;
    }

    /// Bytes programmed so far.
    pub fn image(&self) -> Vec<u8> {
        self.inner.lock().unwrap().image.clone()
    }

    pub fn is_finalized(&self) -> bool {
        self.inner.lock().unwrap().finalized
    }

    pub fn was_aborted(&self) -> bool {
        self.inner.lock().unwrap().aborted
    }

    pub fn begin_calls(&self) -> usize {
        self.inner.lock().unwrap().begin_calls
    }
}

impl FlashTarget for MockFlash {
    fn capacity(&self) -> u64 {
        self.inner.lock().unwrap().capacity
    }

    fn begin(&mut self, image_size: u64) -> Result<(), FlashError> {
        let mut inner = self.inner.lock().unwrap();
        inner.begin_calls += 1;
        if let Some(err) = inner.begin_error.clone() {
            return Err(err);
        }
        if image_size > inner.capacity {
            return Err(FlashError::InsufficientSpace {
                requested: image_size,
                available: inner.capacity,
            });
        }
        inner.image.clear();
        inner.open_size = Some(image_size);
        inner.finalized = false;
        inner.aborted = false;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, FlashError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.open_size.is_none() {
            return Err(FlashError::NotStarted);
        }
        let n = match inner.write_limit {
            Some(limit) => data.len().min(limit.saturating_sub(inner.image.len())),
            None => data.len(),
        };
        inner.image.extend_from_slice(&data[..n]);
        Ok(n)
    }

    fn finalize(&mut self) -> Result<bool, FlashError> {
        let mut inner = self.inner.lock().unwrap();
        let size = inner.open_size.take().ok_or(FlashError::NotStarted)?;
        let complete = inner.finalize_result.clone()? && inner.image.len() as u64 == size;
        inner.finalized = complete;
        Ok(complete)
    }

    fn abort(&mut self) {
        let mut inner = self.inner.lock().unwrap();
        inner.open_size = None;
        inner.aborted = true;
    }
}

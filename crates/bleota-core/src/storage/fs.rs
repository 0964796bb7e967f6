//! Filesystem-backed storage collaborators.
//!
//! `FsStagingStore` keeps the staged image as a single file inside a
//! directory and emulates a fixed-size partition. `FileFlash` programs
//! an update "partition" file, which lets the whole receiver run on a host.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::traits::{FlashError, FlashTarget, StagingStore, StorageError};
use crate::protocol::constants::STAGING_FILE_NAME;

/// Staging store living in a directory on a host filesystem.
#[derive(Debug, Clone)]
pub struct FsStagingStore {
    dir: PathBuf,
    file_name: String,
    capacity: u64,
}

impl FsStagingStore {
    /// Open (and create if needed) the staging directory.
    pub fn open<P: AsRef<Path>>(dir: P, capacity: u64) -> Result<Self, StorageError> {
        Self::with_file_name(dir, STAGING_FILE_NAME, capacity)
    }

    pub fn with_file_name<P: AsRef<Path>>(
        dir: P,
        file_name: &str,
        capacity: u64,
    ) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            file_name: file_name.to_string(),
            capacity,
        })
    }

    /// Location of the staged image.
    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.file_name)
    }
}

/// Append handle for the staged image file.
///
/// Writes stop at the emulated partition capacity; `flush` makes the
/// appended bytes durable.
#[derive(Debug)]
pub struct FsAppender {
    file: File,
    len: u64,
    capacity: u64,
}

impl Write for FsAppender {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let room = self.capacity.saturating_sub(self.len);
        let n = buf.len().min(usize::try_from(room).unwrap_or(usize::MAX));
        if n == 0 {
            return Ok(0);
        }
        let written = self.file.write(&buf[..n])?;
        self.len += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.file.sync_data()
    }
}

impl StagingStore for FsStagingStore {
    type Writer = FsAppender;
    type Reader = BufReader<File>;

    fn create(&mut self) -> Result<Self::Writer, StorageError> {
        let path = self.path();
        File::create(&path)?;
        let file = OpenOptions::new().append(true).open(&path)?;
        debug!(path = %path.display(), "Created staged image");
        Ok(FsAppender {
            file,
            len: 0,
            capacity: self.capacity,
        })
    }

    fn open_read(&mut self) -> Result<Self::Reader, StorageError> {
        match File::open(self.path()) {
            Ok(file) => Ok(BufReader::new(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StorageError::Missing),
            Err(e) => Err(e.into()),
        }
    }

    fn staged_size(&self) -> Result<Option<u64>, StorageError> {
        match fs::metadata(self.path()) {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn remove(&mut self) -> Result<bool, StorageError> {
        match fs::remove_file(self.path()) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn total_bytes(&self) -> u64 {
        self.capacity
    }

    fn used_bytes(&self) -> u64 {
        self.staged_size().ok().flatten().unwrap_or(0)
    }
}

/// Flash target programming an update partition file.
#[derive(Debug)]
pub struct FileFlash {
    path: PathBuf,
    capacity: u64,
    magic: Option<u8>,
    open: Option<OpenUpdate>,
}

#[derive(Debug)]
struct OpenUpdate {
    file: File,
    expected: u64,
    written: u64,
    first_byte: Option<u8>,
}

/// Vendor code for host I/O failures.
const FILE_FLASH_IO_ERROR: i32 = 1;

impl FileFlash {
    pub fn new<P: AsRef<Path>>(path: P, capacity: u64) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            capacity,
            magic: None,
            open: None,
        }
    }

    /// Require the image to start with `magic` for `finalize` to accept it.
    pub fn with_magic(mut self, magic: u8) -> Self {
        self.magic = Some(magic);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn io_failure(e: io::Error) -> FlashError {
    warn!(error = %e, "Flash partition I/O failed");
    FlashError::Vendor {
        code: FILE_FLASH_IO_ERROR,
    }
}

impl FlashTarget for FileFlash {
    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn begin(&mut self, image_size: u64) -> Result<(), FlashError> {
        if image_size > self.capacity {
            return Err(FlashError::InsufficientSpace {
                requested: image_size,
                available: self.capacity,
            });
        }
        let file = File::create(&self.path).map_err(io_failure)?;
        self.open = Some(OpenUpdate {
            file,
            expected: image_size,
            written: 0,
            first_byte: None,
        });
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, FlashError> {
        let update = self.open.as_mut().ok_or(FlashError::NotStarted)?;
        let room = update.expected.saturating_sub(update.written);
        let n = data.len().min(usize::try_from(room).unwrap_or(usize::MAX));
        update.file.write_all(&data[..n]).map_err(io_failure)?;
        if update.first_byte.is_none() && n > 0 {
            update.first_byte = Some(data[0]);
        }
        update.written += n as u64;
        Ok(n)
    }

    fn finalize(&mut self) -> Result<bool, FlashError> {
        let mut update = self.open.take().ok_or(FlashError::NotStarted)?;
        update.file.sync_all().map_err(io_failure)?;
        if update.written != update.expected {
            return Ok(false);
        }
        if let Some(magic) = self.magic
            && update.first_byte != Some(magic)
        {
            warn!(
                expected = format!("0x{:02X}", magic),
                "Image magic byte mismatch"
            );
            return Ok(false);
        }
        Ok(true)
    }

    fn abort(&mut self) {
        if self.open.take().is_some()
            && let Err(e) = fs::remove_file(&self.path)
        {
            warn!(error = %e, "Failed to discard aborted flash image");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_fs_staging_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FsStagingStore::open(dir.path(), 1024).unwrap();
        assert_eq!(store.staged_size().unwrap(), None);

        let mut w = store.create().unwrap();
        w.write_all(b"hello ").unwrap();
        w.write_all(b"world").unwrap();
        w.flush().unwrap();
        drop(w);

        assert_eq!(store.staged_size().unwrap(), Some(11));
        assert_eq!(store.used_bytes(), 11);
        let mut out = String::new();
        store.open_read().unwrap().read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello world");

        assert!(store.remove().unwrap());
        assert!(!store.remove().unwrap());
        assert!(matches!(store.open_read(), Err(StorageError::Missing)));
    }

    #[test]
    fn test_fs_staging_create_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FsStagingStore::open(dir.path(), 1024).unwrap();
        store.create().unwrap().write_all(b"stale data").unwrap();
        let _w = store.create().unwrap();
        assert_eq!(store.staged_size().unwrap(), Some(0));
    }

    #[test]
    fn test_fs_staging_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FsStagingStore::open(dir.path(), 4).unwrap();
        let mut w = store.create().unwrap();
        assert_eq!(w.write(b"abcdef").unwrap(), 4);
        assert_eq!(w.write(b"g").unwrap(), 0);
    }

    #[test]
    fn test_file_flash_success() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ota_0.bin");
        let mut flash = FileFlash::new(&path, 64).with_magic(0xE9);
        flash.begin(4).unwrap();
        assert_eq!(flash.write(&[0xE9, 1]).unwrap(), 2);
        assert_eq!(flash.write(&[2, 3]).unwrap(), 2);
        assert_eq!(flash.finalize(), Ok(true));
        assert_eq!(fs::read(&path).unwrap(), vec![0xE9, 1, 2, 3]);
    }

    #[test]
    fn test_file_flash_rejects_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let mut flash = FileFlash::new(dir.path().join("ota_0.bin"), 64).with_magic(0xE9);
        flash.begin(2).unwrap();
        flash.write(&[0x00, 0x01]).unwrap();
        assert_eq!(flash.finalize(), Ok(false));
    }

    #[test]
    fn test_file_flash_insufficient_space() {
        let dir = tempfile::tempdir().unwrap();
        let mut flash = FileFlash::new(dir.path().join("ota_0.bin"), 8);
        assert_eq!(
            flash.begin(9),
            Err(FlashError::InsufficientSpace {
                requested: 9,
                available: 8
            })
        );
    }

    #[test]
    fn test_file_flash_abort_discards() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ota_0.bin");
        let mut flash = FileFlash::new(&path, 8);
        flash.begin(4).unwrap();
        flash.write(&[1, 2]).unwrap();
        flash.abort();
        assert!(!path.exists());
        assert_eq!(flash.finalize(), Err(FlashError::NotStarted));
    }
}

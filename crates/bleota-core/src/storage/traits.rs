//! Storage collaborator abstractions.
//!
//! Defines the `StagingStore` trait for the image staging area and the
//! `FlashTarget` trait for the flash-programming primitive, so the
//! receiver runs against a filesystem, flash driver or in-memory mock.

use std::io::{Read, Write};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Short write: {written} of {requested} bytes persisted")]
    ShortWrite { requested: usize, written: usize },

    #[error("No staged image present")]
    Missing,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlashError {
    #[error("Not enough space: image needs {requested} bytes, region holds {available}")]
    InsufficientSpace { requested: u64, available: u64 },

    #[error("Flash operation without an open update")]
    NotStarted,

    #[error("Flash error #{code}")]
    Vendor { code: i32 },
}

impl FlashError {
    /// Numeric code reported to the sender (Arduino `Update` numbering).
    pub fn code(&self) -> i32 {
        match self {
            FlashError::InsufficientSpace { .. } => 4,
            FlashError::NotStarted => 11,
            FlashError::Vendor { code } => *code,
        }
    }
}

/// Append-capable persistent store holding at most one staged image.
pub trait StagingStore: Send {
    /// Handle used to append to the staged image.
    type Writer: Write + Send;
    /// Handle used to stream the staged image back.
    type Reader: Read + Send;

    /// Create an empty staged image (replacing any existing one) and open it for append.
    fn create(&mut self) -> Result<Self::Writer, StorageError>;

    /// Open the staged image for reading.
    fn open_read(&mut self) -> Result<Self::Reader, StorageError>;

    /// Size of the staged image, `None` when absent.
    fn staged_size(&self) -> Result<Option<u64>, StorageError>;

    /// Delete the staged image. Returns whether one existed.
    fn remove(&mut self) -> Result<bool, StorageError>;

    /// Total capacity of the store in bytes.
    fn total_bytes(&self) -> u64;

    /// Bytes currently in use.
    fn used_bytes(&self) -> u64;
}

/// Flash-programming primitive (begin / write / finalize / abort).
pub trait FlashTarget: Send {
    /// Largest image the update region can hold.
    fn capacity(&self) -> u64;

    /// Reserve and prepare a region for an image of `image_size` bytes.
    fn begin(&mut self, image_size: u64) -> Result<(), FlashError>;

    /// Program the next bytes. May accept fewer bytes than offered.
    fn write(&mut self, data: &[u8]) -> Result<usize, FlashError>;

    /// Validate the programmed image.
    ///
    /// `Ok(false)` means the primitive could not confirm a complete,
    /// consistent image.
    fn finalize(&mut self) -> Result<bool, FlashError>;

    /// Drop an in-progress update.
    fn abort(&mut self);
}

//! Storage layer: staging store and flash primitive.

pub mod fs;
pub mod mock;
pub mod traits;

pub use fs::{FileFlash, FsStagingStore};
pub use mock::{MemoryStagingStore, MockFlash};
pub use traits::{FlashError, FlashTarget, StagingStore, StorageError};

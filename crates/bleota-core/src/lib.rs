//! BLEOTA-Core: segmented OTA firmware reception over a BLE characteristic.
//!
//! A sender writes a handshake declaring the image size, then streams
//! the image as a sequence of writes. The receiver stages the chunks,
//! programs the completed image into flash and notifies the sender of
//! progress as compact JSON.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Handshake, sequenced framing, sender-side encoder
//! - **Storage**: Staging store and flash primitive abstraction (fs, mock)
//! - **State**: Transfer session state machine
//! - **Writer / Applier**: Staging appends, flash programming
//! - **Status**: Snapshot board and periodic reporter
//! - **Events**: Observer pattern for transport/UI decoupling
//! - **Service**: Bounded inbound queue and worker thread
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use bleota_core::{FileFlash, FsStagingStore, NullSink, OtaConfig, OtaService, TracingObserver};
//!
//! let config = OtaConfig::default();
//! let store = FsStagingStore::open(&config.staging_dir, config.staging_capacity).unwrap();
//! let flash = FileFlash::new(&config.flash_path, config.flash_capacity);
//! let service = OtaService::start(&config, store, flash, NullSink, Arc::new(TracingObserver)).unwrap();
//!
//! let inbound = service.inbound();
//! inbound.submit(b"4").unwrap();
//! inbound.submit(&[0xE9, 1, 2, 3]).unwrap();
//! ```

pub mod applier;
pub mod cancel;
pub mod config;
pub mod events;
pub mod protocol;
pub mod service;
pub mod state;
pub mod status;
pub mod storage;
pub mod writer;

// Re-exports for convenience
pub use applier::{ApplyAttempt, ApplyOutcome, ApplyState, UpdateApplier};
pub use cancel::CancelToken;
pub use config::{ConfigError, OtaConfig};
pub use events::{NullObserver, OtaEvent, OtaObserver, ResetReason, TracingObserver};
pub use protocol::{Framing, Handshake, HandshakeError, TransferPlan};
pub use service::{InboundHandle, OtaService, SubmitError};
pub use state::{IngestOutcome, SessionError, TransferPhase, TransferSession};
pub use status::{ChannelSink, NullSink, StatusBoard, StatusReporter, StatusSink, StatusSnapshot};
pub use storage::{
    FileFlash, FlashError, FlashTarget, FsStagingStore, MemoryStagingStore, MockFlash,
    StagingStore, StorageError,
};
pub use writer::ChunkWriter;

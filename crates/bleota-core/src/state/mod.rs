//! Session state module.

pub mod machine;

pub use machine::{IngestOutcome, SessionError, TransferPhase, TransferSession};

//! Update applier: programs a completed staged image into flash.
//!
//! One [`ApplyAttempt`] runs `Idle → Begin → Writing → Finalizing` and ends
//! in `Success` or `Failed`. Whatever the outcome, the staged image is
//! deleted afterwards so a stale or partial image is never applied twice.

use std::fmt;
use std::io::{ErrorKind, Read};

use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::storage::{FlashError, FlashTarget, StagingStore};

/// Applier state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApplyState {
    #[default]
    Idle,
    Begin,
    Writing,
    Finalizing,
    Success,
    Failed,
}

impl fmt::Display for ApplyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplyState::Idle => write!(f, "IDLE"),
            ApplyState::Begin => write!(f, "BEGIN"),
            ApplyState::Writing => write!(f, "WRITING"),
            ApplyState::Finalizing => write!(f, "FINALIZING"),
            ApplyState::Success => write!(f, "SUCCESS"),
            ApplyState::Failed => write!(f, "FAILED"),
        }
    }
}

/// Outcome of one apply attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Pending,
    Success,
    /// Flash accepted fewer bytes than the image holds.
    PartialWrite,
    /// No region large enough for the image.
    InsufficientSpace,
    /// Staged image missing/short, or flash could not validate it.
    IncompleteImage,
    /// Flash primitive failure (`code`) or staging read failure (`None`).
    StorageError { code: Option<i32> },
    /// Cancelled through the abort signal.
    Aborted,
}

impl ApplyOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ApplyOutcome::Success)
    }
}

impl fmt::Display for ApplyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplyOutcome::Pending => write!(f, "PENDING"),
            ApplyOutcome::Success => write!(f, "SUCCESS"),
            ApplyOutcome::PartialWrite => write!(f, "PARTIAL_WRITE"),
            ApplyOutcome::InsufficientSpace => write!(f, "INSUFFICIENT_SPACE"),
            ApplyOutcome::IncompleteImage => write!(f, "INCOMPLETE_IMAGE"),
            ApplyOutcome::StorageError { code: Some(c) } => write!(f, "STORAGE_ERROR({})", c),
            ApplyOutcome::StorageError { code: None } => write!(f, "STORAGE_ERROR"),
            ApplyOutcome::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// Record of one apply attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyAttempt {
    pub bytes_expected: u64,
    pub bytes_written: u64,
    pub outcome: ApplyOutcome,
}

impl ApplyAttempt {
    fn new(bytes_expected: u64) -> Self {
        Self {
            bytes_expected,
            bytes_written: 0,
            outcome: ApplyOutcome::Pending,
        }
    }

    /// Written share of the image, floored.
    pub fn progress_pct(&self) -> u64 {
        if self.bytes_expected == 0 {
            0
        } else {
            self.bytes_written * 100 / self.bytes_expected
        }
    }

    /// Human-readable result for the status channel.
    pub fn status_message(&self) -> String {
        match self.outcome {
            ApplyOutcome::Pending => "Pending".to_string(),
            ApplyOutcome::Success => "Success!".to_string(),
            ApplyOutcome::PartialWrite => format!(
                "Written : {}/{} [{}%]",
                self.bytes_written,
                self.bytes_expected,
                self.progress_pct()
            ),
            ApplyOutcome::InsufficientSpace => "Not enough space for OTA".to_string(),
            ApplyOutcome::IncompleteImage => "Failed!".to_string(),
            ApplyOutcome::StorageError { code: Some(code) } => format!("Error #: {}", code),
            ApplyOutcome::StorageError { code: None } => "Error: staged image unreadable".to_string(),
            ApplyOutcome::Aborted => "Aborted".to_string(),
        }
    }
}

/// Drives the flash primitive for staged images.
pub struct UpdateApplier<F: FlashTarget> {
    flash: F,
    state: ApplyState,
    block_size: usize,
}

impl<F: FlashTarget> UpdateApplier<F> {
    pub fn new(flash: F, block_size: usize) -> Self {
        Self {
            flash,
            state: ApplyState::Idle,
            block_size: block_size.max(1),
        }
    }

    pub fn state(&self) -> ApplyState {
        self.state
    }

    fn goto_state(&mut self, state: ApplyState) {
        debug!(from = %self.state, to = %state, "Applier transition");
        self.state = state;
    }

    /// Apply the staged image of `expected_size` bytes.
    ///
    /// Never fails: every failure is folded into the returned attempt's
    /// outcome. The staged image is removed before returning.
    #[instrument(skip(self, store, cancel))]
    pub fn apply<S: StagingStore>(
        &mut self,
        store: &mut S,
        expected_size: u64,
        cancel: &CancelToken,
    ) -> ApplyAttempt {
        self.goto_state(ApplyState::Idle);
        let mut attempt = ApplyAttempt::new(expected_size);
        attempt.outcome = self.run(store, &mut attempt, cancel);

        let final_state = match attempt.outcome {
            ApplyOutcome::Success => ApplyState::Success,
            // Begin never reserved anything.
            ApplyOutcome::InsufficientSpace => ApplyState::Idle,
            _ => ApplyState::Failed,
        };
        self.goto_state(final_state);

        match store.remove() {
            Ok(true) => debug!("Staged image removed"),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "Failed to remove staged image"),
        }

        info!(
            outcome = %attempt.outcome,
            written = attempt.bytes_written,
            expected = attempt.bytes_expected,
            "Apply attempt finished"
        );
        attempt
    }

    fn run<S: StagingStore>(
        &mut self,
        store: &mut S,
        attempt: &mut ApplyAttempt,
        cancel: &CancelToken,
    ) -> ApplyOutcome {
        let expected = attempt.bytes_expected;
        match store.staged_size() {
            Ok(Some(size)) if size == expected && size > 0 => {}
            Ok(size) => {
                warn!(staged = ?size, expected, "Staged image does not match declared size");
                return ApplyOutcome::IncompleteImage;
            }
            Err(e) => {
                warn!(error = %e, "Cannot stat staged image");
                return ApplyOutcome::StorageError { code: None };
            }
        }

        if cancel.is_cancelled() {
            return ApplyOutcome::Aborted;
        }

        let capacity = self.flash.capacity();
        if expected > capacity {
            warn!(expected, capacity, "Image larger than update region");
            return ApplyOutcome::InsufficientSpace;
        }

        self.goto_state(ApplyState::Begin);
        if let Err(e) = self.flash.begin(expected) {
            warn!(error = %e, "Flash begin failed");
            return match e {
                FlashError::InsufficientSpace { .. } => ApplyOutcome::InsufficientSpace,
                other => ApplyOutcome::StorageError {
                    code: Some(other.code()),
                },
            };
        }

        let mut reader = match store.open_read() {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "Cannot open staged image");
                self.flash.abort();
                return ApplyOutcome::StorageError { code: None };
            }
        };

        self.goto_state(ApplyState::Writing);
        let mut buf = vec![0u8; self.block_size];
        while attempt.bytes_written < expected {
            if cancel.is_cancelled() {
                self.flash.abort();
                return ApplyOutcome::Aborted;
            }

            let remaining = usize::try_from(expected - attempt.bytes_written).unwrap_or(usize::MAX);
            let want = buf.len().min(remaining);
            let n = match reader.read(&mut buf[..want]) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "Staged image read failed");
                    self.flash.abort();
                    return ApplyOutcome::StorageError { code: None };
                }
            };

            let accepted = match self.flash.write(&buf[..n]) {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Flash write failed");
                    self.flash.abort();
                    return ApplyOutcome::StorageError {
                        code: Some(e.code()),
                    };
                }
            };
            attempt.bytes_written += accepted as u64;
            if accepted < n {
                warn!(offered = n, accepted, "Short flash write");
                break;
            }
        }

        if attempt.bytes_written != expected {
            warn!(
                "Written only : {}/{}",
                attempt.bytes_written, attempt.bytes_expected
            );
            self.flash.abort();
            return ApplyOutcome::PartialWrite;
        }

        if cancel.is_cancelled() {
            self.flash.abort();
            return ApplyOutcome::Aborted;
        }

        self.goto_state(ApplyState::Finalizing);
        match self.flash.finalize() {
            Ok(true) => ApplyOutcome::Success,
            Ok(false) => {
                warn!("Update not finished, flash could not validate image");
                ApplyOutcome::IncompleteImage
            }
            Err(e) => {
                warn!(error = %e, "Flash finalize failed");
                ApplyOutcome::StorageError {
                    code: Some(e.code()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStagingStore, MockFlash};

    fn staged(data: &[u8]) -> MemoryStagingStore {
        MemoryStagingStore::default().with_leftover(data)
    }

    #[test]
    fn test_apply_success() {
        let data: Vec<u8> = (0..1024u32).map(|i| i as u8).collect();
        let mut store = staged(&data);
        let flash = MockFlash::new(4096);
        let mut applier = UpdateApplier::new(flash.clone(), 100);

        let attempt = applier.apply(&mut store, 1024, &CancelToken::new());
        assert_eq!(attempt.outcome, ApplyOutcome::Success);
        assert_eq!(attempt.bytes_written, 1024);
        assert_eq!(attempt.status_message(), "Success!");
        assert_eq!(applier.state(), ApplyState::Success);
        assert_eq!(flash.image(), data);
        assert!(flash.is_finalized());
        assert!(store.staged().is_none());
    }

    #[test]
    fn test_insufficient_space_deletes_staged() {
        let mut store = staged(&[0u8; 200]);
        let flash = MockFlash::new(100);
        let mut applier = UpdateApplier::new(flash.clone(), 64);

        let attempt = applier.apply(&mut store, 200, &CancelToken::new());
        assert_eq!(attempt.outcome, ApplyOutcome::InsufficientSpace);
        assert_eq!(attempt.status_message(), "Not enough space for OTA");
        assert_eq!(applier.state(), ApplyState::Idle);
        assert!(store.staged().is_none());
        assert!(flash.image().is_empty());
        assert_eq!(flash.begin_calls(), 0);
    }

    #[test]
    fn test_partial_write() {
        let mut store = staged(&[5u8; 1000]);
        let flash = MockFlash::new(4096);
        flash.limit_writes(300);
        let mut applier = UpdateApplier::new(flash.clone(), 128);

        let attempt = applier.apply(&mut store, 1000, &CancelToken::new());
        assert_eq!(attempt.outcome, ApplyOutcome::PartialWrite);
        assert_eq!(attempt.bytes_written, 300);
        assert!(attempt.progress_pct() < 100);
        assert_eq!(attempt.status_message(), "Written : 300/1000 [30%]");
        assert!(flash.was_aborted());
        assert!(!flash.is_finalized());
        assert!(store.staged().is_none());
    }

    #[test]
    fn test_partial_write_one_byte_short_stays_below_100() {
        let mut store = staged(&[5u8; 1000]);
        let flash = MockFlash::new(4096);
        flash.limit_writes(999);
        let mut applier = UpdateApplier::new(flash, 4096);

        let attempt = applier.apply(&mut store, 1000, &CancelToken::new());
        assert_eq!(attempt.outcome, ApplyOutcome::PartialWrite);
        assert_eq!(attempt.status_message(), "Written : 999/1000 [99%]");
    }

    #[test]
    fn test_finalize_not_complete() {
        let mut store = staged(&[1u8; 10]);
        let flash = MockFlash::new(100);
        flash.set_finalize_result(Ok(false));
        let mut applier = UpdateApplier::new(flash, 4);

        let attempt = applier.apply(&mut store, 10, &CancelToken::new());
        assert_eq!(attempt.outcome, ApplyOutcome::IncompleteImage);
        assert_eq!(attempt.status_message(), "Failed!");
        assert_eq!(applier.state(), ApplyState::Failed);
    }

    #[test]
    fn test_finalize_vendor_error() {
        let mut store = staged(&[1u8; 10]);
        let flash = MockFlash::new(100);
        flash.set_finalize_result(Err(FlashError::Vendor { code: 9 }));
        let mut applier = UpdateApplier::new(flash, 4);

        let attempt = applier.apply(&mut store, 10, &CancelToken::new());
        assert_eq!(attempt.outcome, ApplyOutcome::StorageError { code: Some(9) });
        assert_eq!(attempt.status_message(), "Error #: 9");
        assert!(store.staged().is_none());
    }

    #[test]
    fn test_begin_vendor_error() {
        let mut store = staged(&[1u8; 10]);
        let flash = MockFlash::new(100);
        flash.fail_begin(FlashError::Vendor { code: 2 });
        let mut applier = UpdateApplier::new(flash, 4);

        let attempt = applier.apply(&mut store, 10, &CancelToken::new());
        assert_eq!(attempt.outcome, ApplyOutcome::StorageError { code: Some(2) });
    }

    #[test]
    fn test_staged_size_mismatch() {
        let mut store = staged(&[1u8; 9]);
        let flash = MockFlash::new(100);
        let mut applier = UpdateApplier::new(flash.clone(), 4);

        let attempt = applier.apply(&mut store, 10, &CancelToken::new());
        assert_eq!(attempt.outcome, ApplyOutcome::IncompleteImage);
        assert_eq!(flash.begin_calls(), 0);
        assert!(store.staged().is_none());
    }

    #[test]
    fn test_missing_staged_image() {
        let mut store = MemoryStagingStore::default();
        let mut applier = UpdateApplier::new(MockFlash::new(100), 4);

        let attempt = applier.apply(&mut store, 10, &CancelToken::new());
        assert_eq!(attempt.outcome, ApplyOutcome::IncompleteImage);
    }

    #[test]
    fn test_cancelled_before_begin() {
        let mut store = staged(&[1u8; 10]);
        let flash = MockFlash::new(100);
        let mut applier = UpdateApplier::new(flash.clone(), 4);
        let cancel = CancelToken::new();
        cancel.cancel();

        let attempt = applier.apply(&mut store, 10, &cancel);
        assert_eq!(attempt.outcome, ApplyOutcome::Aborted);
        assert_eq!(flash.begin_calls(), 0);
        assert!(store.staged().is_none());
    }

    /// Flash that raises the abort signal after a number of writes.
    struct CancellingFlash {
        inner: MockFlash,
        cancel: CancelToken,
        writes_left: usize,
    }

    impl FlashTarget for CancellingFlash {
        fn capacity(&self) -> u64 {
            self.inner.capacity()
        }
        fn begin(&mut self, image_size: u64) -> Result<(), FlashError> {
            self.inner.begin(image_size)
        }
        fn write(&mut self, data: &[u8]) -> Result<usize, FlashError> {
            self.writes_left = self.writes_left.saturating_sub(1);
            if self.writes_left == 0 {
                self.cancel.cancel();
            }
            self.inner.write(data)
        }
        fn finalize(&mut self) -> Result<bool, FlashError> {
            self.inner.finalize()
        }
        fn abort(&mut self) {
            self.inner.abort()
        }
    }

    #[test]
    fn test_cancelled_mid_write() {
        let mut store = staged(&[1u8; 100]);
        let cancel = CancelToken::new();
        let mock = MockFlash::new(1000);
        let flash = CancellingFlash {
            inner: mock.clone(),
            cancel: cancel.clone(),
            writes_left: 2,
        };
        let mut applier = UpdateApplier::new(flash, 10);

        let attempt = applier.apply(&mut store, 100, &cancel);
        assert_eq!(attempt.outcome, ApplyOutcome::Aborted);
        assert_eq!(attempt.bytes_written, 20);
        assert!(mock.was_aborted());
        assert!(!mock.is_finalized());
        assert!(store.staged().is_none());
    }
}

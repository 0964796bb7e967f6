//! OTA service: bounded inbound queue and the worker owning all state.
//!
//! The wireless stack's write callback only enqueues through an
//! [`InboundHandle`]. A single worker thread owns the session, the
//! staging store and the applier, so every mutation is serialized and
//! processed in arrival order.

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::applier::UpdateApplier;
use crate::cancel::CancelToken;
use crate::config::OtaConfig;
use crate::events::{OtaEvent, OtaObserver, ResetReason};
use crate::state::{IngestOutcome, TransferPhase, TransferSession};
use crate::status::{StatusBoard, StatusReporter, StatusSink, StatusSnapshot};
use crate::storage::{FlashTarget, StagingStore};

const MSG_RECEIVING: &str = "Receiving";
const MSG_CHUNK_WRITTEN: &str = "Data written successfully";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("Inbound queue full")]
    QueueFull,

    #[error("OTA worker stopped")]
    Closed,

    #[error("Message of {len} bytes exceeds limit of {max}")]
    TooLarge { len: usize, max: usize },
}

enum Command {
    Message(Vec<u8>),
    Disconnect,
    Abort,
    Shutdown,
}

/// Producer side of the inbound queue. Cheap to clone.
#[derive(Clone)]
pub struct InboundHandle {
    sender: SyncSender<Command>,
    max_message_len: usize,
}

impl InboundHandle {
    fn check_len(&self, message: &[u8]) -> Result<(), SubmitError> {
        if message.len() > self.max_message_len {
            return Err(SubmitError::TooLarge {
                len: message.len(),
                max: self.max_message_len,
            });
        }
        Ok(())
    }

    /// Enqueue without blocking, for callback contexts.
    pub fn try_submit(&self, message: &[u8]) -> Result<(), SubmitError> {
        self.check_len(message)?;
        self.sender
            .try_send(Command::Message(message.to_vec()))
            .map_err(|e| match e {
                TrySendError::Full(_) => SubmitError::QueueFull,
                TrySendError::Disconnected(_) => SubmitError::Closed,
            })
    }

    /// Enqueue, waiting for room.
    pub fn submit(&self, message: &[u8]) -> Result<(), SubmitError> {
        self.check_len(message)?;
        self.sender
            .send(Command::Message(message.to_vec()))
            .map_err(|_| SubmitError::Closed)
    }

    /// The sender went away: drop the in-flight session.
    pub fn disconnect(&self) -> Result<(), SubmitError> {
        self.sender
            .send(Command::Disconnect)
            .map_err(|_| SubmitError::Closed)
    }
}

struct Worker<S: StagingStore, F: FlashTarget, O: OtaObserver> {
    session: TransferSession<S>,
    store: S,
    applier: UpdateApplier<F>,
    board: StatusBoard,
    observer: Arc<O>,
    cancel: CancelToken,
    idle_timeout: Option<Duration>,
    /// Set by a reset until the next accepted handshake.
    draining: bool,
}

impl<S: StagingStore, F: FlashTarget, O: OtaObserver> Worker<S, F, O> {
    fn run(mut self, rx: Receiver<Command>) {
        loop {
            let command = match self.idle_timeout {
                Some(timeout) if self.session.is_receiving() => match rx.recv_timeout(timeout) {
                    Ok(command) => command,
                    Err(RecvTimeoutError::Timeout) => {
                        warn!(timeout = ?timeout, "No data received, dropping session");
                        self.discard(ResetReason::IdleTimeout, "Timeout");
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                _ => match rx.recv() {
                    Ok(command) => command,
                    Err(_) => break,
                },
            };

            match command {
                Command::Message(message) => {
                    if self.cancel.is_cancelled() {
                        debug!(len = message.len(), "Dropping message queued before abort");
                        continue;
                    }
                    self.handle_message(&message);
                }
                Command::Disconnect => {
                    if self.in_session() {
                        self.discard(ResetReason::Disconnected, "Disconnected");
                    }
                }
                Command::Abort => {
                    if self.in_session() {
                        self.discard(ResetReason::Aborted, "Aborted");
                    }
                    self.cancel.reset();
                }
                Command::Shutdown => break,
            }
        }
        self.session.reset();
        debug!("OTA worker stopped");
    }

    fn in_session(&self) -> bool {
        self.session.phase() != TransferPhase::AwaitingHandshake
    }

    fn refresh_storage(&self) {
        self.board
            .set_storage(self.store.total_bytes(), self.store.used_bytes());
    }

    fn emit_phase_change(&self, from: TransferPhase) {
        let to = self.session.phase();
        if from != to {
            self.observer.on_event(&OtaEvent::PhaseChanged { from, to });
        }
    }

    fn handle_message(&mut self, message: &[u8]) {
        let before = self.session.phase();
        let result = self.session.ingest(message, &mut self.store);
        self.emit_phase_change(before);
        self.refresh_storage();
        let segment = self.session.segment_index();

        match result {
            Ok(IngestOutcome::HandshakeAccepted {
                expected_size,
                sequenced,
            }) => {
                self.draining = false;
                self.board.set_reboot_ready(false);
                self.board
                    .record_progress(segment, expected_size, MSG_RECEIVING);
                self.observer.on_event(&OtaEvent::HandshakeAccepted {
                    expected_size,
                    sequenced,
                });
            }
            Ok(IngestOutcome::ChunkAccepted { received, expected }) => {
                self.board
                    .record_progress(segment, expected, MSG_CHUNK_WRITTEN);
                self.observer
                    .on_event(&OtaEvent::Progress { received, expected });
            }
            Ok(IngestOutcome::TransferComplete { total }) => {
                self.board.record_progress(segment, total, MSG_CHUNK_WRITTEN);
                self.observer.on_event(&OtaEvent::Progress {
                    received: total,
                    expected: total,
                });
                self.observer
                    .on_event(&OtaEvent::TransferComplete { total });
                self.apply(total);
            }
            Err(e) if !e.is_terminal() && self.draining => {
                // Leftover chunks of the session that was just reset.
                debug!(error = %e, len = message.len(), "Dropping stray message");
            }
            Err(e) if !e.is_terminal() => {
                self.board.publish_final(segment, e.to_string());
                self.observer.on_event(&OtaEvent::HandshakeRejected {
                    reason: e.to_string(),
                });
            }
            Err(e) => {
                warn!(error = %e, segment, "Session failed");
                self.observer.on_event(&OtaEvent::Error {
                    message: e.to_string(),
                });
                self.discard(ResetReason::Failed, &e.to_string());
            }
        }
    }

    fn apply(&mut self, total: u64) {
        let attempt = self.applier.apply(&mut self.store, total, &self.cancel);
        let segment = self.session.segment_index();

        self.reset_session();
        self.refresh_storage();
        self.board.publish_final(segment, attempt.status_message());
        self.observer.on_event(&OtaEvent::ApplyFinished { attempt });
        if attempt.outcome.is_success() {
            self.board.set_reboot_ready(true);
            self.observer.on_event(&OtaEvent::RebootReady);
        }
        self.observer.on_event(&OtaEvent::SessionReset {
            reason: ResetReason::Applied,
        });
    }

    fn reset_session(&mut self) {
        let before = self.session.phase();
        self.session.reset();
        self.emit_phase_change(before);
    }

    /// Reset the session and delete whatever was staged.
    fn discard(&mut self, reason: ResetReason, msg: &str) {
        let segment = self.session.segment_index();
        self.reset_session();
        match self.store.remove() {
            Ok(true) => debug!("Staged image discarded"),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "Failed to discard staged image"),
        }
        self.refresh_storage();
        self.board.publish_final(segment, msg);
        self.draining = true;
        self.observer.on_event(&OtaEvent::SessionReset { reason });
    }
}

/// Running OTA receiver.
pub struct OtaService {
    inbound: InboundHandle,
    cancel: CancelToken,
    board: StatusBoard,
    worker: Option<thread::JoinHandle<()>>,
    reporter: Option<StatusReporter>,
}

impl OtaService {
    /// Recover storage, then spawn the worker and status reporter.
    ///
    /// Any leftover staged image is removed before the first handshake
    /// can be accepted.
    #[instrument(skip_all)]
    pub fn start<S, F, K, O>(
        config: &OtaConfig,
        mut store: S,
        flash: F,
        sink: K,
        observer: Arc<O>,
    ) -> Result<Self>
    where
        S: StagingStore + 'static,
        F: FlashTarget + 'static,
        K: StatusSink + 'static,
        O: OtaObserver + 'static,
    {
        config.validate()?;

        if store
            .remove()
            .context("Failed to remove stale staged image")?
        {
            info!("Removed stale staged image");
            observer.on_event(&OtaEvent::StaleImageRemoved);
        }

        let board = StatusBoard::new();
        board.set_storage(store.total_bytes(), store.used_bytes());

        let cancel = CancelToken::new();
        let (sender, receiver) = mpsc::sync_channel(config.queue_capacity);
        let worker = Worker {
            session: TransferSession::new(),
            store,
            applier: UpdateApplier::new(flash, config.write_block_size),
            board: board.clone(),
            observer,
            cancel: cancel.clone(),
            idle_timeout: config.idle_timeout(),
            draining: false,
        };
        let worker = thread::Builder::new()
            .name("ota-worker".into())
            .spawn(move || worker.run(receiver))
            .context("Failed to spawn OTA worker")?;

        let reporter = StatusReporter::spawn(board.clone(), sink, config.status_interval())
            .context("Failed to spawn status reporter")?;

        info!(
            queue_capacity = config.queue_capacity,
            max_message_len = config.max_message_len,
            "OTA service started"
        );
        Ok(Self {
            inbound: InboundHandle {
                sender,
                max_message_len: config.max_message_len,
            },
            cancel,
            board,
            worker: Some(worker),
            reporter: Some(reporter),
        })
    }

    pub fn inbound(&self) -> InboundHandle {
        self.inbound.clone()
    }

    /// Cancel the in-flight transfer or apply attempt.
    pub fn abort(&self) {
        self.cancel.cancel();
        if self.inbound.sender.send(Command::Abort).is_err() {
            warn!("Abort requested but OTA worker is gone");
        }
    }

    /// Current status as the reporter would emit it.
    pub fn status(&self) -> StatusSnapshot {
        self.board.sample()
    }

    /// Set once an image was applied successfully.
    pub fn reboot_ready(&self) -> bool {
        self.board.reboot_ready()
    }

    /// Stop the worker and reporter threads.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = self.inbound.sender.send(Command::Shutdown);
            if worker.join().is_err() {
                warn!("OTA worker panicked");
            }
        }
        if let Some(reporter) = self.reporter.take() {
            reporter.stop();
        }
    }
}

impl Drop for OtaService {
    fn drop(&mut self) {
        self.stop();
    }
}

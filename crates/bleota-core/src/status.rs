//! Status reporting over the notify channel.
//!
//! The worker writes progress into a shared [`StatusBoard`]; a
//! [`StatusReporter`] thread samples it on a fixed cadence and pushes
//! compact JSON snapshots to a [`StatusSink`].

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Notify channel closed")]
    Closed,
}

/// One status notification, rebuilt for every emission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    /// Messages processed in the current session.
    pub segment: u64,
    /// Declared image size.
    pub ota_size: u64,
    pub msg_status: String,
    /// Staging store capacity.
    pub total_bytes: u64,
    /// Staging store bytes in use.
    pub used_bytes: u64,
}

impl StatusSnapshot {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Default)]
struct BoardState {
    segment: u64,
    ota_size: u64,
    msg_status: String,
    total_bytes: u64,
    used_bytes: u64,
    active: bool,
    final_generation: u64,
    reboot_ready: bool,
}

/// Shared status written by the worker and read by the reporter.
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    inner: Arc<Mutex<BoardState>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    // A panicking writer leaves plain counters behind, still readable.
    fn lock(&self) -> MutexGuard<'_, BoardState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current status. Reads only.
    pub fn sample(&self) -> StatusSnapshot {
        let state = self.lock();
        StatusSnapshot {
            segment: state.segment,
            ota_size: state.ota_size,
            msg_status: state.msg_status.clone(),
            total_bytes: state.total_bytes,
            used_bytes: state.used_bytes,
        }
    }

    pub fn set_storage(&self, total_bytes: u64, used_bytes: u64) {
        let mut state = self.lock();
        state.total_bytes = total_bytes;
        state.used_bytes = used_bytes;
    }

    /// Record in-flight progress and mark the board active.
    pub fn record_progress(&self, segment: u64, ota_size: u64, msg: impl Into<String>) {
        let mut state = self.lock();
        state.segment = segment;
        state.ota_size = ota_size;
        state.msg_status = msg.into();
        state.active = true;
    }

    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    /// Record a terminal outcome and request one final emission.
    pub fn publish_final(&self, segment: u64, msg: impl Into<String>) {
        let mut state = self.lock();
        state.segment = segment;
        state.msg_status = msg.into();
        state.active = false;
        state.final_generation += 1;
    }

    /// Count of terminal outcomes published so far.
    pub fn final_generation(&self) -> u64 {
        self.lock().final_generation
    }

    pub fn set_reboot_ready(&self, ready: bool) {
        self.lock().reboot_ready = ready;
    }

    pub fn reboot_ready(&self) -> bool {
        self.lock().reboot_ready
    }
}

/// Notify-only outbound channel.
pub trait StatusSink: Send {
    /// Whether a peer is subscribed to notifications.
    fn has_subscriber(&self) -> bool;

    fn notify(&mut self, payload: &[u8]) -> Result<(), NotifyError>;
}

/// Sink that drops every notification.
pub struct NullSink;

impl StatusSink for NullSink {
    fn has_subscriber(&self) -> bool {
        false
    }

    fn notify(&mut self, _payload: &[u8]) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Sink forwarding payloads over an mpsc channel.
pub struct ChannelSink {
    sender: mpsc::Sender<Vec<u8>>,
}

impl ChannelSink {
    pub fn new(sender: mpsc::Sender<Vec<u8>>) -> Self {
        Self { sender }
    }
}

impl StatusSink for ChannelSink {
    fn has_subscriber(&self) -> bool {
        true
    }

    fn notify(&mut self, payload: &[u8]) -> Result<(), NotifyError> {
        self.sender
            .send(payload.to_vec())
            .map_err(|_| NotifyError::Closed)
    }
}

/// Push the current snapshot. Returns whether anything was sent.
pub fn emit_snapshot<K: StatusSink + ?Sized>(
    board: &StatusBoard,
    sink: &mut K,
) -> Result<bool, NotifyError> {
    if !sink.has_subscriber() {
        return Ok(false);
    }
    let json = board.sample().to_json()?;
    trace!(payload = %json, "Status notify");
    sink.notify(json.as_bytes())?;
    Ok(true)
}

/// Background status emitter.
pub struct StatusReporter {
    stop: mpsc::Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl StatusReporter {
    /// Spawn the reporter thread.
    ///
    /// Emits every `interval` while the board is active, plus once after
    /// each terminal outcome.
    pub fn spawn<K: StatusSink + 'static>(
        board: StatusBoard,
        mut sink: K,
        interval: Duration,
    ) -> std::io::Result<Self> {
        let (stop, stop_rx) = mpsc::channel::<()>();
        // Taken before the thread runs so outcomes published meanwhile still count.
        let mut last_generation = board.final_generation();
        let handle = thread::Builder::new()
            .name("ota-status".into())
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }

                    let generation = board.final_generation();
                    if !board.is_active() && generation == last_generation {
                        continue;
                    }
                    last_generation = generation;
                    if let Err(e) = emit_snapshot(&board, &mut sink) {
                        debug!(error = %e, "Status notification dropped");
                    }
                }
            })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for it.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.stop.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StatusReporter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

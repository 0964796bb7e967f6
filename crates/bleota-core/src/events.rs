//! Event system for transport/UI decoupling.
//!
//! Lets the embedding system (BLE stack glue, CLI, tests) follow the
//! receiver without reaching into the worker thread.

use std::fmt;

use crate::applier::ApplyAttempt;
use crate::state::TransferPhase;

/// Why a session went back to awaiting a handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    /// A terminal session error (storage, overflow, integrity).
    Failed,
    /// No inbound message within the idle timeout.
    IdleTimeout,
    /// Cancelled through `OtaService::abort`.
    Aborted,
    /// The sender disconnected.
    Disconnected,
    /// The apply attempt finished.
    Applied,
}

impl fmt::Display for ResetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResetReason::Failed => write!(f, "Failed"),
            ResetReason::IdleTimeout => write!(f, "Idle Timeout"),
            ResetReason::Aborted => write!(f, "Aborted"),
            ResetReason::Disconnected => write!(f, "Disconnected"),
            ResetReason::Applied => write!(f, "Applied"),
        }
    }
}

/// Events emitted by the OTA service.
#[derive(Debug, Clone)]
pub enum OtaEvent {
    /// Leftover staged image removed at start.
    StaleImageRemoved,
    /// Session phase changed.
    PhaseChanged { from: TransferPhase, to: TransferPhase },
    /// Handshake accepted and staging opened.
    HandshakeAccepted { expected_size: u64, sequenced: bool },
    /// Handshake rejected; still awaiting one.
    HandshakeRejected { reason: String },
    /// Chunk appended.
    Progress { received: u64, expected: u64 },
    /// All declared bytes received.
    TransferComplete { total: u64 },
    /// Session error; a reset follows.
    Error { message: String },
    /// Session reset.
    SessionReset { reason: ResetReason },
    /// Apply attempt reached a terminal outcome.
    ApplyFinished { attempt: ApplyAttempt },
    /// Image applied; the device may reboot into it.
    RebootReady,
}

/// Observer trait for receiving OTA events.
///
/// Called from the worker thread; implementations must not block.
pub trait OtaObserver: Send + Sync {
    fn on_event(&self, event: &OtaEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl OtaObserver for NullObserver {
    fn on_event(&self, _event: &OtaEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl OtaObserver for TracingObserver {
    fn on_event(&self, event: &OtaEvent) {
        match event {
            OtaEvent::StaleImageRemoved => {
                tracing::info!("Removed stale staged image");
            }
            OtaEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed");
            }
            OtaEvent::HandshakeAccepted {
                expected_size,
                sequenced,
            } => {
                tracing::info!(expected_size, sequenced, "Handshake accepted");
            }
            OtaEvent::HandshakeRejected { reason } => {
                tracing::warn!(reason = %reason, "Handshake rejected");
            }
            OtaEvent::Progress { received, expected } => {
                let pct = if *expected > 0 {
                    (*received * 100) / *expected
                } else {
                    0
                };
                tracing::debug!(received, expected, progress = %format!("{}%", pct), "Progress");
            }
            OtaEvent::TransferComplete { total } => {
                tracing::info!(total, "Transfer complete");
            }
            OtaEvent::Error { message } => {
                tracing::error!("Error: {}", message);
            }
            OtaEvent::SessionReset { reason } => {
                tracing::warn!(reason = %reason, "Session reset");
            }
            OtaEvent::ApplyFinished { attempt } => {
                tracing::info!(
                    outcome = %attempt.outcome,
                    written = attempt.bytes_written,
                    expected = attempt.bytes_expected,
                    "{}",
                    attempt.status_message()
                );
            }
            OtaEvent::RebootReady => {
                tracing::info!("Update applied, ready to reboot");
            }
        }
    }
}

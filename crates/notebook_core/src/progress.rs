//! Progress and phase model shared by storage primitives and lifecycle tasks.
//!
//! # Responsibility
//! - Define the per-operation phase state machine.
//! - Define the `ProgressSink` seam through which long-running storage
//!   primitives report work and observe cancellation.
//!
//! # Invariants
//! - Phases only move forward: `Idle → Preparing → Transferring →
//!   Verifying → Committing → Completed`.
//! - `Cancelled` and `Failed` are reachable from every non-terminal phase.
//! - Terminal phases never transition again.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier of one lifecycle operation run.
pub type OperationId = Uuid;

/// Lifecycle operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Backup,
    Restore,
    Export,
    Import,
    Relocate,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Backup => "backup",
            Self::Restore => "restore",
            Self::Export => "export",
            Self::Import => "import",
            Self::Relocate => "relocate",
        }
    }
}

/// Phase of a running lifecycle operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationPhase {
    Idle,
    Preparing,
    Transferring,
    Verifying,
    Committing,
    Completed,
    Cancelled,
    Failed,
}

impl OperationPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// Validates one state-machine step. Same-phase updates are allowed.
    pub fn can_transition_to(self, target: OperationPhase) -> bool {
        if self == target {
            return !self.is_terminal();
        }
        if self.is_terminal() {
            return false;
        }
        if matches!(target, Self::Cancelled | Self::Failed) {
            return true;
        }
        matches!(
            (self, target),
            (Self::Idle, Self::Preparing)
                | (Self::Preparing, Self::Transferring)
                | (Self::Transferring, Self::Verifying)
                | (Self::Verifying, Self::Committing)
                | (Self::Committing, Self::Completed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Preparing => "preparing",
            Self::Transferring => "transferring",
            Self::Verifying => "verifying",
            Self::Committing => "committing",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

/// Snapshot of a running operation, streamed to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationProgress {
    pub operation_id: OperationId,
    pub kind: OperationKind,
    pub phase: OperationPhase,
    pub processed_units: u64,
    pub total_units: u64,
    pub processed_bytes: u64,
    pub total_bytes: u64,
    pub message: Option<String>,
}

impl OperationProgress {
    pub fn new(operation_id: OperationId, kind: OperationKind) -> Self {
        Self {
            operation_id,
            kind,
            phase: OperationPhase::Idle,
            processed_units: 0,
            total_units: 0,
            processed_bytes: 0,
            total_bytes: 0,
            message: None,
        }
    }

    /// Percentage of the current phase, preferring byte counters when known.
    pub fn percent(&self) -> f32 {
        if self.phase == OperationPhase::Completed {
            return 100.0;
        }
        let (done, total) = if self.total_bytes > 0 {
            (self.processed_bytes, self.total_bytes)
        } else {
            (self.processed_units, self.total_units)
        };
        if total == 0 {
            return 0.0;
        }
        (done.min(total) as f32 / total as f32) * 100.0
    }
}

/// Receiver of progress from storage primitives.
///
/// Implementations decide how often updates reach the UI; primitives call
/// `advance` once per unit of work and `is_cancelled` at unit boundaries.
pub trait ProgressSink {
    /// Moves the operation to `phase`.
    fn enter_phase(&mut self, phase: OperationPhase);
    /// Announces the amount of work of the current phase.
    fn set_totals(&mut self, units: u64, bytes: u64);
    /// Records finished work.
    fn advance(&mut self, units: u64, bytes: u64);
    /// Returns whether the caller requested cancellation.
    fn is_cancelled(&self) -> bool;
}

/// Sink for direct, non-observed calls.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn enter_phase(&mut self, _phase: OperationPhase) {}

    fn set_totals(&mut self, _units: u64, _bytes: u64) {}

    fn advance(&mut self, _units: u64, _bytes: u64) {}

    fn is_cancelled(&self) -> bool {
        false
    }
}

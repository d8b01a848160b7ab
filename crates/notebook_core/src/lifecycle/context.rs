//! Per-operation execution context.
//!
//! # Responsibility
//! - Track the phase and counters of one running operation.
//! - Forward progress to the caller's channel and expose cancellation.
//!
//! # Invariants
//! - Sends never wait while the operation runs: when the channel is full
//!   the newest update is kept and offered again on the next report.
//! - Only the terminal update may wait for room, after the worker released
//!   the operation slot and the store.
//! - Counter ticks are throttled.
//! - A dropped receiver never fails the operation.

use super::{LifecycleError, LifecycleResult};
use crate::progress::{OperationId, OperationKind, OperationPhase, OperationProgress, ProgressSink};
use log::{info, warn};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

pub(crate) struct OperationContext {
    progress: OperationProgress,
    sender: mpsc::Sender<OperationProgress>,
    /// Newest update the channel had no room for.
    pending: Option<OperationProgress>,
    token: CancellationToken,
    interval: Duration,
    last_tick: Instant,
}

impl OperationContext {
    pub(crate) fn new(
        operation_id: OperationId,
        kind: OperationKind,
        sender: mpsc::Sender<OperationProgress>,
        token: CancellationToken,
        interval: Duration,
    ) -> Self {
        Self {
            progress: OperationProgress::new(operation_id, kind),
            sender,
            pending: None,
            token,
            interval,
            last_tick: Instant::now(),
        }
    }

    pub(crate) fn kind(&self) -> OperationKind {
        self.progress.kind
    }

    pub(crate) fn phase(&self) -> OperationPhase {
        self.progress.phase
    }

    /// Returns `Cancelled` once cancellation was requested.
    pub(crate) fn check_continue(&self) -> LifecycleResult<()> {
        if self.token.is_cancelled() {
            return Err(LifecycleError::Cancelled);
        }
        Ok(())
    }

    /// Moves to a terminal phase and reports it with `message`, waiting
    /// for room if needed. Call with no lock held.
    pub(crate) fn finish(&mut self, phase: OperationPhase, message: Option<String>) {
        self.progress.message = message;
        self.enter_phase(phase);
        if let Some(update) = self.pending.take() {
            // Err only means the caller stopped listening.
            let _ = self.sender.blocking_send(update);
        }
    }

    /// Offers the current state without waiting; a full channel keeps it
    /// as the pending update, replacing an older one.
    fn offer(&mut self) {
        if let Some(update) = self.pending.take() {
            match self.sender.try_send(update) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.pending = Some(self.progress.clone());
                    return;
                }
                Err(TrySendError::Closed(_)) => return,
            }
        }
        if let Err(TrySendError::Full(update)) = self.sender.try_send(self.progress.clone()) {
            self.pending = Some(update);
        }
    }
}

impl ProgressSink for OperationContext {
    fn enter_phase(&mut self, phase: OperationPhase) {
        if !self.progress.phase.can_transition_to(phase) {
            warn!(
                "event=operation_phase module=lifecycle status=error kind={} from={} to={} error_code=invalid_transition",
                self.progress.kind.as_str(),
                self.progress.phase.as_str(),
                phase.as_str()
            );
            return;
        }
        if self.progress.phase != phase && !phase.is_terminal() {
            self.progress.processed_units = 0;
            self.progress.total_units = 0;
            self.progress.processed_bytes = 0;
            self.progress.total_bytes = 0;
        }
        self.progress.phase = phase;
        info!(
            "event=operation_phase module=lifecycle status=ok kind={} phase={}",
            self.progress.kind.as_str(),
            phase.as_str()
        );
        self.offer();
        self.last_tick = Instant::now();
    }

    fn set_totals(&mut self, units: u64, bytes: u64) {
        self.progress.total_units = units;
        self.progress.total_bytes = bytes;
    }

    fn advance(&mut self, units: u64, bytes: u64) {
        self.progress.processed_units += units;
        self.progress.processed_bytes += bytes;
        let done = self.progress.total_units > 0
            && self.progress.processed_units >= self.progress.total_units;
        if done || self.last_tick.elapsed() >= self.interval {
            self.offer();
            self.last_tick = Instant::now();
        }
    }

    fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::OperationContext;
    use crate::progress::{OperationKind, OperationPhase, ProgressSink};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    #[test]
    fn phases_reset_counters_and_invalid_steps_are_ignored() {
        let (sender, mut receiver) = mpsc::channel(8);
        let mut context = OperationContext::new(
            Uuid::new_v4(),
            OperationKind::Export,
            sender,
            CancellationToken::new(),
            Duration::from_secs(60),
        );
        context.enter_phase(OperationPhase::Preparing);
        context.enter_phase(OperationPhase::Transferring);
        context.set_totals(2, 0);
        context.advance(2, 0);
        context.enter_phase(OperationPhase::Preparing);

        let phases: Vec<_> = std::iter::from_fn(|| receiver.try_recv().ok())
            .map(|progress| (progress.phase, progress.processed_units))
            .collect();
        assert_eq!(
            phases,
            vec![
                (OperationPhase::Preparing, 0),
                (OperationPhase::Transferring, 0),
                (OperationPhase::Transferring, 2),
            ]
        );
        assert_eq!(context.phase(), OperationPhase::Transferring);
    }

    #[test]
    fn full_channel_never_blocks_and_keeps_newest_update() {
        let (sender, mut receiver) = mpsc::channel(1);
        let mut context = OperationContext::new(
            Uuid::new_v4(),
            OperationKind::Backup,
            sender,
            CancellationToken::new(),
            Duration::ZERO,
        );
        context.enter_phase(OperationPhase::Preparing);
        context.enter_phase(OperationPhase::Transferring);
        context.set_totals(3, 0);
        context.advance(1, 0);
        context.enter_phase(OperationPhase::Verifying);

        assert_eq!(
            receiver.try_recv().unwrap().phase,
            OperationPhase::Preparing
        );
        assert!(receiver.try_recv().is_err());

        context.advance(0, 0);
        assert_eq!(
            receiver.try_recv().unwrap().phase,
            OperationPhase::Verifying
        );
    }

    #[test]
    fn terminal_update_follows_pending_one() {
        let (sender, mut receiver) = mpsc::channel(1);
        let mut context = OperationContext::new(
            Uuid::new_v4(),
            OperationKind::Export,
            sender,
            CancellationToken::new(),
            Duration::from_secs(60),
        );
        context.enter_phase(OperationPhase::Preparing);
        context.enter_phase(OperationPhase::Transferring);

        let reader = std::thread::spawn(move || {
            std::iter::from_fn(|| receiver.blocking_recv())
                .map(|progress| progress.phase)
                .collect::<Vec<_>>()
        });
        context.finish(OperationPhase::Cancelled, None);
        drop(context);

        let phases = reader.join().unwrap();
        assert_eq!(phases.first(), Some(&OperationPhase::Preparing));
        assert_eq!(phases.last(), Some(&OperationPhase::Cancelled));
    }

    #[test]
    fn dropped_receiver_is_ignored() {
        let (sender, receiver) = mpsc::channel(1);
        drop(receiver);
        let mut context = OperationContext::new(
            Uuid::new_v4(),
            OperationKind::Relocate,
            sender,
            CancellationToken::new(),
            Duration::ZERO,
        );
        context.enter_phase(OperationPhase::Preparing);
        context.finish(OperationPhase::Failed, Some("boom".to_string()));
        assert_eq!(context.phase(), OperationPhase::Failed);
    }

    #[test]
    fn cancellation_is_observed() {
        let (sender, _receiver) = mpsc::channel(1);
        let token = CancellationToken::new();
        let context = OperationContext::new(
            Uuid::new_v4(),
            OperationKind::Backup,
            sender,
            token.clone(),
            Duration::ZERO,
        );
        assert!(context.check_continue().is_ok());
        token.cancel();
        assert!(context.is_cancelled());
        assert!(context.check_continue().is_err());
    }
}

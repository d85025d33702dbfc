//! The worker slot pool
//!
//! Concurrency is bounded by a semaphore sized to the configured maximum:
//! the dispatcher reserves a slot before handing an entry over, and each
//! attempt runs as its own task holding the slot permit until the outcome
//! has been routed. The user processing function only ever runs here.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::errors::AttemptInterrupted;
use crate::service::entry::{Entry, EntryState};
use crate::service::{events, outcome, Processor, ServiceCore};

pub(crate) enum SlotOutcome {
    Reserved(OwnedSemaphorePermit),
    TimedOut,
    Cancelled,
}

pub(crate) struct WorkerPool {
    slots: Arc<Semaphore>,
    max_workers: usize,
    interrupt: CancellationToken,
}

impl WorkerPool {
    pub(crate) fn new(max_workers: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(max_workers)),
            max_workers,
            interrupt: CancellationToken::new(),
        }
    }

    /// Wait for a free slot, bounded by `max_wait` and `cancel`.
    pub(crate) async fn reserve_slot(
        &self,
        max_wait: Duration,
        cancel: &CancellationToken,
    ) -> SlotOutcome {
        tokio::select! {
            biased;
            permit = self.slots.clone().acquire_owned() => match permit {
                Ok(p) => SlotOutcome::Reserved(p),
                Err(_) => SlotOutcome::Cancelled,
            },
            _ = cancel.cancelled() => SlotOutcome::Cancelled,
            _ = tokio::time::sleep(max_wait) => SlotOutcome::TimedOut,
        }
    }

    /// Attempts currently holding a slot.
    pub(crate) fn active(&self) -> usize {
        self.max_workers - self.slots.available_permits()
    }

    pub(crate) fn is_live(&self) -> bool {
        !self.slots.is_closed()
    }

    /// Signal raced against every in-flight processing call.
    pub(crate) fn interrupted(&self) -> &CancellationToken {
        &self.interrupt
    }

    /// Interrupt whatever is in flight; their attempts report failure.
    pub(crate) fn interrupt_in_flight(&self) {
        self.interrupt.cancel();
    }

    /// Refuse any further reservations.
    pub(crate) fn close(&self) {
        self.slots.close();
    }
}

/// One attempt: invoke the user function and route the result.
pub(crate) async fn run_attempt<P: Processor>(
    core: Arc<ServiceCore<P>>,
    entry: Arc<Entry<P::Request, P::Response>>,
    attempt: u32,
    permit: OwnedSemaphorePermit,
) {
    // Held until the outcome is routed; releasing it is what frees the slot
    let _permit = permit;

    entry.set_state(EntryState::InFlight);
    events::guard("attempt_started", || {
        core.listener.attempt_started(&entry.payload, attempt)
    });
    tracing::debug!(id = entry.id, attempt, "attempt starting");

    let result = tokio::select! {
        biased;
        res = core.processor.process(&entry.payload, attempt) => Some(res),
        _ = core.workers.interrupted().cancelled() => None,
    };

    match result {
        Some(Ok(value)) => outcome::attempt_succeeded(&core, &entry, attempt, value),
        Some(Err(err)) => outcome::attempt_failed(&core, &entry, attempt, Arc::from(err)),
        None => {
            tracing::debug!(id = entry.id, attempt, "attempt interrupted by shutdown");
            outcome::attempt_failed(&core, &entry, attempt, Arc::new(AttemptInterrupted));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn slots_bound_concurrency() {
        let pool = WorkerPool::new(2);
        let none = CancellationToken::new();

        let a = pool.reserve_slot(Duration::from_millis(10), &none).await;
        let b = pool.reserve_slot(Duration::from_millis(10), &none).await;
        assert!(matches!(a, SlotOutcome::Reserved(_)));
        assert!(matches!(b, SlotOutcome::Reserved(_)));
        assert_eq!(pool.active(), 2);

        let c = pool.reserve_slot(Duration::from_millis(10), &none).await;
        assert!(matches!(c, SlotOutcome::TimedOut));

        drop(a);
        let d = pool.reserve_slot(Duration::from_millis(10), &none).await;
        assert!(matches!(d, SlotOutcome::Reserved(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_beats_the_wait() {
        let pool = WorkerPool::new(1);
        let none = CancellationToken::new();
        let _held = pool.reserve_slot(Duration::from_millis(10), &none).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let out = pool.reserve_slot(Duration::from_secs(5), &cancel).await;
        assert!(matches!(out, SlotOutcome::Cancelled));
    }

    #[tokio::test]
    async fn closed_pool_stops_reserving() {
        let pool = WorkerPool::new(1);
        let none = CancellationToken::new();
        assert!(pool.is_live());
        pool.close();
        assert!(!pool.is_live());
        let out = pool.reserve_slot(Duration::from_secs(5), &none).await;
        assert!(matches!(out, SlotOutcome::Cancelled));
    }
}

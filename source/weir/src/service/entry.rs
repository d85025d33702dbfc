//! The per-request record
//!
//! An [`Entry`] is created at submit and owned by the service until its
//! future is signaled. At any moment it is held by exactly one component
//! (delay queue, main queue, dispatcher, or a worker), and that holder is
//! the only writer. The caller reaches the entry solely through the shared
//! completion slot and the cancel token.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::service::handle::HandleShared;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryState {
    PendingDelay,
    Ready,
    InFlight,
    Completed,
}

pub(crate) struct Entry<Rq, Rs> {
    pub(crate) id: u64,
    pub(crate) payload: Rq,
    pub(crate) created_at: Instant,
    pub(crate) deadline: Instant,
    pub(crate) earliest_start: Instant,
    pub(crate) max_attempts: u32,
    delay_schedule: Arc<[Duration]>,
    attempts: AtomicU32,
    state: Mutex<EntryState>,
    pub(crate) shared: Arc<HandleShared<Rs>>,
}

impl<Rq, Rs> Entry<Rq, Rs> {
    pub(crate) fn new(
        id: u64,
        payload: Rq,
        created_at: Instant,
        deadline: Instant,
        earliest_start: Instant,
        max_attempts: u32,
        delay_schedule: Arc<[Duration]>,
    ) -> Self {
        Self {
            id,
            payload,
            created_at,
            deadline,
            earliest_start,
            max_attempts,
            delay_schedule,
            attempts: AtomicU32::new(0),
            state: Mutex::new(EntryState::Ready),
            shared: Arc::new(HandleShared::new()),
        }
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        self.shared.cancel_token()
    }

    pub(crate) fn cancel_requested(&self) -> bool {
        self.shared.cancel_token().is_cancelled()
    }

    /// Attempts started so far.
    pub(crate) fn attempts_made(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    /// Claim the next attempt number (1-based).
    pub(crate) fn next_attempt(&self) -> u32 {
        self.attempts.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// The delay to wait after `failed_attempt` (1-based) fails. The last
    /// schedule element repeats for attempts past the end.
    pub(crate) fn retry_delay(&self, failed_attempt: u32) -> Duration {
        let idx = (failed_attempt.saturating_sub(1) as usize).min(self.delay_schedule.len() - 1);
        self.delay_schedule[idx]
    }

    pub(crate) fn expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// Total time this request has spent in the service.
    pub(crate) fn processing_time(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    pub(crate) fn state(&self) -> EntryState {
        *self.state.lock().unwrap()
    }

    pub(crate) fn set_state(&self, next: EntryState) {
        *self.state.lock().unwrap() = next;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn entry(schedule: &[Duration]) -> Entry<String, ()> {
        let now = Instant::now();
        Entry::new(
            1,
            "req".into(),
            now,
            now + Duration::from_secs(5),
            now,
            3,
            schedule.into(),
        )
    }

    #[test]
    fn attempt_numbers_are_one_based_and_monotonic() {
        let e = entry(&[Duration::from_millis(100)]);
        assert_eq!(e.attempts_made(), 0);
        assert_eq!(e.next_attempt(), 1);
        assert_eq!(e.next_attempt(), 2);
        assert_eq!(e.attempts_made(), 2);
    }

    #[test]
    fn schedule_last_element_repeats() {
        let e = entry(&[Duration::from_millis(100), Duration::from_millis(800)]);
        assert_eq!(e.retry_delay(1), Duration::from_millis(100));
        assert_eq!(e.retry_delay(2), Duration::from_millis(800));
        assert_eq!(e.retry_delay(3), Duration::from_millis(800));
        assert_eq!(e.retry_delay(9), Duration::from_millis(800));
    }
}

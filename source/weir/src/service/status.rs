//! Status snapshots
//!
//! A status is a point-in-time view assembled from every component's
//! counters. Snapshots are cached: callers pass the staleness they can
//! tolerate and the service only re-assembles when the cached view is too
//! old, so hot status polling stays cheap.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

/// A point-in-time view of the service.
#[derive(Debug, Clone)]
pub struct Status {
    /// When this snapshot was assembled
    pub created_at: Instant,
    /// New submissions would currently be admitted
    pub accepting_requests: bool,
    /// Description of the current control state
    pub control_state: String,
    /// The dispatcher task is running
    pub dispatcher_live: bool,
    /// Every delay drain task is running
    pub delay_drains_live: bool,
    /// The worker pool accepts reservations
    pub workers_live: bool,
    /// Attempts currently holding a worker slot
    pub active_workers: usize,
    /// Requests admitted and not yet settled
    pub live_requests: usize,
    /// Entries waiting on the main queue
    pub main_queue_size: usize,
    /// Entries parked on the delay queue
    pub delayed_requests: usize,
    /// Whole tickets available right now (estimate)
    pub estimated_tickets: usize,
    /// Configured attempt ceiling
    pub max_attempts: u32,
    /// Configured retry schedule
    pub delays_after_failure: Vec<Duration>,
    /// Configured pending-request cap
    pub max_pending_requests: usize,
    /// Configured early release window
    pub early_processing_grace: Duration,
}

pub(crate) struct StatusCache {
    cached: Mutex<Option<Arc<Status>>>,
}

impl StatusCache {
    pub(crate) fn new() -> Self {
        Self {
            cached: Mutex::new(None),
        }
    }

    /// Return the cached snapshot if it is younger than `max_age`,
    /// otherwise assemble a fresh one and cache it.
    pub(crate) fn get_or_refresh<F>(&self, max_age: Duration, assemble: F) -> Arc<Status>
    where
        F: FnOnce() -> Status,
    {
        let mut cached = self.cached.lock().unwrap();
        if let Some(status) = cached.as_ref() {
            if status.created_at.elapsed() <= max_age {
                return status.clone();
            }
        }
        let fresh = Arc::new(assemble());
        *cached = Some(fresh.clone());
        fresh
    }
}

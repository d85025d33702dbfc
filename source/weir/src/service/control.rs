//! Service lifecycle and the control state
//!
//! The control state is an immutable value describing what the service is
//! currently allowed and required to do. It is swapped atomically through a
//! watch channel; every component takes snapshots and is woken when the
//! value is replaced. The lifecycle phase gates the coarse transitions
//! (started, shutting down, shut down) and decides which control states may
//! be published.

use std::sync::Mutex;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::errors::LifecycleError;

/// The coarse lifecycle of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    NotStarted,
    Running,
    ShutdownInProgress,
    ShutDown,
}

impl LifecyclePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecyclePhase::NotStarted => "NOT_STARTED",
            LifecyclePhase::Running => "RUNNING",
            LifecyclePhase::ShutdownInProgress => "SHUTDOWN_IN_PROGRESS",
            LifecyclePhase::ShutDown => "SHUTDOWN",
        }
    }
}

/// What the service is currently allowed/required to do.
///
/// Values are immutable once published. Readers hold clones; a stale
/// snapshot is always safe because every wait point re-checks after a
/// control change wakes it.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlState {
    /// Text tag, surfaced in status reports
    pub description: String,
    /// New submissions are admitted
    pub accepting_submissions: bool,
    /// `false` treats every earliest-start as "now"
    pub honor_delays: bool,
    /// `false` requeues failed attempts immediately instead of delaying
    pub honor_retry_delays: bool,
    /// Dispatch may wait for rate limiter tickets at all
    pub wait_for_tickets: bool,
    /// Bound ticket waits to a short cap so shutdown progresses
    pub limit_ticket_wait: bool,
    /// Bound worker slot waits the same way
    pub limit_worker_wait: bool,
    /// Refuse to schedule further retries; one more failure ends the request
    pub timeout_after_failed_attempt: bool,
    /// Fail every queued entry immediately
    pub timeout_all_pending: bool,
    /// End of the spooldown window, if one is running
    pub spooldown_deadline: Option<Instant>,
}

impl ControlState {
    pub(crate) fn not_started() -> Self {
        Self {
            description: "not started".into(),
            accepting_submissions: false,
            honor_delays: true,
            honor_retry_delays: true,
            wait_for_tickets: true,
            limit_ticket_wait: false,
            limit_worker_wait: false,
            timeout_after_failed_attempt: false,
            timeout_all_pending: false,
            spooldown_deadline: None,
        }
    }

    pub(crate) fn running() -> Self {
        Self {
            description: "running".into(),
            accepting_submissions: true,
            ..Self::not_started()
        }
    }

    /// The base graceful-shutdown state: stop admitting, keep honoring
    /// delays and tickets, but cap every wait so the loop can notice the
    /// budget running out.
    pub fn draining(spooldown_deadline: Instant) -> Self {
        Self {
            description: "shutting down".into(),
            accepting_submissions: false,
            honor_delays: true,
            honor_retry_delays: true,
            wait_for_tickets: true,
            limit_ticket_wait: true,
            limit_worker_wait: true,
            timeout_after_failed_attempt: false,
            timeout_all_pending: false,
            spooldown_deadline: Some(spooldown_deadline),
        }
    }

    /// Shortcut flag: treat every earliest-start and retry delay as "now".
    pub fn ignore_delays(mut self) -> Self {
        self.honor_delays = false;
        self.honor_retry_delays = false;
        self.description = "shutting down (ignoring delays)".into();
        self
    }

    /// Shortcut flag: the next failed attempt ends its request.
    pub fn fail_after_attempt(mut self) -> Self {
        self.timeout_after_failed_attempt = true;
        self
    }

    /// Shortcut flag: fail all queued entries immediately.
    pub fn timeout_all_immediately(mut self) -> Self {
        self.timeout_all_pending = true;
        self.description = "shutting down (failing all pending)".into();
        self
    }

    /// The terminal state: nothing is admitted, nothing waits, everything
    /// still queued is failed out.
    pub(crate) fn shut_down() -> Self {
        Self {
            description: "shut down".into(),
            accepting_submissions: false,
            honor_delays: false,
            honor_retry_delays: false,
            wait_for_tickets: false,
            limit_ticket_wait: true,
            limit_worker_wait: true,
            timeout_after_failed_attempt: true,
            timeout_all_pending: true,
            spooldown_deadline: None,
        }
    }
}

/// Owns the phase and publishes control states.
pub(crate) struct Lifecycle {
    phase: Mutex<LifecyclePhase>,
    control_tx: watch::Sender<ControlState>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        let (control_tx, _rx) = watch::channel(ControlState::not_started());
        Self {
            phase: Mutex::new(LifecyclePhase::NotStarted),
            control_tx,
        }
    }

    pub(crate) fn phase(&self) -> LifecyclePhase {
        *self.phase.lock().unwrap()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ControlState> {
        self.control_tx.subscribe()
    }

    /// A clone of the currently published control state.
    pub(crate) fn snapshot(&self) -> ControlState {
        self.control_tx.borrow().clone()
    }

    /// `NOT_STARTED → RUNNING`. Any other phase is rejected.
    pub(crate) fn start(&self) -> Result<(), LifecycleError> {
        let mut phase = self.phase.lock().unwrap();
        match *phase {
            LifecyclePhase::NotStarted => {
                *phase = LifecyclePhase::Running;
                self.control_tx.send_replace(ControlState::running());
                tracing::info!("service started");
                Ok(())
            }
            other => Err(LifecycleError::NotInNotStarted {
                actual: other.as_str(),
            }),
        }
    }

    /// `NOT_STARTED | RUNNING → SHUTDOWN_IN_PROGRESS`, publishing the
    /// caller's policy. Returns `false` if a shutdown already ran or is
    /// running, in which case nothing is published.
    pub(crate) fn begin_shutdown(&self, state: ControlState) -> bool {
        let mut phase = self.phase.lock().unwrap();
        match *phase {
            LifecyclePhase::NotStarted | LifecyclePhase::Running => {
                *phase = LifecyclePhase::ShutdownInProgress;
                tracing::info!(policy = %state.description, "shutdown starting");
                self.control_tx.send_replace(state);
                true
            }
            LifecyclePhase::ShutdownInProgress | LifecyclePhase::ShutDown => false,
        }
    }

    /// `SHUTDOWN_IN_PROGRESS → SHUTDOWN`.
    pub(crate) fn finalize_shutdown(&self) {
        let mut phase = self.phase.lock().unwrap();
        *phase = LifecyclePhase::ShutDown;
        self.control_tx.send_replace(ControlState::shut_down());
        tracing::info!("shutdown complete");
    }
}

//! Post-attempt and expiry routing
//!
//! Every request leaves the service through exactly one of the `finish_*`
//! paths here. The completion slot enforces at-most-once settlement, so the
//! routing functions may be called from the dispatcher, a worker task, or a
//! delay drain without further coordination.

use std::error::Error;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::time::Instant;

use crate::errors::RequestError;
use crate::service::entry::{Entry, EntryState};
use crate::service::{events, Processor, ServiceCore};

/// The attempt returned a value: the request is done, and a success always
/// wins, even over a pending cancel or a passed deadline.
pub(crate) fn attempt_succeeded<P: Processor>(
    core: &ServiceCore<P>,
    entry: &Arc<Entry<P::Request, P::Response>>,
    attempt: u32,
    value: P::Response,
) {
    events::guard("attempt_succeeded", || {
        core.listener.attempt_succeeded(&entry.payload, attempt)
    });
    finish(core, entry, Ok(value));
}

/// The attempt failed (or was interrupted): decide the request's fate from
/// the control state, the deadline, and the remaining attempt budget.
pub(crate) fn attempt_failed<P: Processor>(
    core: &ServiceCore<P>,
    entry: &Arc<Entry<P::Request, P::Response>>,
    attempt: u32,
    error: Arc<dyn Error + Send + Sync>,
) {
    events::guard("attempt_failed", || {
        core.listener
            .attempt_failed(&entry.payload, attempt, error.as_ref())
    });
    tracing::debug!(id = entry.id, attempt, %error, "attempt failed");

    let state = core.lifecycle.snapshot();
    let now = Instant::now();

    if entry.cancel_requested() {
        finish(core, entry, Err(RequestError::Cancelled));
        return;
    }
    if state.timeout_all_pending {
        finish_timeout(core, entry, true);
        return;
    }
    if state.timeout_after_failed_attempt {
        finish_timeout(core, entry, true);
        return;
    }
    if entry.expired(now) {
        finish_timeout(core, entry, false);
        return;
    }
    if attempt >= entry.max_attempts {
        finish(
            core,
            entry,
            Err(RequestError::ExecutionFailure {
                attempts: attempt,
                last_error: error,
            }),
        );
        return;
    }

    // Retry. The release time is capped at the deadline so a long schedule
    // element cannot park the entry past its own expiry.
    let delay = entry.retry_delay(attempt);
    let release_at = (now + delay).min(entry.deadline);
    if state.honor_retry_delays {
        entry.set_state(EntryState::PendingDelay);
        events::guard("delay_scheduled", || {
            core.listener
                .delay_scheduled(&entry.payload, release_at.saturating_duration_since(now))
        });
        tracing::debug!(id = entry.id, attempt, ?delay, "retry scheduled");
        core.delay.insert(entry.clone(), release_at);
    } else {
        tracing::debug!(id = entry.id, attempt, "retrying immediately");
        core.release_ready(entry.clone());
    }
}

/// The deadline passed before an attempt could start.
pub(crate) fn expired<P: Processor>(
    core: &ServiceCore<P>,
    entry: &Arc<Entry<P::Request, P::Response>>,
) {
    finish_timeout(core, entry, false);
}

/// Shutdown policy failed the entry without (further) processing.
pub(crate) fn expire_during_shutdown<P: Processor>(
    core: &ServiceCore<P>,
    entry: &Arc<Entry<P::Request, P::Response>>,
) {
    finish_timeout(core, entry, true);
}

/// The caller's cancel request took effect.
pub(crate) fn cancelled<P: Processor>(
    core: &ServiceCore<P>,
    entry: &Arc<Entry<P::Request, P::Response>>,
) {
    finish(core, entry, Err(RequestError::Cancelled));
}

fn finish_timeout<P: Processor>(
    core: &ServiceCore<P>,
    entry: &Arc<Entry<P::Request, P::Response>>,
    shutdown_caused: bool,
) {
    let processing = entry.processing_time(Instant::now());
    let done = finish(core, entry, Err(RequestError::Timeout { processing }));
    if done && shutdown_caused {
        core.unprocessed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Write the terminal outcome, then report it. Returns `false` when the
/// request had already settled (the outcome is discarded, nothing fires).
fn finish<P: Processor>(
    core: &ServiceCore<P>,
    entry: &Arc<Entry<P::Request, P::Response>>,
    outcome: Result<P::Response, RequestError>,
) -> bool {
    let error = outcome.as_ref().err().cloned();
    if !entry.shared.complete(outcome) {
        return false;
    }
    tracing::trace!(id = entry.id, from = ?entry.state(), "settling entry");
    entry.set_state(EntryState::Completed);
    let attempts = entry.attempts_made();

    match &error {
        None => {
            tracing::debug!(id = entry.id, attempts, "request succeeded");
            events::guard("final_success", || {
                core.listener.final_success(&entry.payload, attempts)
            });
            events::guard("on_final_success", || {
                core.processor.on_final_success(&entry.payload, attempts)
            });
        }
        Some(RequestError::Cancelled) => {
            tracing::debug!(id = entry.id, attempts, "request cancelled");
            events::guard("cancelled", || core.listener.cancelled(&entry.payload));
        }
        Some(RequestError::Timeout { processing }) => {
            tracing::debug!(id = entry.id, attempts, ?processing, "request timed out");
            events::guard("final_timeout", || {
                core.listener.final_timeout(&entry.payload, *processing)
            });
            events::guard("on_final_timeout", || {
                core.processor.on_final_timeout(&entry.payload, *processing)
            });
        }
        Some(err @ RequestError::ExecutionFailure { .. }) => {
            tracing::debug!(id = entry.id, attempts, %err, "request failed");
            events::guard("final_failure", || {
                core.listener.final_failure(&entry.payload, err)
            });
            events::guard("on_final_failure", || {
                core.processor.on_final_failure(&entry.payload, err)
            });
        }
    }

    core.entry_settled();
    true
}

//! The dispatcher
//!
//! A single loop pulls ready entries off the main queue, applies the
//! control-state gates, waits in line for a rate limiter ticket, reserves a
//! worker slot, and hands the entry plus its attempt number to a worker
//! task. Every wait is raced against the entry's cancel signal and the
//! control channel, so cancellation and shutdown are observed at each
//! scheduling point.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::service::control::ControlState;
use crate::service::entry::Entry;
use crate::service::queue::MainQueueRx;
use crate::service::tickets::TicketOutcome;
use crate::service::workers::{self, SlotOutcome};
use crate::service::{outcome, Processor, ServiceCore};

/// Cap on a single ticket or slot wait while shutdown is in progress, so
/// the loop re-reads the control state often enough to notice the budget
/// running out.
const SPOOLDOWN_WAIT_CAP: Duration = Duration::from_millis(100);

pub(crate) async fn run_dispatcher<P: Processor>(
    core: Arc<ServiceCore<P>>,
    mut queue: MainQueueRx<Arc<Entry<P::Request, P::Response>>>,
) {
    let mut control = core.lifecycle.subscribe();

    'main: loop {
        // Mark the current control state seen so `changed` below only fires
        // on a genuinely new state.
        let _ = control.borrow_and_update();

        let entry = tokio::select! {
            biased;
            _ = core.stop.cancelled() => break 'main,
            res = control.changed() => {
                if res.is_err() {
                    break 'main;
                }
                continue 'main;
            }
            maybe = queue.recv() => match maybe {
                Some(entry) => entry,
                None => break 'main,
            },
        };

        let mut have_ticket = false;
        'entry: loop {
            let state = control.borrow_and_update().clone();
            let now = Instant::now();

            if entry.cancel_requested() {
                outcome::cancelled(&core, &entry);
                continue 'main;
            }
            if state.timeout_all_pending {
                outcome::expire_during_shutdown(&core, &entry);
                continue 'main;
            }
            if entry.expired(now) {
                outcome::expired(&core, &entry);
                continue 'main;
            }

            if !have_ticket {
                if core.bucket.try_acquire(1) {
                    have_ticket = true;
                } else if !state.wait_for_tickets {
                    outcome::expire_during_shutdown(&core, &entry);
                    continue 'main;
                } else {
                    let budget = wait_budget(state.limit_ticket_wait, &state, &entry, now);
                    let got = tokio::select! {
                        biased;
                        res = control.changed() => {
                            if res.is_err() {
                                break 'main;
                            }
                            continue 'entry;
                        }
                        out = core.bucket.acquire(1, budget, entry.cancel_token()) => out,
                    };
                    match got {
                        TicketOutcome::Granted => have_ticket = true,
                        TicketOutcome::Cancelled => {
                            outcome::cancelled(&core, &entry);
                            continue 'main;
                        }
                        TicketOutcome::TimedOut => {
                            route_unserved(&core, &entry);
                            continue 'main;
                        }
                    }
                }
            }

            let budget = wait_budget(state.limit_worker_wait, &state, &entry, now);
            let slot = tokio::select! {
                biased;
                res = control.changed() => {
                    if res.is_err() {
                        break 'main;
                    }
                    // The ticket is already ours; only the slot wait restarts.
                    continue 'entry;
                }
                out = core.workers.reserve_slot(budget, entry.cancel_token()) => out,
            };
            match slot {
                SlotOutcome::Reserved(permit) => {
                    let attempt = entry.next_attempt();
                    tokio::spawn(workers::run_attempt(
                        core.clone(),
                        entry.clone(),
                        attempt,
                        permit,
                    ));
                    continue 'main;
                }
                SlotOutcome::Cancelled => {
                    outcome::cancelled(&core, &entry);
                    continue 'main;
                }
                SlotOutcome::TimedOut => {
                    route_unserved(&core, &entry);
                    continue 'main;
                }
            }
        }
    }

    // Anything still queued when the loop exits is failed out rather than
    // left unsettled.
    for entry in queue.drain_now() {
        outcome::expire_during_shutdown(&core, &entry);
    }
    tracing::debug!("dispatcher exited");
}

/// How long this entry may wait at a gate: up to its own deadline under
/// normal operation, capped short while shutdown needs the loop responsive.
fn wait_budget<Rq, Rs>(
    limited: bool,
    _state: &ControlState,
    entry: &Entry<Rq, Rs>,
    now: Instant,
) -> Duration {
    let until_deadline = entry.deadline.saturating_duration_since(now);
    if limited {
        until_deadline.min(SPOOLDOWN_WAIT_CAP)
    } else {
        until_deadline
    }
}

/// A ticket or slot wait ran out. Under normal operation that means the
/// deadline arrived; under a capped spooldown wait the entry goes back on
/// the queue for the next control decision.
fn route_unserved<P: Processor>(
    core: &ServiceCore<P>,
    entry: &Arc<Entry<P::Request, P::Response>>,
) {
    if entry.expired(Instant::now()) {
        outcome::expired(core, entry);
    } else {
        core.release_ready(entry.clone());
    }
}

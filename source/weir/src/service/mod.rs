//! The request execution service
//!
//! [`Service`] accepts opaque requests, paces attempt starts through a
//! ticket bucket, retries failures on the configured delay schedule, honors
//! per-request deadlines and earliest-start constraints, bounds concurrency
//! with a worker slot pool, and shuts down under a caller-chosen policy.
//!
//! The moving parts:
//!
//! - a bounded main queue of ready entries (`queue`)
//! - a sharded, timer-driven delay queue (`delay`)
//! - a ticket bucket with a FIFO waiter line (`tickets`)
//! - a slot-bounded worker pool (`workers`)
//! - one dispatcher loop gluing them together (`dispatch`)
//!
//! all governed by a single control state ([`control`]) that every blocking
//! wait point observes.

pub mod control;
mod delay;
mod dispatch;
mod entry;
pub mod events;
pub mod handle;
mod outcome;
mod queue;
pub mod status;
mod tickets;
mod workers;


use std::pin::pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::internal::Config;
use crate::errors::{AttemptError, ConfigError, LifecycleError, RequestError, SubmitError};
use crate::service::control::{ControlState, Lifecycle, LifecyclePhase};
use crate::service::delay::DelayQueue;
use crate::service::entry::{Entry, EntryState};
use crate::service::events::{EventListener, NoopListener};
use crate::service::handle::RequestHandle;
use crate::service::queue::{main_queue, MainQueue, MainQueueRx};
use crate::service::status::{Status, StatusCache};
use crate::service::tickets::TicketBucket;
use crate::service::workers::WorkerPool;

/// How long the forced phase of a shutdown may take to settle stragglers
/// after the caller's budget has expired.
const FORCE_SETTLE_BUDGET: Duration = Duration::from_secs(1);

/// The user-supplied processing function, plus optional final-outcome hooks.
///
/// `process` is invoked once per attempt, on a worker slot. It may take as
/// long as it likes; the slot pool bounds how many run at once. Returning
/// `Err` records the attempt as failed and hands routing to the retry
/// machinery. An interruption during shutdown surfaces to the caller as a
/// failed attempt, not to `process` itself, which is simply dropped.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    type Request: Send + Sync + 'static;
    type Response: Send + Sync + 'static;

    async fn process(
        &self,
        request: &Self::Request,
        attempt: u32,
    ) -> Result<Self::Response, AttemptError>;

    /// Called once when a request settles successfully.
    fn on_final_success(&self, _request: &Self::Request, _attempts: u32) {}

    /// Called once when a request settles after exhausting attempts.
    fn on_final_failure(&self, _request: &Self::Request, _error: &RequestError) {}

    /// Called once when a request settles by deadline or shutdown policy.
    fn on_final_timeout(&self, _request: &Self::Request, _processing: Duration) {}
}

/// Shared state reachable from every task the service spawns.
pub(crate) struct ServiceCore<P: Processor> {
    pub(crate) config: Config,
    pub(crate) processor: P,
    pub(crate) listener: Box<dyn EventListener<P::Request>>,
    pub(crate) lifecycle: Lifecycle,
    pub(crate) bucket: TicketBucket,
    pub(crate) delay: DelayQueue<P::Request, P::Response>,
    pub(crate) queue: MainQueue<Arc<Entry<P::Request, P::Response>>>,
    pub(crate) workers: WorkerPool,
    /// Fires when the service is fully shut down; every task exits on it
    pub(crate) stop: CancellationToken,
    /// Requests admitted and not yet settled
    pub(crate) live: AtomicUsize,
    /// Requests failed out by shutdown policy, reported by `shutdown_for`
    pub(crate) unprocessed: AtomicUsize,
    idle: tokio::sync::Notify,
    next_id: AtomicU64,
    delay_schedule: Arc<[Duration]>,
}

impl<P: Processor> ServiceCore<P> {
    /// Hand an entry to the dispatcher. The queue has room for every live
    /// entry by construction; a refusal means the accounting broke, and the
    /// entry is failed out rather than lost.
    pub(crate) fn release_ready(&self, entry: Arc<Entry<P::Request, P::Response>>) {
        entry.set_state(EntryState::Ready);
        if let Err(entry) = self.queue.push(entry) {
            tracing::error!(id = entry.id, "main queue refused a live entry, failing it");
            outcome::expired(self, &entry);
        }
    }

    /// One request settled; wake shutdown if it was the last.
    pub(crate) fn entry_settled(&self) {
        let prev = self.live.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Wait until no requests are live.
    pub(crate) async fn wait_idle(&self) {
        loop {
            let mut notified = pin!(self.idle.notified());
            notified.as_mut().enable();
            if self.live.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct Tasks<P: Processor> {
    queue_rx: Option<MainQueueRx<Arc<Entry<P::Request, P::Response>>>>,
    dispatcher: Option<JoinHandle<()>>,
    drains: Vec<JoinHandle<()>>,
}

/// An in-process request executor with retries, rate limiting, and
/// policy-driven shutdown.
///
/// ```no_run
/// use std::time::Duration;
/// use async_trait::async_trait;
/// use weir::{AttemptError, Config, Processor, Service};
///
/// struct Upstream;
///
/// #[async_trait]
/// impl Processor for Upstream {
///     type Request = String;
///     type Response = usize;
///
///     async fn process(&self, request: &String, _attempt: u32) -> Result<usize, AttemptError> {
///         Ok(request.len())
///     }
/// }
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let service = Service::new(Config::default(), Upstream)?;
/// service.start()?;
/// let handle = service.submit("hello".to_string(), Duration::from_secs(5))?;
/// let len = handle.get(Duration::from_secs(5)).await?;
/// assert_eq!(len, 5);
/// service.shutdown_for(Duration::from_secs(1), false, false).await;
/// # Ok(())
/// # }
/// ```
pub struct Service<P: Processor> {
    core: Arc<ServiceCore<P>>,
    tasks: Mutex<Tasks<P>>,
    status_cache: StatusCache,
}

impl<P: Processor> Service<P> {
    /// Build a service with the default (no-op) event listener.
    pub fn new(config: Config, processor: P) -> Result<Self, ConfigError> {
        Self::with_listener(config, processor, Box::new(NoopListener))
    }

    /// Build a service that reports lifecycle events to `listener`.
    pub fn with_listener(
        config: Config,
        processor: P,
        listener: Box<dyn EventListener<P::Request>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let (queue_tx, queue_rx) = main_queue(config.max_pending_requests);
        let core = Arc::new(ServiceCore {
            bucket: TicketBucket::new(
                config.bucket_size,
                config.refill_qty,
                config.refill_interval,
            ),
            delay: DelayQueue::new(config.delay_queue_shards),
            queue: queue_tx,
            workers: WorkerPool::new(config.max_workers),
            lifecycle: Lifecycle::new(),
            stop: CancellationToken::new(),
            live: AtomicUsize::new(0),
            unprocessed: AtomicUsize::new(0),
            idle: tokio::sync::Notify::new(),
            next_id: AtomicU64::new(0),
            delay_schedule: config.delays_after_failure.clone().into(),
            processor,
            listener,
            config,
        });

        Ok(Self {
            core,
            tasks: Mutex::new(Tasks {
                queue_rx: Some(queue_rx),
                dispatcher: None,
                drains: Vec::new(),
            }),
            status_cache: StatusCache::new(),
        })
    }

    /// The configuration the service was built with.
    pub fn config(&self) -> &Config {
        &self.core.config
    }

    /// Spawn the dispatcher and delay drains and begin accepting requests.
    ///
    /// Must be called from within a tokio runtime. Starting any state other
    /// than a fresh service is rejected.
    pub fn start(&self) -> Result<(), LifecycleError> {
        self.core.lifecycle.start()?;

        let mut tasks = self.tasks.lock().unwrap();
        let queue_rx = tasks
            .queue_rx
            .take()
            .expect("queue receiver present until first start");
        tasks.dispatcher = Some(tokio::spawn(dispatch::run_dispatcher(
            self.core.clone(),
            queue_rx,
        )));
        for shard in self.core.delay.shards() {
            tasks.drains.push(tokio::spawn(delay::run_drain(
                self.core.clone(),
                shard.clone(),
            )));
        }
        tracing::info!(
            service = %self.core.config.service_name,
            shards = self.core.config.delay_queue_shards,
            workers = self.core.config.max_workers,
            "service tasks spawned"
        );
        Ok(())
    }

    /// Submit a request valid for `validity` from now, with no earliest
    /// start constraint.
    pub fn submit(
        &self,
        payload: P::Request,
        validity: Duration,
    ) -> Result<RequestHandle<P::Response>, SubmitError> {
        let now = Instant::now();
        self.submit_with_earliest_delay_until(payload, now + validity, now)
    }

    /// Submit a request valid for `validity` from now whose first attempt
    /// may not start for another `delay`.
    pub fn submit_with_earliest_delay_for(
        &self,
        payload: P::Request,
        validity: Duration,
        delay: Duration,
    ) -> Result<RequestHandle<P::Response>, SubmitError> {
        let now = Instant::now();
        self.submit_with_earliest_delay_until(payload, now + validity, now + delay)
    }

    /// Submit with absolute deadline and earliest-start instants.
    ///
    /// `earliest_start` past `deadline` is accepted; the request expires
    /// without any attempt being made.
    pub fn submit_with_earliest_delay_until(
        &self,
        payload: P::Request,
        deadline: Instant,
        earliest_start: Instant,
    ) -> Result<RequestHandle<P::Response>, SubmitError> {
        let core = &self.core;
        match core.lifecycle.phase() {
            LifecyclePhase::NotStarted => return Err(SubmitError::NotStarted),
            LifecyclePhase::ShutdownInProgress => return Err(SubmitError::BeingShutDown),
            LifecyclePhase::ShutDown => return Err(SubmitError::AlreadyShutDown),
            LifecyclePhase::Running => {}
        }
        events::guard("submitted", || core.listener.submitted(&payload));

        // Claim a live slot, or reject. The counter covers queued, delayed,
        // and in-flight entries together.
        let limit = core.config.max_pending_requests;
        let mut current = core.live.load(Ordering::Acquire);
        loop {
            if current >= limit {
                events::guard("rejected_too_many_pending", || {
                    core.listener.rejected_too_many_pending(&payload)
                });
                return Err(SubmitError::TooManyPendingRequests { limit });
            }
            match core.live.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        let now = Instant::now();
        let id = core.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(Entry::new(
            id,
            payload,
            now,
            deadline,
            earliest_start,
            core.config.max_attempts,
            core.delay_schedule.clone(),
        ));
        let handle = RequestHandle::new(entry.shared.clone());
        events::guard("admitted", || core.listener.admitted(&entry.payload));
        tracing::debug!(id, "request admitted");

        if entry.expired(now) {
            // Submitted already past its deadline: expires without attempts
            outcome::expired(core, &entry);
        } else if entry.earliest_start > now + core.config.early_processing_grace {
            let release_at = entry.earliest_start;
            entry.set_state(EntryState::PendingDelay);
            events::guard("delay_scheduled", || {
                core.listener
                    .delay_scheduled(&entry.payload, release_at.saturating_duration_since(now))
            });
            core.delay.insert(entry, release_at);
        } else {
            core.release_ready(entry);
        }
        Ok(handle)
    }

    /// Shut down with a spooldown budget and the shortcut policy flags:
    /// `ignore_delays` releases every parked entry immediately;
    /// `timeout_all_pending` fails all queued work and interrupts in-flight
    /// attempts.
    ///
    /// Returns the number of requests failed out by the shutdown rather
    /// than processed. Shutting down an already shut-down service is a
    /// no-op returning 0.
    pub async fn shutdown_for(
        &self,
        budget: Duration,
        ignore_delays: bool,
        timeout_all_pending: bool,
    ) -> usize {
        let deadline = Instant::now() + budget;
        let mut state = ControlState::draining(deadline);
        if ignore_delays {
            state = state.ignore_delays();
        }
        if timeout_all_pending {
            state = state.timeout_all_immediately();
        }
        self.shutdown_with(budget, state).await
    }

    /// Shut down under a fully-specified control state. The state replaces
    /// whatever the shortcut flags would have produced wholesale.
    pub async fn shutdown_with(&self, budget: Duration, state: ControlState) -> usize {
        let core = &self.core;
        let interrupt_now = state.timeout_all_pending;
        if !core.lifecycle.begin_shutdown(state) {
            return 0;
        }
        if interrupt_now {
            core.workers.interrupt_in_flight();
        }

        let deadline = Instant::now() + budget;
        let drained = tokio::select! {
            _ = core.wait_idle() => true,
            _ = tokio::time::sleep_until(deadline) => false,
        };

        if drained {
            tracing::info!("all work settled within the shutdown budget");
        } else {
            tracing::info!("shutdown budget expired, failing remaining work");
        }

        // Terminal state: drains and the dispatcher fail out whatever is
        // left, in-flight attempts are interrupted.
        core.lifecycle.finalize_shutdown();
        if !drained {
            core.workers.interrupt_in_flight();
            tokio::select! {
                _ = core.wait_idle() => {}
                _ = tokio::time::sleep(FORCE_SETTLE_BUDGET) => {
                    tracing::warn!(
                        live = core.live.load(Ordering::Acquire),
                        "entries still unsettled after forced shutdown"
                    );
                }
            }
        }

        core.workers.close();
        core.stop.cancel();
        core.unprocessed.load(Ordering::Acquire)
    }

    /// A status snapshot no older than `max_cache_age`.
    pub fn status(&self, max_cache_age: Duration) -> Arc<Status> {
        self.status_cache
            .get_or_refresh(max_cache_age, || self.snapshot_status())
    }

    fn snapshot_status(&self) -> Status {
        let core = &self.core;
        let tasks = self.tasks.lock().unwrap();
        let control = core.lifecycle.snapshot();
        Status {
            created_at: Instant::now(),
            accepting_requests: control.accepting_submissions
                && core.lifecycle.phase() == LifecyclePhase::Running,
            control_state: control.description.clone(),
            dispatcher_live: tasks
                .dispatcher
                .as_ref()
                .map(|h| !h.is_finished())
                .unwrap_or(false),
            delay_drains_live: !tasks.drains.is_empty()
                && tasks.drains.iter().all(|h| !h.is_finished()),
            workers_live: core.workers.is_live(),
            active_workers: core.workers.active(),
            live_requests: core.live.load(Ordering::Acquire),
            main_queue_size: core.queue.len(),
            delayed_requests: core.delay.len(),
            estimated_tickets: core.bucket.estimate_available(),
            max_attempts: core.config.max_attempts,
            delays_after_failure: core.config.delays_after_failure.clone(),
            max_pending_requests: core.config.max_pending_requests,
            early_processing_grace: core.config.early_processing_grace,
        }
    }
}

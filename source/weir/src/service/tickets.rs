//! Ticket bucket rate limiting
//!
//! One ticket is consumed per attempt start. The bucket refills in discrete
//! intervals: every `refill_interval`, `refill_qty` tickets are added, capped
//! at `capacity`. Refill is computed lazily from elapsed time on every
//! access, so there is no background refill task.
//!
//! Fairness is strict FIFO among waiters, and a small waiter never jumps
//! ahead of a large one - head-of-line blocking is intentional so pacing
//! stays predictable. `try_acquire` refuses whenever waiters exist for the
//! same reason.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why `acquire` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TicketOutcome {
    /// Tickets were deducted for the caller
    Granted,
    /// The wait budget ran out first
    TimedOut,
    /// The cancel signal fired first
    Cancelled,
}

pub(crate) struct TicketBucket {
    inner: Mutex<BucketInner>,
}

struct BucketInner {
    /// Fractional internally; exposed as a whole-ticket estimate
    tokens: f64,
    capacity: f64,
    refill_qty: f64,
    refill_interval: Duration,
    last_refill: Instant,
    next_waiter_id: u64,
    waiters: VecDeque<Waiter>,
}

struct Waiter {
    id: u64,
    needed: f64,
    grant: oneshot::Sender<()>,
}

impl TicketBucket {
    /// A full bucket. `capacity` is both the burst size and the initial fill.
    pub(crate) fn new(capacity: usize, refill_qty: usize, refill_interval: Duration) -> Self {
        Self {
            inner: Mutex::new(BucketInner {
                tokens: capacity as f64,
                capacity: capacity as f64,
                refill_qty: refill_qty as f64,
                refill_interval,
                last_refill: Instant::now(),
                next_waiter_id: 0,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Take `n` tickets right now, or nothing.
    ///
    /// Refuses when any waiter is queued, even if enough tickets are
    /// available: barging past the queue would break FIFO pacing.
    pub(crate) fn try_acquire(&self, n: usize) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.refill(Instant::now());
        if inner.waiters.is_empty() && inner.tokens >= n as f64 {
            inner.tokens -= n as f64;
            true
        } else {
            false
        }
    }

    /// Whole tickets available right now. Snapshot only; the value may be
    /// stale by the time the caller looks at it.
    pub(crate) fn estimate_available(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        inner.refill(Instant::now());
        inner.tokens as usize
    }

    /// Wait in line for `n` tickets.
    ///
    /// Returns [`TicketOutcome::Granted`] with the tickets deducted, or the
    /// reason no grant happened. The wait is bounded by `max_wait` and by
    /// `cancel`; a waiter that leaves is unlinked from the queue so it never
    /// blocks those behind it.
    pub(crate) async fn acquire(
        &self,
        n: usize,
        max_wait: Duration,
        cancel: &CancellationToken,
    ) -> TicketOutcome {
        let deadline = Instant::now() + max_wait;

        let (id, mut rx) = {
            let mut inner = self.inner.lock().unwrap();
            inner.refill(Instant::now());
            if inner.waiters.is_empty() && inner.tokens >= n as f64 {
                inner.tokens -= n as f64;
                return TicketOutcome::Granted;
            }
            let (tx, rx) = oneshot::channel();
            let id = inner.next_waiter_id;
            inner.next_waiter_id += 1;
            inner.waiters.push_back(Waiter {
                id,
                needed: n as f64,
                grant: tx,
            });
            (id, rx)
        };

        enum Wake {
            Granted(bool),
            Cancelled,
            Deadline,
            Refill,
        }

        let mut guard = WaiterGuard {
            bucket: self,
            id,
            needed: n as f64,
            armed: true,
        };

        loop {
            // The lazy refill means nobody adds tickets while we sleep, so
            // the queue head must wake itself at each refill boundary.
            let next_refill = {
                let inner = self.inner.lock().unwrap();
                inner.last_refill + inner.refill_interval
            };

            let wake = tokio::select! {
                biased;
                res = &mut rx => Wake::Granted(res.is_ok()),
                _ = cancel.cancelled() => Wake::Cancelled,
                _ = tokio::time::sleep_until(deadline) => Wake::Deadline,
                _ = tokio::time::sleep_until(next_refill) => Wake::Refill,
            };

            match wake {
                Wake::Granted(true) => {
                    guard.armed = false;
                    return TicketOutcome::Granted;
                }
                Wake::Granted(false) => {
                    // The bucket dropped our waiter without granting;
                    // nothing left to wait for.
                    guard.armed = false;
                    return TicketOutcome::Cancelled;
                }
                Wake::Cancelled => {
                    guard.armed = false;
                    return self.unlink(id, &mut rx, TicketOutcome::Cancelled);
                }
                Wake::Deadline => {
                    guard.armed = false;
                    return self.unlink(id, &mut rx, TicketOutcome::TimedOut);
                }
                Wake::Refill => {
                    let mut inner = self.inner.lock().unwrap();
                    inner.refill(Instant::now());
                }
            }
        }
    }

    /// Take a leaving waiter out of the queue. If the grant raced the
    /// wakeup, keep the grant instead of the leaving reason.
    fn unlink(
        &self,
        id: u64,
        rx: &mut oneshot::Receiver<()>,
        reason: TicketOutcome,
    ) -> TicketOutcome {
        let mut inner = self.inner.lock().unwrap();
        if let Some(idx) = inner.waiters.iter().position(|w| w.id == id) {
            inner.waiters.remove(idx);
            inner.pump();
            reason
        } else {
            match rx.try_recv() {
                Ok(()) => TicketOutcome::Granted,
                Err(_) => reason,
            }
        }
    }
}

impl BucketInner {
    /// Add tickets for every whole refill interval that elapsed, then grant
    /// whatever the queue head(s) can take.
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed >= self.refill_interval {
            let intervals = elapsed.as_nanos() / self.refill_interval.as_nanos();
            self.tokens = (self.tokens + intervals as f64 * self.refill_qty).min(self.capacity);
            let leftover = elapsed.as_nanos() % self.refill_interval.as_nanos();
            self.last_refill = now - Duration::from_nanos(leftover as u64);
        }
        self.pump();
    }

    /// Grant head-first while tickets last.
    fn pump(&mut self) {
        while let Some(head) = self.waiters.front() {
            if self.tokens < head.needed {
                break;
            }
            self.tokens -= head.needed;
            let waiter = self.waiters.pop_front().unwrap();
            let needed = waiter.needed;
            if waiter.grant.send(()).is_err() {
                // The waiter left between grant and delivery; hand the
                // tickets back and keep pumping.
                self.tokens = (self.tokens + needed).min(self.capacity);
            }
        }
    }
}

/// Unlinks a waiter whose `acquire` future was dropped mid-wait.
///
/// `acquire` can be raced from the outside (the dispatcher selects over it),
/// so cleanup has to live in a drop guard rather than in the happy path.
/// Every internal exit disarms the guard first; an armed drop therefore
/// means the future died while still queued (unlink it) or just after a
/// grant it never saw (refund the tickets).
struct WaiterGuard<'a> {
    bucket: &'a TicketBucket,
    id: u64,
    needed: f64,
    armed: bool,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut inner = self.bucket.inner.lock().unwrap();
        if let Some(idx) = inner.waiters.iter().position(|w| w.id == self.id) {
            inner.waiters.remove(idx);
            inner.pump();
        } else {
            // Granted but never observed; refund so the tickets aren't lost.
            inner.tokens = (inner.tokens + self.needed).min(inner.capacity);
            inner.pump();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn smoke() {
        let _ = tracing_subscriber::fmt::try_init();
        let bucket = TicketBucket::new(3, 1, Duration::from_millis(10));
        let none = CancellationToken::new();

        let start = Instant::now();
        for _ in 0..10 {
            let out = bucket.acquire(1, Duration::from_secs(5), &none).await;
            assert_eq!(out, TicketOutcome::Granted);
        }
        // 3 burst tickets, then 7 refills at 10ms apiece
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(70), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(110), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn fifo_granting_order() {
        let bucket = Arc::new(TicketBucket::new(1, 1, Duration::from_millis(10)));
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = vec![];
        for label in 0..4u32 {
            let bucket = bucket.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let none = CancellationToken::new();
                let out = bucket.acquire(1, Duration::from_secs(5), &none).await;
                assert_eq!(out, TicketOutcome::Granted);
                order.lock().unwrap().push(label);
            }));
            // Give each waiter time to enqueue before the next arrives
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn small_waiter_does_not_jump_a_large_one() {
        let bucket = Arc::new(TicketBucket::new(3, 1, Duration::from_millis(10)));
        assert!(bucket.try_acquire(3));

        let big = {
            let bucket = bucket.clone();
            tokio::spawn(async move {
                let none = CancellationToken::new();
                bucket.acquire(3, Duration::from_secs(5), &none).await
            })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;

        let small = {
            let bucket = bucket.clone();
            tokio::spawn(async move {
                let none = CancellationToken::new();
                let start = Instant::now();
                let out = bucket.acquire(1, Duration::from_secs(5), &none).await;
                (out, start.elapsed())
            })
        };

        assert_eq!(big.await.unwrap(), TicketOutcome::Granted);
        let (out, waited) = small.await.unwrap();
        assert_eq!(out, TicketOutcome::Granted);
        // The small waiter had to sit behind the 3-ticket head
        assert!(waited >= Duration::from_millis(30), "{waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn try_acquire_never_barges() {
        let bucket = Arc::new(TicketBucket::new(2, 1, Duration::from_millis(50)));
        assert!(bucket.try_acquire(2));

        let waiter = {
            let bucket = bucket.clone();
            tokio::spawn(async move {
                let none = CancellationToken::new();
                bucket.acquire(2, Duration::from_secs(5), &none).await
            })
        };
        tokio::time::sleep(Duration::from_millis(60)).await;

        // One ticket exists, but the queued waiter needs two; a polite
        // try_acquire must not steal it.
        assert_eq!(bucket.estimate_available(), 1);
        assert!(!bucket.try_acquire(1));

        assert_eq!(waiter.await.unwrap(), TicketOutcome::Granted);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(bucket.try_acquire(1));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_and_cancel_are_reported() {
        let bucket = TicketBucket::new(1, 1, Duration::from_secs(60));
        assert!(bucket.try_acquire(1));
        let none = CancellationToken::new();

        let out = bucket.acquire(1, Duration::from_millis(20), &none).await;
        assert_eq!(out, TicketOutcome::TimedOut);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let out = bucket.acquire(1, Duration::from_secs(5), &cancel).await;
        assert_eq!(out, TicketOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn dead_head_does_not_block_the_queue() {
        let bucket = Arc::new(TicketBucket::new(5, 1, Duration::from_millis(10)));
        assert!(bucket.try_acquire(5));

        // Head wants 5 tickets but gives up after 15ms
        let head = {
            let bucket = bucket.clone();
            tokio::spawn(async move {
                let none = CancellationToken::new();
                bucket.acquire(5, Duration::from_millis(15), &none).await
            })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;

        let behind = {
            let bucket = bucket.clone();
            tokio::spawn(async move {
                let none = CancellationToken::new();
                let start = Instant::now();
                let out = bucket.acquire(1, Duration::from_secs(5), &none).await;
                (out, start.elapsed())
            })
        };

        assert_eq!(head.await.unwrap(), TicketOutcome::TimedOut);
        let (out, waited) = behind.await.unwrap();
        assert_eq!(out, TicketOutcome::Granted);
        // Freed as soon as the head left plus one refill, not after 50ms
        assert!(waited < Duration::from_millis(40), "{waited:?}");
    }

    #[test]
    fn estimate_reflects_lazy_refill() {
        let bucket = TicketBucket::new(4, 2, Duration::from_secs(1));
        assert_eq!(bucket.estimate_available(), 4);
        assert!(bucket.try_acquire(3));
        assert_eq!(bucket.estimate_available(), 1);
    }
}

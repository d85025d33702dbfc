//! The sharded delay queue
//!
//! Entries waiting on an earliest-start or a retry delay sit in one of N
//! shards, each a timer-ordered min-heap with its own drain task. Sharding
//! spreads release fan-out across tasks; ordering only matters within a
//! shard. A shard's drain sleeps until its head is due, releases everything
//! inside the grace window, and re-evaluates whenever an earlier head is
//! inserted or the control state changes.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::service::entry::Entry;
use crate::service::{outcome, Processor, ServiceCore};

pub(crate) struct DelayQueue<Rq, Rs> {
    shards: Vec<Arc<Shard<Rq, Rs>>>,
}

impl<Rq, Rs> DelayQueue<Rq, Rs> {
    pub(crate) fn new(shard_count: usize) -> Self {
        let shards = (0..shard_count).map(|_| Arc::new(Shard::new())).collect();
        Self { shards }
    }

    pub(crate) fn shards(&self) -> &[Arc<Shard<Rq, Rs>>] {
        &self.shards
    }

    /// Park `entry` until `release_at`. The owning shard is chosen by entry
    /// id, so an entry always returns to the same shard across retries.
    pub(crate) fn insert(&self, entry: Arc<Entry<Rq, Rs>>, release_at: Instant) {
        let shard = &self.shards[(entry.id % self.shards.len() as u64) as usize];
        shard.push(entry, release_at);
    }

    pub(crate) fn len(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }
}

pub(crate) struct Shard<Rq, Rs> {
    inner: Mutex<ShardInner<Rq, Rs>>,
    wake: Notify,
}

struct ShardInner<Rq, Rs> {
    heap: BinaryHeap<Delayed<Rq, Rs>>,
    seq: u64,
}

/// Heap element: earliest `release_at` first, insertion order as tiebreak.
struct Delayed<Rq, Rs> {
    release_at: Instant,
    seq: u64,
    entry: Arc<Entry<Rq, Rs>>,
}

impl<Rq, Rs> PartialEq for Delayed<Rq, Rs> {
    fn eq(&self, other: &Self) -> bool {
        self.release_at == other.release_at && self.seq == other.seq
    }
}

impl<Rq, Rs> Eq for Delayed<Rq, Rs> {}

impl<Rq, Rs> PartialOrd for Delayed<Rq, Rs> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<Rq, Rs> Ord for Delayed<Rq, Rs> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed so that BinaryHeap's max-heap yields the earliest release
        (other.release_at, other.seq).cmp(&(self.release_at, self.seq))
    }
}

impl<Rq, Rs> Shard<Rq, Rs> {
    fn new() -> Self {
        Self {
            inner: Mutex::new(ShardInner {
                heap: BinaryHeap::new(),
                seq: 0,
            }),
            wake: Notify::new(),
        }
    }

    pub(crate) fn push(&self, entry: Arc<Entry<Rq, Rs>>, release_at: Instant) {
        {
            let mut inner = self.inner.lock().unwrap();
            let seq = inner.seq;
            inner.seq += 1;
            inner.heap.push(Delayed {
                release_at,
                seq,
                entry,
            });
        }
        self.wake.notify_one();
    }

    /// Pop the head if it is due by `due_by`.
    pub(crate) fn pop_due(&self, due_by: Instant) -> Option<Arc<Entry<Rq, Rs>>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.heap.peek()?.release_at <= due_by {
            Some(inner.heap.pop().unwrap().entry)
        } else {
            None
        }
    }

    /// Pop the head regardless of its release time.
    pub(crate) fn pop_any(&self) -> Option<Arc<Entry<Rq, Rs>>> {
        let mut inner = self.inner.lock().unwrap();
        inner.heap.pop().map(|d| d.entry)
    }

    /// The current head's release time and entry, without popping.
    pub(crate) fn head(&self) -> Option<(Instant, Arc<Entry<Rq, Rs>>)> {
        let inner = self.inner.lock().unwrap();
        inner
            .heap
            .peek()
            .map(|d| (d.release_at, d.entry.clone()))
    }

    /// Take a specific entry out of the shard, if it is still parked here.
    pub(crate) fn remove(&self, entry_id: u64) -> Option<Arc<Entry<Rq, Rs>>> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.heap.iter().any(|d| d.entry.id == entry_id) {
            return None;
        }
        let mut found = None;
        let drained = std::mem::take(&mut inner.heap);
        inner.heap = drained
            .into_iter()
            .filter_map(|d| {
                if d.entry.id == entry_id {
                    found = Some(d.entry);
                    None
                } else {
                    Some(d)
                }
            })
            .collect();
        found
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap().heap.len()
    }
}

/// One shard's drain loop.
pub(crate) async fn run_drain<P: Processor>(
    core: Arc<ServiceCore<P>>,
    shard: Arc<Shard<P::Request, P::Response>>,
) {
    let mut control = core.lifecycle.subscribe();
    let grace = core.config.early_processing_grace;

    loop {
        if core.stop.is_cancelled() {
            return;
        }
        let state = control.borrow_and_update().clone();

        if state.timeout_all_pending {
            while let Some(entry) = shard.pop_any() {
                tracing::debug!(id = entry.id, "failing delayed entry during shutdown");
                outcome::expire_during_shutdown(&core, &entry);
            }
        }

        // Release everything due, where "due" honors the grace window and
        // collapses to "everything" when delays are not being honored.
        loop {
            let popped = if state.honor_delays {
                shard.pop_due(Instant::now() + grace)
            } else {
                shard.pop_any()
            };
            let Some(entry) = popped else { break };
            if entry.cancel_requested() {
                outcome::cancelled(&core, &entry);
            } else {
                core.release_ready(entry);
            }
        }

        match shard.head() {
            Some((release_at, entry)) => {
                tokio::select! {
                    _ = core.stop.cancelled() => return,
                    _ = shard.wake.notified() => {}
                    res = control.changed() => {
                        if res.is_err() {
                            return;
                        }
                    }
                    _ = tokio::time::sleep_until(release_at) => {}
                    _ = entry.cancel_token().cancelled() => {
                        // The head was cancelled while parked; settle it
                        // without waiting for its release time.
                        if let Some(e) = shard.remove(entry.id) {
                            outcome::cancelled(&core, &e);
                        }
                    }
                }
            }
            None => {
                tokio::select! {
                    _ = core.stop.cancelled() => return,
                    _ = shard.wake.notified() => {}
                    res = control.changed() => {
                        if res.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    fn entry(id: u64) -> Arc<Entry<String, ()>> {
        let now = Instant::now();
        Arc::new(Entry::new(
            id,
            format!("req-{id}"),
            now,
            now + Duration::from_secs(60),
            now,
            3,
            [Duration::from_millis(100)].into(),
        ))
    }

    #[tokio::test]
    async fn pops_in_release_order() {
        let shard: Shard<String, ()> = Shard::new();
        let now = Instant::now();
        shard.push(entry(1), now + Duration::from_millis(300));
        shard.push(entry(2), now + Duration::from_millis(100));
        shard.push(entry(3), now + Duration::from_millis(200));

        let far = now + Duration::from_secs(1);
        assert_eq!(shard.pop_due(far).unwrap().id, 2);
        assert_eq!(shard.pop_due(far).unwrap().id, 3);
        assert_eq!(shard.pop_due(far).unwrap().id, 1);
        assert!(shard.pop_due(far).is_none());
    }

    #[tokio::test]
    async fn due_by_respects_release_times() {
        let shard: Shard<String, ()> = Shard::new();
        let now = Instant::now();
        shard.push(entry(1), now + Duration::from_millis(500));
        assert!(shard.pop_due(now + Duration::from_millis(100)).is_none());
        assert!(shard.pop_due(now + Duration::from_millis(500)).is_some());
    }

    #[tokio::test]
    async fn equal_release_times_keep_insertion_order() {
        let shard: Shard<String, ()> = Shard::new();
        let at = Instant::now() + Duration::from_millis(100);
        for id in 1..=4 {
            shard.push(entry(id), at);
        }
        let far = at + Duration::from_secs(1);
        for id in 1..=4 {
            assert_eq!(shard.pop_due(far).unwrap().id, id);
        }
    }

    #[tokio::test]
    async fn remove_takes_the_right_entry() {
        let shard: Shard<String, ()> = Shard::new();
        let now = Instant::now();
        shard.push(entry(1), now + Duration::from_millis(100));
        shard.push(entry(2), now + Duration::from_millis(200));

        assert!(shard.remove(9).is_none());
        assert_eq!(shard.remove(1).unwrap().id, 1);
        assert_eq!(shard.len(), 1);
        assert_eq!(shard.pop_any().unwrap().id, 2);
    }

    #[tokio::test]
    async fn entries_shard_by_id() {
        let dq: DelayQueue<String, ()> = DelayQueue::new(2);
        let now = Instant::now();
        for id in 0..6 {
            dq.insert(entry(id), now + Duration::from_millis(100));
        }
        assert_eq!(dq.len(), 6);
        assert_eq!(dq.shards()[0].len(), 3);
        assert_eq!(dq.shards()[1].len(), 3);
    }
}

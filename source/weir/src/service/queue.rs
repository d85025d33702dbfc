//! The main dispatch queue
//!
//! A bounded FIFO handoff from submit / delay drains to the dispatcher. The
//! channel capacity equals the pending-request cap, and the live-entry
//! counter enforces the combined bound at submit, so a push from inside the
//! service always finds room; a full channel here means the accounting is
//! broken, which callers treat as an entry failure rather than a reason to
//! block.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

pub(crate) fn main_queue<T>(capacity: usize) -> (MainQueue<T>, MainQueueRx<T>) {
    let (tx, rx) = mpsc::channel(capacity);
    let depth = Arc::new(AtomicUsize::new(0));
    (
        MainQueue {
            tx,
            depth: depth.clone(),
        },
        MainQueueRx { rx, depth },
    )
}

/// Producer half, cloned into submit and every delay drain.
pub(crate) struct MainQueue<T> {
    tx: mpsc::Sender<T>,
    depth: Arc<AtomicUsize>,
}

impl<T> Clone for MainQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            depth: self.depth.clone(),
        }
    }
}

impl<T> MainQueue<T> {
    /// Enqueue without blocking. Returns the item back on failure.
    pub(crate) fn push(&self, item: T) -> Result<(), T> {
        match self.tx.try_send(item) {
            Ok(()) => {
                self.depth.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(item))
            | Err(mpsc::error::TrySendError::Closed(item)) => Err(item),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }
}

/// Consumer half, owned by the dispatcher.
pub(crate) struct MainQueueRx<T> {
    rx: mpsc::Receiver<T>,
    depth: Arc<AtomicUsize>,
}

impl<T> MainQueueRx<T> {
    /// Wait for the next entry. The dispatcher races this against its
    /// control signals.
    pub(crate) async fn recv(&mut self) -> Option<T> {
        let item = self.rx.recv().await;
        if item.is_some() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
        }
        item
    }

    /// Drain whatever is immediately available.
    pub(crate) fn drain_now(&mut self) -> Vec<T> {
        let mut out = vec![];
        while let Ok(item) = self.rx.try_recv() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
            out.push(item);
        }
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn fifo_and_depth() {
        let (q, mut rx) = main_queue(4);
        q.push(1).unwrap();
        q.push(2).unwrap();
        assert_eq!(q.len(), 2);
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(q.len(), 0);
    }

    #[tokio::test]
    async fn full_queue_returns_the_item() {
        let (q, _rx) = main_queue(1);
        q.push(1).unwrap();
        assert_eq!(q.push(2), Err(2));
    }
}

//! The caller-visible completion handle
//!
//! A [`RequestHandle`] is the only thing a caller keeps after `submit`: it
//! can wait for the outcome, ask for cancellation, and query completion
//! flags. It holds no ownership of the entry itself - the service owns that -
//! only the shared completion slot and the cancel signal.

use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::errors::{GetError, RequestError};

/// The completion slot shared between the service and the handle.
///
/// The slot is written exactly once; later writes are refused so that a
/// settled request can never settle again.
#[derive(Debug)]
pub(crate) struct HandleShared<Rs> {
    slot: Mutex<Option<Result<Rs, RequestError>>>,
    done: Notify,
    is_done: AtomicBool,
    successful: AtomicBool,
    cancelled: AtomicBool,
    cancel_requested: CancellationToken,
}

impl<Rs> HandleShared<Rs> {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            done: Notify::new(),
            is_done: AtomicBool::new(false),
            successful: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            cancel_requested: CancellationToken::new(),
        }
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_requested
    }

    /// Write the outcome and wake every waiter. Returns `false` if the slot
    /// was already written, in which case `outcome` is discarded.
    pub(crate) fn complete(&self, outcome: Result<Rs, RequestError>) -> bool {
        {
            let mut slot = self.slot.lock().unwrap();
            if slot.is_some() {
                return false;
            }
            self.successful.store(outcome.is_ok(), Ordering::Release);
            self.cancelled.store(
                matches!(outcome, Err(RequestError::Cancelled)),
                Ordering::Release,
            );
            *slot = Some(outcome);
        }
        self.is_done.store(true, Ordering::Release);
        self.done.notify_waiters();
        true
    }

    pub(crate) fn is_done(&self) -> bool {
        self.is_done.load(Ordering::Acquire)
    }

    /// Wait until the slot has been written.
    pub(crate) async fn wait_done(&self) {
        loop {
            let mut notified = pin!(self.done.notified());
            notified.as_mut().enable();
            if self.is_done() {
                return;
            }
            notified.await;
        }
    }
}

/// Completion handle for one submitted request.
///
/// Dropping the handle does not cancel the request; the service keeps
/// processing it. Use [`RequestHandle::request_cancel`] for that.
#[must_use = "the handle is the only way to observe the request's outcome"]
#[derive(Debug)]
pub struct RequestHandle<Rs> {
    shared: std::sync::Arc<HandleShared<Rs>>,
}

impl<Rs> RequestHandle<Rs> {
    pub(crate) fn new(shared: std::sync::Arc<HandleShared<Rs>>) -> Self {
        Self { shared }
    }

    /// Wait up to `wait` for the request to settle.
    ///
    /// Returns the success value, [`GetError::Request`] for a settled
    /// failure, or [`GetError::WaitTimeout`] if the request is still live
    /// when the wait runs out.
    pub async fn get(&self, wait: Duration) -> Result<Rs, GetError>
    where
        Rs: Clone,
    {
        match tokio::time::timeout(wait, self.shared.wait_done()).await {
            Ok(()) => self.read_slot().expect("slot written before wakeup"),
            Err(_) => Err(GetError::WaitTimeout),
        }
    }

    /// Like [`RequestHandle::get`], but a wait-timeout yields `Ok(None)`
    /// instead of an error. Settled failures still surface as errors.
    pub async fn get_or_none(&self, wait: Duration) -> Result<Option<Rs>, RequestError>
    where
        Rs: Clone,
    {
        match tokio::time::timeout(wait, self.shared.wait_done()).await {
            Ok(()) => match self.read_slot().expect("slot written before wakeup") {
                Ok(value) => Ok(Some(value)),
                Err(GetError::Request(e)) => Err(e),
                Err(GetError::WaitTimeout) => unreachable!("slot was written"),
            },
            Err(_) => Ok(None),
        }
    }

    /// Ask for cancellation. Non-blocking and idempotent.
    ///
    /// The request settles as [`RequestError::Cancelled`] at its next
    /// scheduling point; an attempt already in flight is allowed to finish,
    /// and a success still wins.
    pub fn request_cancel(&self) {
        self.shared.cancel_requested.cancel();
    }

    /// The request has settled (successfully or not).
    pub fn is_done(&self) -> bool {
        self.shared.is_done()
    }

    /// The request settled as cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    /// The request settled with a success value.
    pub fn is_successful(&self) -> bool {
        self.shared.successful.load(Ordering::Acquire)
    }

    fn read_slot(&self) -> Option<Result<Rs, GetError>>
    where
        Rs: Clone,
    {
        let slot = self.shared.slot.lock().unwrap();
        slot.as_ref()
            .map(|outcome| outcome.clone().map_err(GetError::Request))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn completes_exactly_once() {
        let shared = Arc::new(HandleShared::new());
        let handle = RequestHandle::new(shared.clone());

        assert!(shared.complete(Ok(5u32)));
        assert!(!shared.complete(Err(RequestError::Cancelled)));

        assert!(handle.is_done());
        assert!(handle.is_successful());
        assert!(!handle.is_cancelled());
        assert_eq!(handle.get(Duration::from_millis(1)).await.unwrap(), 5);
        // A second get sees the same outcome
        assert_eq!(handle.get(Duration::from_millis(1)).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn wait_timeout_is_not_terminal() {
        let shared: Arc<HandleShared<u32>> = Arc::new(HandleShared::new());
        let handle = RequestHandle::new(shared.clone());

        let res = handle.get(Duration::from_millis(5)).await;
        assert!(matches!(res, Err(GetError::WaitTimeout)));
        assert!(!handle.is_done());

        let res = handle.get_or_none(Duration::from_millis(5)).await;
        assert!(matches!(res, Ok(None)));

        shared.complete(Ok(7));
        assert_eq!(handle.get(Duration::from_millis(5)).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn waiters_wake_on_completion() {
        let shared: Arc<HandleShared<u32>> = Arc::new(HandleShared::new());
        let handle = RequestHandle::new(shared.clone());

        let waiter = tokio::spawn(async move { handle.get(Duration::from_secs(5)).await });
        tokio::task::yield_now().await;
        shared.complete(Err(RequestError::Cancelled));

        let res = waiter.await.unwrap();
        assert!(matches!(res, Err(GetError::Request(RequestError::Cancelled))));
    }
}

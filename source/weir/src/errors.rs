//! Error types surfaced to callers
//!
//! Submission errors are reported synchronously by the `submit` family.
//! Completion errors are reported through the [`RequestHandle`] accessors
//! once a request has settled.
//!
//! [`RequestHandle`]: crate::service::handle::RequestHandle

use std::{error::Error, sync::Arc, time::Duration};

/// The error type produced by a user processing function for a single attempt.
///
/// Attempt errors are recorded internally and only surfaced once retries are
/// exhausted, as the `last_error` of [`RequestError::ExecutionFailure`].
pub type AttemptError = Box<dyn Error + Send + Sync>;

/// Errors reported synchronously by `submit` and friends.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("the service has not been started")]
    NotStarted,

    #[error("the service is being shut down")]
    BeingShutDown,

    #[error("the service has been shut down")]
    AlreadyShutDown,

    #[error("too many pending requests (limit: {limit})")]
    TooManyPendingRequests { limit: usize },
}

/// The terminal fate of a request that did not complete successfully.
///
/// Exactly one of these is stored in the completion slot of a request that
/// failed; the handle accessors return clones of it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RequestError {
    /// All permitted attempts were made and the last one failed.
    #[error("request failed after {attempts} attempt(s): {last_error}")]
    ExecutionFailure {
        attempts: u32,
        last_error: Arc<dyn Error + Send + Sync>,
    },

    /// The deadline passed before any attempt succeeded, or the shutdown
    /// policy timed the request out.
    ///
    /// `processing` is the total time the request spent in the service,
    /// measured from submission.
    #[error("request timed out after {processing:?}")]
    Timeout { processing: Duration },

    /// The caller requested cancellation and it took effect.
    #[error("request was cancelled")]
    Cancelled,
}

impl RequestError {
    /// The error recorded for the last attempt, if this outcome carries one.
    pub fn last_error(&self) -> Option<&(dyn Error + Send + Sync)> {
        match self {
            RequestError::ExecutionFailure { last_error, .. } => Some(last_error.as_ref()),
            _ => None,
        }
    }
}

/// Errors returned by [`RequestHandle::get`].
///
/// `WaitTimeout` means the *wait* ran out, not the request: the request is
/// still live and `get` may be called again.
///
/// [`RequestHandle::get`]: crate::service::handle::RequestHandle::get
#[derive(Debug, Clone, thiserror::Error)]
pub enum GetError {
    #[error("the request did not settle within the wait budget")]
    WaitTimeout,

    #[error(transparent)]
    Request(#[from] RequestError),
}

/// Errors from lifecycle transitions (`start`).
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("service is not in the NOT_STARTED state (currently: {actual})")]
    NotInNotStarted { actual: &'static str },
}

/// Errors from binding flat string configuration into typed parameters.
///
/// KDL configuration files report their own span-carrying diagnostics
/// instead; see the `config::kdl` module.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown configuration key: '{key}'")]
    UnknownKey { key: String },

    #[error("invalid value '{value}' for '{key}': {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("invalid configuration: {reason}")]
    Invalid { reason: String },
}

/// The attempt error recorded when a worker is interrupted by shutdown.
#[derive(Debug, thiserror::Error)]
#[error("attempt interrupted by service shutdown")]
pub struct AttemptInterrupted;

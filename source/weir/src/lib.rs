//! # weir
//!
//! An in-process request executor: callers submit opaque requests with a
//! validity window, and weir paces attempt starts through a global ticket
//! bucket, retries failures on a configured delay schedule, honors
//! per-request deadlines and earliest-start constraints, bounds concurrent
//! processing with a worker slot pool, and shuts down gracefully under a
//! policy the caller picks.
//!
//! The caller supplies the actual work as a [`Processor`]; weir never
//! interprets payloads. There is no persistence and no network surface -
//! a weir [`Service`] lives and dies with its process.

pub mod config;
pub mod errors;
pub mod service;

pub use config::{render_config, Config};
pub use errors::{
    AttemptError, AttemptInterrupted, ConfigError, GetError, LifecycleError, RequestError,
    SubmitError,
};
pub use service::control::{ControlState, LifecyclePhase};
pub use service::events::EventListener;
pub use service::handle::RequestHandle;
pub use service::status::Status;
pub use service::{Processor, Service};

//! This is the *actual* internal configuration structure.
//!
//! It is ONLY used for the internal configuration, and should not ever
//! be exposed as the public API for file formats or the flat binder.
//!
//! This is used as the buffer between any external stable UI, and internal
//! impl details which may change at any time.

use std::time::Duration;

use crate::errors::ConfigError;

/// Weir's internal configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Label used for spawned task names and log fields
    pub service_name: String,
    /// Upper bound on attempts per request, including the first
    pub max_attempts: u32,
    /// Ordered delays applied after each failure; the last element repeats
    pub delays_after_failure: Vec<Duration>,
    /// Upper bound on live requests (queued + delayed + in flight)
    pub max_pending_requests: usize,
    /// Entries whose release time is within this window of "now" are
    /// released immediately instead of taking one more timer lap
    pub early_processing_grace: Duration,
    /// The max and initial number of tickets in the bucket - this is the
    /// number of attempts that can start without any waiting if the bucket
    /// is full
    pub bucket_size: usize,
    /// The number of tickets added to the bucket every `refill_interval`
    pub refill_qty: usize,
    /// The interval between "refills" of the bucket
    pub refill_interval: Duration,
    /// Minimum worker count, kept for sizing reports
    pub min_workers: usize,
    /// Maximum concurrently processing attempts
    pub max_workers: usize,
    /// Number of delay queue shards, each with its own drain task
    pub delay_queue_shards: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: String::from("weir"),
            max_attempts: 3,
            delays_after_failure: vec![
                Duration::from_millis(100),
                Duration::from_millis(1000),
                Duration::from_millis(5000),
            ],
            max_pending_requests: 256,
            early_processing_grace: Duration::from_millis(10),
            bucket_size: 10,
            refill_qty: 10,
            refill_interval: Duration::from_secs(1),
            min_workers: 2,
            max_workers: 8,
            delay_queue_shards: 2,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let reject = |reason: &str| {
            Err(ConfigError::Invalid {
                reason: reason.into(),
            })
        };

        if self.max_attempts == 0 {
            return reject("max_attempts must be at least 1");
        }
        if self.delays_after_failure.is_empty() {
            return reject("delays_after_failure must not be empty");
        }
        if self.max_pending_requests == 0 {
            return reject("max_pending_requests must be at least 1");
        }
        if self.bucket_size == 0 {
            return reject("bucket_size must be at least 1");
        }
        if self.refill_qty == 0 {
            return reject("refill_qty must be at least 1");
        }
        if self.refill_interval.is_zero() {
            return reject("refill_interval must be nonzero");
        }
        if self.min_workers == 0 {
            return reject("worker pool minimum must be at least 1");
        }
        if self.min_workers > self.max_workers {
            return reject("worker pool minimum must not exceed the maximum");
        }
        if self.delay_queue_shards == 0 {
            return reject("delay_queue_shards must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_inverted_worker_bounds() {
        let cfg = Config {
            min_workers: 9,
            max_workers: 4,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_empty_delay_schedule() {
        let cfg = Config {
            delays_after_failure: vec![],
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }
}

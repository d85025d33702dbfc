//! Flat string configuration binder
//!
//! Projects `key=value` string pairs into the typed [`Config`]. This is the
//! surface used when configuration arrives from a property map, environment
//! plumbing, or anything else that flattens to strings.
//!
//! Keys are the stable public names:
//!
//! | key | meaning |
//! |---|---|
//! | `serviceName` | label for tasks and logs |
//! | `maxAttempts` | upper bound on attempts per request |
//! | `delaysAfterFailure` | comma-separated durations, last element repeats |
//! | `maxPendingRequests` | upper bound on (queued + delayed + in-flight) |
//! | `requestEarlyProcessingGracePeriod` | early release window |
//! | `rateLimiterBucketSize` | ticket capacity |
//! | `rateLimiterRefillRate` | tickets added per refill interval |
//! | `rateLimiterRefillInterval` | duration between refills |
//! | `requestProcessingThreadPoolConfig` | "min,max" worker counts |
//! | `delayQueueThreadCount` | delay queue shard count |

use std::time::Duration;

use crate::{config::internal::Config, errors::ConfigError};

/// Apply flat `key=value` pairs on top of `conf`.
///
/// Later pairs win over earlier ones. Unknown keys and malformed values are
/// rejected with the offending key named.
pub fn apply_flat<'a, I>(conf: &mut Config, pairs: I) -> Result<(), ConfigError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    for (key, value) in pairs {
        apply_one(conf, key, value)?;
    }
    Ok(())
}

fn apply_one(conf: &mut Config, key: &str, value: &str) -> Result<(), ConfigError> {
    let bad = |reason: String| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason,
    };

    match key {
        "serviceName" => {
            if value.is_empty() {
                return Err(bad("service name must not be empty".into()));
            }
            conf.service_name = value.to_string();
        }
        "maxAttempts" => {
            conf.max_attempts = value.parse::<u32>().map_err(|e| bad(e.to_string()))?;
        }
        "delaysAfterFailure" => {
            let delays = value
                .split(',')
                .map(|part| parse_duration(part.trim()))
                .collect::<Result<Vec<Duration>, String>>()
                .map_err(bad)?;
            conf.delays_after_failure = delays;
        }
        "maxPendingRequests" => {
            conf.max_pending_requests = value.parse::<usize>().map_err(|e| bad(e.to_string()))?;
        }
        "requestEarlyProcessingGracePeriod" => {
            conf.early_processing_grace = parse_duration(value).map_err(bad)?;
        }
        "rateLimiterBucketSize" => {
            conf.bucket_size = value.parse::<usize>().map_err(|e| bad(e.to_string()))?;
        }
        "rateLimiterRefillRate" => {
            conf.refill_qty = value.parse::<usize>().map_err(|e| bad(e.to_string()))?;
        }
        "rateLimiterRefillInterval" => {
            conf.refill_interval = parse_duration(value).map_err(bad)?;
        }
        "requestProcessingThreadPoolConfig" => {
            let (min, max) = value
                .split_once(',')
                .ok_or_else(|| bad("expected \"min,max\"".into()))?;
            conf.min_workers = min.trim().parse::<usize>().map_err(|e| bad(e.to_string()))?;
            conf.max_workers = max.trim().parse::<usize>().map_err(|e| bad(e.to_string()))?;
        }
        "delayQueueThreadCount" => {
            conf.delay_queue_shards = value.parse::<usize>().map_err(|e| bad(e.to_string()))?;
        }
        other => {
            return Err(ConfigError::UnknownKey {
                key: other.to_string(),
            });
        }
    }
    Ok(())
}

/// Parse a human duration: `"250ms"`, `"2s"`, `"1m"`, or bare milliseconds.
pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".into());
    }

    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, "ms"),
    };
    let qty: u64 = digits
        .parse()
        .map_err(|_| format!("'{s}' is not a duration"))?;

    match unit {
        "ms" => Ok(Duration::from_millis(qty)),
        "s" => Ok(Duration::from_secs(qty)),
        "m" => Ok(Duration::from_secs(qty * 60)),
        other => Err(format!("unknown duration unit '{other}'")),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn binds_every_key() {
        let mut conf = Config::default();
        apply_flat(
            &mut conf,
            [
                ("serviceName", "upstream-api"),
                ("maxAttempts", "5"),
                ("delaysAfterFailure", "100ms, 800ms, 2s"),
                ("maxPendingRequests", "100"),
                ("requestEarlyProcessingGracePeriod", "5ms"),
                ("rateLimiterBucketSize", "2"),
                ("rateLimiterRefillRate", "2"),
                ("rateLimiterRefillInterval", "100ms"),
                ("requestProcessingThreadPoolConfig", "1,4"),
                ("delayQueueThreadCount", "3"),
            ],
        )
        .unwrap();

        assert_eq!(
            conf,
            Config {
                service_name: "upstream-api".into(),
                max_attempts: 5,
                delays_after_failure: vec![
                    Duration::from_millis(100),
                    Duration::from_millis(800),
                    Duration::from_secs(2),
                ],
                max_pending_requests: 100,
                early_processing_grace: Duration::from_millis(5),
                bucket_size: 2,
                refill_qty: 2,
                refill_interval: Duration::from_millis(100),
                min_workers: 1,
                max_workers: 4,
                delay_queue_shards: 3,
            }
        );
        conf.validate().unwrap();
    }

    #[test]
    fn rejects_unknown_key() {
        let mut conf = Config::default();
        let res = apply_flat(&mut conf, [("maxRetries", "3")]);
        assert!(matches!(res, Err(ConfigError::UnknownKey { key }) if key == "maxRetries"));
    }

    #[test]
    fn rejects_malformed_pool_config() {
        let mut conf = Config::default();
        let res = apply_flat(&mut conf, [("requestProcessingThreadPoolConfig", "4")]);
        assert!(matches!(res, Err(ConfigError::InvalidValue { key, .. }) if key == "requestProcessingThreadPoolConfig"));
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("750").unwrap(), Duration::from_millis(750));
        assert!(parse_duration("2h").is_err());
        assert!(parse_duration("fast").is_err());
    }
}

pub mod flat;
pub mod internal;
pub mod kdl;
pub mod toml;

use std::path::Path;
use std::time::Duration;

use crate::config::toml::Toml;
use crate::errors::ConfigError;

pub use internal::Config;

/// Render a full configuration from layered sources.
///
/// Layering, lowest priority first:
///
///   1. Built-in defaults
///   2. A configuration file (KDL or TOML - pick one)
///   3. Flat `key=value` overrides (see [`flat`])
///
/// File loading failures panic: a service with a broken config file should
/// not come up. Override and validation failures are reported as errors so
/// embedding callers can surface them.
pub fn render_config<'a, I>(
    config_kdl: Option<&Path>,
    config_toml: Option<&Path>,
    overrides: I,
) -> Result<internal::Config, ConfigError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    // To begin with, start with the blank internal config. We will layer on
    // top of that.
    let mut config = internal::Config::default();

    let toml_opts = config_toml.map(Toml::from_path);

    let kdl_opts = config_kdl.map(|kdl_path| {
        let kdl_contents = std::fs::read_to_string(kdl_path).unwrap_or_else(|e| {
            panic!("Error loading KDL file: {e:?}");
        });
        let doc: ::kdl::KdlDocument = kdl_contents.parse().unwrap_or_else(|e| {
            panic!("Error parsing KDL file: {e:?}");
        });
        let val: internal::Config = doc.try_into().unwrap_or_else(|e| {
            panic!("Error rendering config from KDL file: {e:?}");
        });
        val
    });

    match (toml_opts, kdl_opts) {
        (Some(tf), None) => {
            tracing::info!("Applying TOML options");
            apply_toml(&mut config, &tf)?;
        }
        (None, Some(kf)) => {
            tracing::info!("Applying KDL options");
            config = kf;
        }
        (None, None) => {
            tracing::info!("No configuration file provided");
        }
        (Some(_), Some(_)) => {
            tracing::error!("Refusing to merge KDL and TOML options: Please choose one.");
            panic!("Too many configuration options selected!");
        }
    }

    tracing::info!("Applying flat overrides");
    flat::apply_flat(&mut config, overrides)?;

    config.validate()?;
    tracing::info!(?config, "Full configuration",);
    Ok(config)
}

pub(crate) fn apply_toml(conf: &mut internal::Config, toml: &Toml) -> Result<(), ConfigError> {
    let Toml {
        service_name,
        max_attempts,
        delays_after_failure,
        max_pending_requests,
        early_processing_grace,
        bucket_size,
        refill_qty,
        refill_interval,
        min_workers,
        max_workers,
        delay_queue_shards,
    } = toml;

    let duration = |key: &str, val: &str| -> Result<Duration, ConfigError> {
        flat::parse_duration(val).map_err(|reason| ConfigError::InvalidValue {
            key: key.to_string(),
            value: val.to_string(),
            reason,
        })
    };

    if let Some(name) = service_name {
        conf.service_name = name.clone();
    }
    if let Some(attempts) = max_attempts {
        conf.max_attempts = *attempts;
    }
    if let Some(delays) = delays_after_failure {
        conf.delays_after_failure = delays
            .iter()
            .map(|d| duration("delays-after-failure", d))
            .collect::<Result<Vec<Duration>, ConfigError>>()?;
    }
    if let Some(pending) = max_pending_requests {
        conf.max_pending_requests = *pending;
    }
    if let Some(grace) = early_processing_grace {
        conf.early_processing_grace = duration("early-processing-grace", grace)?;
    }
    if let Some(size) = bucket_size {
        conf.bucket_size = *size;
    }
    if let Some(qty) = refill_qty {
        conf.refill_qty = *qty;
    }
    if let Some(interval) = refill_interval {
        conf.refill_interval = duration("refill-interval", interval)?;
    }
    if let Some(min) = min_workers {
        conf.min_workers = *min;
    }
    if let Some(max) = max_workers {
        conf.max_workers = *max;
    }
    if let Some(shards) = delay_queue_shards {
        conf.delay_queue_shards = *shards;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn overrides_win_over_file() {
        let config = render_config(
            Some(std::path::Path::new("./assets/test-config.kdl")),
            None,
            [("maxAttempts", "9"), ("rateLimiterBucketSize", "1")],
        )
        .unwrap();

        // File values survive where no override applies
        assert_eq!(config.service_name, "weir-demo");
        assert_eq!(config.max_pending_requests, 512);
        // Overrides replace file values
        assert_eq!(config.max_attempts, 9);
        assert_eq!(config.bucket_size, 1);
    }

    #[test]
    fn defaults_when_nothing_provided() {
        let config = render_config(None, None, []).unwrap();
        assert_eq!(config, internal::Config::default());
    }
}

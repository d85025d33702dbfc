//! Configuration sourced from a TOML file

use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Toml {
    pub service_name: Option<String>,
    pub max_attempts: Option<u32>,
    pub delays_after_failure: Option<Vec<String>>,
    pub max_pending_requests: Option<usize>,
    pub early_processing_grace: Option<String>,
    pub bucket_size: Option<usize>,
    pub refill_qty: Option<usize>,
    pub refill_interval: Option<String>,
    pub min_workers: Option<usize>,
    pub max_workers: Option<usize>,
    pub delay_queue_shards: Option<usize>,
}

impl Toml {
    pub fn from_path<P>(path: &P) -> Self
    where
        P: AsRef<Path> + core::fmt::Debug + ?Sized,
    {
        tracing::info!("Loading TOML from {path:?}");
        let f = std::fs::read_to_string(path)
            .unwrap_or_else(|_| panic!("Failed to load file at {path:?}"));
        let t = ::toml::from_str(&f).expect("failed to deserialize");
        tracing::info!("TOML file contents: {t:?}");
        t
    }
}

#[cfg(test)]
pub mod test {
    use std::time::Duration;

    use crate::config::{apply_toml, internal::Config};

    use super::Toml;

    #[test]
    fn load_example() {
        let snapshot = Toml {
            service_name: Some("weir-demo".into()),
            max_attempts: Some(5),
            delays_after_failure: Some(vec!["100ms".into(), "800ms".into(), "2s".into()]),
            max_pending_requests: Some(512),
            early_processing_grace: Some("10ms".into()),
            bucket_size: Some(4),
            refill_qty: Some(2),
            refill_interval: Some("100ms".into()),
            min_workers: Some(2),
            max_workers: Some(8),
            delay_queue_shards: Some(2),
        };
        let loaded = Toml::from_path("./assets/example-config.toml");
        assert_eq!(snapshot, loaded);

        let mut cfg = Config::default();
        apply_toml(&mut cfg, &loaded).unwrap();

        assert_eq!(cfg.service_name, "weir-demo");
        assert_eq!(cfg.max_attempts, 5);
        assert_eq!(
            cfg.delays_after_failure,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(800),
                Duration::from_secs(2),
            ]
        );
        assert_eq!(cfg.max_pending_requests, 512);
        assert_eq!(cfg.bucket_size, 4);
        cfg.validate().unwrap();
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let toml: Toml = ::toml::from_str("max-attempts = 7\n").unwrap();
        let mut cfg = Config::default();
        apply_toml(&mut cfg, &toml).unwrap();
        assert_eq!(cfg.max_attempts, 7);
        assert_eq!(cfg.bucket_size, Config::default().bucket_size);
    }

    #[test]
    fn unknown_field_is_rejected() {
        let res: Result<Toml, _> = ::toml::from_str("max-retries = 7\n");
        assert!(res.is_err());
    }
}

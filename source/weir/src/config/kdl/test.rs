use std::time::Duration;

use crate::config::internal::Config;

#[test]
fn load_test() {
    let kdl_contents = std::fs::read_to_string("./assets/test-config.kdl").unwrap();

    let doc: ::kdl::KdlDocument = kdl_contents.parse().unwrap_or_else(|e| {
        panic!("Error parsing KDL file: {e:?}");
    });
    let val: Config = doc.try_into().unwrap_or_else(|e| {
        panic!("Error rendering config from KDL file: {e:?}");
    });

    let expected = Config {
        service_name: "weir-demo".into(),
        max_attempts: 5,
        delays_after_failure: vec![
            Duration::from_millis(100),
            Duration::from_millis(800),
            Duration::from_secs(2),
        ],
        max_pending_requests: 512,
        early_processing_grace: Duration::from_millis(10),
        bucket_size: 4,
        refill_qty: 2,
        refill_interval: Duration::from_millis(100),
        min_workers: 2,
        max_workers: 8,
        delay_queue_shards: 2,
    };

    assert_eq!(val, expected);
    val.validate().unwrap();
}

/// Empty: every setting keeps its default
const EMPTY_TEST: &str = "
";

#[test]
fn empty() {
    let doc: ::kdl::KdlDocument = EMPTY_TEST.parse().unwrap_or_else(|e| {
        panic!("Error parsing KDL file: {e:?}");
    });
    let val: Config = doc.try_into().unwrap();
    assert_eq!(val, Config::default());
}

/// A partial document only overrides what it names
const PARTIAL_TEST: &str = r#"
rate-limit {
    bucket-size 2
    refill-qty 2
    refill-interval "100ms"
}
"#;

#[test]
fn partial() {
    let doc: ::kdl::KdlDocument = PARTIAL_TEST.parse().unwrap();
    let val: Config = doc.try_into().unwrap();
    assert_eq!(val.bucket_size, 2);
    assert_eq!(val.refill_interval, Duration::from_millis(100));
    assert_eq!(val.max_attempts, Config::default().max_attempts);
}

/// Duplicate sections: not allowed
const DUPLICATE_TEST: &str = r#"
service {
    max-attempts 2
}
service {
    max-attempts 3
}
"#;

#[test]
fn duplicate_section() {
    let doc: ::kdl::KdlDocument = DUPLICATE_TEST.parse().unwrap();
    let val: Result<Config, _> = doc.try_into();
    assert!(val.is_err());
}

/// Unknown sections: not allowed
const UNKNOWN_SECTION_TEST: &str = r#"
listeners {
    "0.0.0.0:8080"
}
"#;

#[test]
fn unknown_section() {
    let doc: ::kdl::KdlDocument = UNKNOWN_SECTION_TEST.parse().unwrap();
    let val: Result<Config, _> = doc.try_into();
    assert!(val.is_err());
}

/// Durations must carry a known unit
const BAD_DURATION_TEST: &str = r#"
service {
    delays-after-failure "100parsecs"
}
"#;

#[test]
fn bad_duration() {
    let doc: ::kdl::KdlDocument = BAD_DURATION_TEST.parse().unwrap();
    let val: Result<Config, _> = doc.try_into();
    assert!(val.is_err());
}

/// `workers` needs both bounds
const HALF_WORKERS_TEST: &str = r#"
threads {
    workers min=2
}
"#;

#[test]
fn half_workers() {
    let doc: ::kdl::KdlDocument = HALF_WORKERS_TEST.parse().unwrap();
    let val: Result<Config, _> = doc.try_into();
    assert!(val.is_err());
}

use std::time::Duration;

use workvault::config::{Backpressure, Config};
use workvault::error::Error;

// Environment variables are process-global, so everything touching them
// lives in one test.
#[test]
fn config_from_env_requires_data_dir_and_parses_overrides() {
    unsafe {
        std::env::remove_var("WORKVAULT_DATA_DIR");
    }
    assert!(matches!(Config::from_env(), Err(Error::Config(_))));

    unsafe {
        std::env::set_var("WORKVAULT_DATA_DIR", "/tmp/workvault-test");
        std::env::set_var("WORKVAULT_WORKERS", "7");
        std::env::set_var("WORKVAULT_HIGH_WATER", "100");
        std::env::set_var("WORKVAULT_LEASE_SECS", "5");
        std::env::set_var("WORKVAULT_JOB_TIMEOUT_SECS", "2");
    }
    let config = Config::from_env().unwrap();
    assert_eq!(config.data_dir.to_str(), Some("/tmp/workvault-test"));
    assert_eq!(config.workers.workers, 7);
    assert_eq!(config.queue.high_water_mark, Some(100));
    assert_eq!(config.workers.lease_duration, Duration::from_secs(5));
    assert_eq!(config.workers.job_timeout, Duration::from_secs(2));
    assert_eq!(config.queue_dir(), config.data_dir.join("queue"));
    assert!(!config.log_level.is_empty());

    unsafe {
        std::env::set_var("WORKVAULT_WORKERS", "lots");
    }
    let err = Config::from_env().unwrap_err();
    assert!(err.to_string().contains("WORKVAULT_WORKERS"), "{err}");

    unsafe {
        std::env::remove_var("WORKVAULT_DATA_DIR");
        std::env::remove_var("WORKVAULT_WORKERS");
        std::env::remove_var("WORKVAULT_HIGH_WATER");
        std::env::remove_var("WORKVAULT_LEASE_SECS");
        std::env::remove_var("WORKVAULT_JOB_TIMEOUT_SECS");
    }
}

#[test]
fn config_from_toml_fills_missing_sections_with_defaults() {
    let config = Config::from_toml_str(
        r#"
        data_dir = "/var/lib/workvault"

        [queue]
        high_water_mark = 500
        backpressure = "block"
        retry_base_delay_ms = 100
        kinds = ["render", "score"]
        "#,
    )
    .unwrap();

    assert_eq!(config.queue.high_water_mark, Some(500));
    assert_eq!(config.queue.backpressure, Backpressure::Block);
    assert_eq!(config.queue.retry_base_delay, Duration::from_millis(100));
    assert_eq!(config.queue.kinds, ["render", "score"]);
    assert_eq!(config.queue.default_max_attempts, 3);
    assert_eq!(config.records.shard_count, 16);
    assert_eq!(config.workers.workers, 4);
}

#[test]
fn config_rejects_invalid_values() {
    for bad in [
        "[records]\nshard_count = 0",
        "[workers]\nworkers = 0",
        "[queue]\ncompact_ratio = 1.5",
        "[queue]\nbackpressure = \"sometimes\"",
        "[workers]\nlease_duration_ms = 1000\njob_timeout_ms = 5000",
        "[workers]\nlease_duration_ms = 1000000000000000000",
        "[records]\nio_retry_base_delay_ms = 1000000000000000000",
    ] {
        assert!(
            matches!(Config::from_toml_str(bad), Err(Error::Config(_))),
            "accepted: {bad}"
        );
    }
}

#[test]
fn config_from_missing_file_is_a_config_error() {
    let result = Config::from_toml_file(std::path::Path::new("/nonexistent/workvault.toml"));
    assert!(matches!(result, Err(Error::Config(_))));
}

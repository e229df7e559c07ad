//! promptwatch.toml integration tests
//!
//! - promptwatch.toml.example parsing
//! - partial configs
//! - environment override precedence
//! - empty and malformed input

use promptwatch_core::config::PromptwatchConfig;
use promptwatch_core::error::{ConfigError, PromptwatchError};

const EXAMPLE: &str = include_str!("../../../promptwatch.toml.example");

// =============================================================================
// promptwatch.toml.example
// =============================================================================

#[test]
fn example_config_parses_successfully() {
    let config = PromptwatchConfig::parse(EXAMPLE).expect("example config should parse");
    assert_eq!(config.general.log_level, "info");
    assert_eq!(config.general.log_format, "json");
    assert_eq!(config.general.pid_file, "");
}

#[test]
fn example_config_passes_validation() {
    let config = PromptwatchConfig::parse(EXAMPLE).expect("should parse");
    config
        .validate()
        .expect("example config should pass validation");
}

#[test]
fn example_config_matches_code_defaults() {
    let example = PromptwatchConfig::parse(EXAMPLE).expect("should parse");
    let defaults = PromptwatchConfig::default();

    assert_eq!(example.stream.backend, defaults.stream.backend);
    assert_eq!(example.stream.jsonl_path, defaults.stream.jsonl_path);
    assert_eq!(example.stream.brokers, defaults.stream.brokers);
    assert_eq!(example.stream.topic, defaults.stream.topic);
    assert_eq!(example.stream.group_id, defaults.stream.group_id);
    assert_eq!(
        example.stream.micro_batch_size,
        defaults.stream.micro_batch_size
    );
    assert_eq!(example.storage.database_url, defaults.storage.database_url);
    assert_eq!(example.storage.batch_size, defaults.storage.batch_size);
    assert_eq!(
        example.storage.flush_interval_ms,
        defaults.storage.flush_interval_ms
    );
    assert_eq!(example.storage.max_retries, defaults.storage.max_retries);
    assert_eq!(
        example.detection.refresh_interval_secs,
        defaults.detection.refresh_interval_secs
    );
    assert_eq!(
        example.alerting.min_risk_score,
        defaults.alerting.min_risk_score
    );
    assert_eq!(example.alerting.rate_limit, defaults.alerting.rate_limit);
    assert_eq!(
        example.alerting.dashboard_base_url,
        defaults.alerting.dashboard_base_url
    );
    assert_eq!(example.metrics.port, defaults.metrics.port);
}

// =============================================================================
// partial configs
// =============================================================================

#[test]
fn partial_config_alerting_only() {
    let toml = r#"
[alerting]
webhook_url = "https://hooks.slack.com/services/T/B/X"
min_risk_score = 80
"#;
    let config = PromptwatchConfig::parse(toml).expect("should parse");
    config.validate().expect("should validate");

    assert!(config.alerting.is_enabled());
    assert_eq!(config.alerting.min_risk_score, 80);
    assert_eq!(config.alerting.rate_window_secs, 60);
    assert_eq!(config.stream.topic, "llm-traffic-logs");
}

#[test]
fn partial_config_local_replay() {
    let toml = r#"
[stream]
backend = "jsonl"
jsonl_path = "/tmp/traffic.jsonl"

[storage]
backend = "memory"

[detection]
rule_source = "directory"
rule_dir = "/tmp/rules"
"#;
    let config = PromptwatchConfig::parse(toml).expect("should parse");
    config.validate().expect("should validate");
    assert_eq!(config.stream.jsonl_path, "/tmp/traffic.jsonl");
    assert_eq!(config.storage.batch_size, 500);
}

// =============================================================================
// environment overrides
// =============================================================================

fn with_env<T>(key: &str, value: &str, f: impl FnOnce() -> T) -> T {
    let original = std::env::var(key).ok();
    // SAFETY: callers are #[serial], no concurrent env access.
    unsafe {
        std::env::set_var(key, value);
    }
    let result = f();
    // SAFETY: test cleanup
    unsafe {
        match original {
            Some(val) => std::env::set_var(key, val),
            None => std::env::remove_var(key),
        }
    }
    result
}

#[test]
#[serial_test::serial]
fn env_override_takes_precedence_over_toml() {
    let toml = r#"
[general]
log_level = "info"
"#;
    let level = with_env("PROMPTWATCH_GENERAL_LOG_LEVEL", "error", || {
        let mut config = PromptwatchConfig::parse(toml).expect("should parse");
        config.apply_env_overrides();
        config.general.log_level
    });
    assert_eq!(level, "error");
}

#[test]
#[serial_test::serial]
fn env_override_csv_brokers() {
    let brokers = with_env("PROMPTWATCH_STREAM_BROKERS", "k1:9092, k2:9092", || {
        let mut config = PromptwatchConfig::default();
        config.apply_env_overrides();
        config.stream.brokers
    });
    assert_eq!(brokers, vec!["k1:9092", "k2:9092"]);
}

#[test]
#[serial_test::serial]
fn env_override_sets_encryption_key() {
    let key = with_env("PROMPTWATCH_STORAGE_ENCRYPTION_KEY", "a2V5", || {
        let mut config = PromptwatchConfig::default();
        assert!(config.storage.encryption_key.is_empty());
        config.apply_env_overrides();
        config.storage.encryption_key
    });
    assert_eq!(key, "a2V5");
}

#[test]
#[serial_test::serial]
fn env_override_numeric_field() {
    let threshold = with_env("PROMPTWATCH_ALERTING_MIN_RISK_SCORE", "75", || {
        let mut config = PromptwatchConfig::default();
        config.apply_env_overrides();
        config.alerting.min_risk_score
    });
    assert_eq!(threshold, 75);
}

#[test]
#[serial_test::serial]
fn env_override_invalid_number_is_ignored() {
    let batch = with_env("PROMPTWATCH_STORAGE_BATCH_SIZE", "lots", || {
        let mut config = PromptwatchConfig::default();
        config.apply_env_overrides();
        config.storage.batch_size
    });
    assert_eq!(batch, 500);
}

#[test]
#[serial_test::serial]
fn env_override_bool_field() {
    let enabled = with_env("PROMPTWATCH_METRICS_ENABLED", "false", || {
        let mut config = PromptwatchConfig::default();
        config.apply_env_overrides();
        config.metrics.enabled
    });
    assert!(!enabled);
}

/// Loads a file with `min_risk_score = 40` while the env override is `value`.
async fn load_with_risk_override(value: &str) -> Result<PromptwatchConfig, PromptwatchError> {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("promptwatch.toml");
    tokio::fs::write(&path, "[alerting]\nmin_risk_score = 40\n")
        .await
        .expect("write");

    let original = std::env::var("PROMPTWATCH_ALERTING_MIN_RISK_SCORE").ok();
    // SAFETY: #[serial], no concurrent env access.
    unsafe {
        std::env::set_var("PROMPTWATCH_ALERTING_MIN_RISK_SCORE", value);
    }
    let result = PromptwatchConfig::load(&path).await;
    // SAFETY: test cleanup
    unsafe {
        match original {
            Some(val) => std::env::set_var("PROMPTWATCH_ALERTING_MIN_RISK_SCORE", val),
            None => std::env::remove_var("PROMPTWATCH_ALERTING_MIN_RISK_SCORE"),
        }
    }
    result
}

#[tokio::test]
#[serial_test::serial]
async fn load_ignores_override_that_does_not_parse() {
    // 300 does not fit in u8, so the file value wins.
    let config = load_with_risk_override("300")
        .await
        .expect("load should succeed");
    assert_eq!(config.alerting.min_risk_score, 40);
}

#[tokio::test]
#[serial_test::serial]
async fn load_validates_after_env_override() {
    // 250 parses as u8 but is outside 0-100.
    let err = load_with_risk_override("250")
        .await
        .expect_err("out-of-range override should fail validation");
    assert!(
        matches!(
            &err,
            PromptwatchError::Config(ConfigError::InvalidValue { field, .. })
                if field == "alerting.min_risk_score"
        ),
        "unexpected error: {err:?}"
    );
}

// =============================================================================
// empty / malformed input
// =============================================================================

#[test]
fn empty_string_parses_with_defaults() {
    let config = PromptwatchConfig::parse("").expect("empty string should parse");
    config.validate().expect("should validate");
    assert_eq!(config.general.log_level, "info");
}

#[test]
fn comments_only_parses_with_defaults() {
    let config = PromptwatchConfig::parse("# nothing here\n# at all\n").expect("should parse");
    assert_eq!(config.stream.group_id, "shadow-ai-detection");
}

#[test]
fn malformed_toml_returns_parse_error() {
    let err = PromptwatchConfig::parse("[invalid toml").unwrap_err();
    assert!(matches!(
        err,
        PromptwatchError::Config(ConfigError::ParseFailed { .. })
    ));
}

#[test]
fn invalid_type_returns_parse_error() {
    let toml = r#"
[storage]
batch_size = "five hundred"
"#;
    let err = PromptwatchConfig::parse(toml).unwrap_err();
    assert!(matches!(
        err,
        PromptwatchError::Config(ConfigError::ParseFailed { .. })
    ));
}

#[test]
fn invalid_value_reports_field() {
    let toml = r#"
[general]
log_format = "xml"
"#;
    let config = PromptwatchConfig::parse(toml).expect("should parse");
    match config.validate().unwrap_err() {
        PromptwatchError::Config(ConfigError::InvalidValue { field, .. }) => {
            assert_eq!(field, "general.log_format");
        }
        other => panic!("unexpected error: {other}"),
    }
}

//! Metric names and descriptions.
//!
//! Every Prometheus metric is named here; components call
//! `metrics::counter!()`, `metrics::gauge!()` and `metrics::histogram!()`
//! with these constants.
//!
//! # Naming
//!
//! - prefix: `promptwatch_`
//! - area: `stream_`, `detection_`, `rules_`, `alerts_`, `storage_`, `daemon_`
//! - suffix: `_total` (counter), `_seconds` (histogram), none (gauge)
//!
//! ```ignore
//! use metrics::counter;
//!
//! counter!(promptwatch_core::metrics::STREAM_RECORDS_CONSUMED_TOTAL).increment(1);
//! ```

// --- label keys ---

/// Alert outcome label key (sent, rate_limited, failed)
pub const LABEL_OUTCOME: &str = "outcome";

/// Rule name label key
pub const LABEL_RULE: &str = "rule";

/// Result label key (success, failure)
pub const LABEL_RESULT: &str = "result";

// --- stream ---

/// Records pulled from the stream (counter)
pub const STREAM_RECORDS_CONSUMED_TOTAL: &str = "promptwatch_stream_records_consumed_total";

/// Records that failed to parse and were skipped (counter)
pub const STREAM_RECORDS_MALFORMED_TOTAL: &str = "promptwatch_stream_records_malformed_total";

/// Offset commits (counter, label: result)
pub const STREAM_COMMITS_TOTAL: &str = "promptwatch_stream_commits_total";

// --- detection ---

/// Records scored by the engine (counter)
pub const DETECTION_RECORDS_SCORED_TOTAL: &str = "promptwatch_detection_records_scored_total";

/// Records flagged as risky (counter)
pub const DETECTION_RECORDS_FLAGGED_TOTAL: &str = "promptwatch_detection_records_flagged_total";

/// Rule matches (counter, label: rule)
pub const DETECTION_RULE_MATCHES_TOTAL: &str = "promptwatch_detection_rule_matches_total";

/// Time to score one micro-batch (histogram, seconds)
pub const DETECTION_BATCH_DURATION_SECONDS: &str = "promptwatch_detection_batch_duration_seconds";

// --- rule cache ---

/// Rule cache refresh attempts (counter, label: result)
pub const RULES_REFRESH_TOTAL: &str = "promptwatch_rules_refresh_total";

/// Rules in the active snapshot (gauge)
pub const RULES_LOADED: &str = "promptwatch_rules_loaded";

/// Version of the active snapshot (gauge)
pub const RULES_SNAPSHOT_VERSION: &str = "promptwatch_rules_snapshot_version";

// --- alerts ---

/// Alert decisions for qualifying records (counter, label: outcome)
pub const ALERTS_TOTAL: &str = "promptwatch_alerts_total";

/// Webhook delivery latency (histogram, seconds)
pub const ALERTS_SEND_DURATION_SECONDS: &str = "promptwatch_alerts_send_duration_seconds";

// --- storage ---

/// Records handed to the durable store (counter)
pub const STORAGE_RECORDS_PERSISTED_TOTAL: &str = "promptwatch_storage_records_persisted_total";

/// Bulk insert latency including retries (histogram, seconds)
pub const STORAGE_FLUSH_DURATION_SECONDS: &str = "promptwatch_storage_flush_duration_seconds";

/// Bulk insert retries (counter)
pub const STORAGE_FLUSH_RETRIES_TOTAL: &str = "promptwatch_storage_flush_retries_total";

/// Flushes that exhausted their retries (counter)
pub const STORAGE_FLUSH_FAILURES_TOTAL: &str = "promptwatch_storage_flush_failures_total";

/// Records waiting in the persistence buffer (gauge)
pub const STORAGE_BUFFER_SIZE: &str = "promptwatch_storage_buffer_size";

// --- daemon ---

/// Daemon uptime (gauge, seconds)
pub const DAEMON_UPTIME_SECONDS: &str = "promptwatch_daemon_uptime_seconds";

/// Build information (gauge, always 1, labels: version, rust_version)
pub const DAEMON_BUILD_INFO: &str = "promptwatch_daemon_build_info";

// --- histogram buckets ---

/// Scoring and send latency buckets, 100us to 10s.
pub const PROCESSING_DURATION_BUCKETS: [f64; 10] = [
    0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 10.0,
];

/// Bulk insert buckets, 1ms to 60s (includes backoff).
pub const FLUSH_DURATION_BUCKETS: [f64; 9] = [0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 10.0, 60.0];

/// Registers HELP text for every metric.
///
/// Call once after the global recorder is installed.
pub fn describe_all() {
    use metrics::{describe_counter, describe_gauge, describe_histogram};

    // Stream
    describe_counter!(
        STREAM_RECORDS_CONSUMED_TOTAL,
        "Total number of records pulled from the traffic stream"
    );
    describe_counter!(
        STREAM_RECORDS_MALFORMED_TOTAL,
        "Total number of records skipped because they could not be parsed"
    );
    describe_counter!(
        STREAM_COMMITS_TOTAL,
        "Offset commits by result (success, failure)"
    );

    // Detection
    describe_counter!(
        DETECTION_RECORDS_SCORED_TOTAL,
        "Total number of records scored by the detection engine"
    );
    describe_counter!(
        DETECTION_RECORDS_FLAGGED_TOTAL,
        "Total number of records flagged as risky"
    );
    describe_counter!(DETECTION_RULE_MATCHES_TOTAL, "Rule matches per rule name");
    describe_histogram!(
        DETECTION_BATCH_DURATION_SECONDS,
        "Time to score one micro-batch in seconds"
    );

    // Rule cache
    describe_counter!(
        RULES_REFRESH_TOTAL,
        "Rule cache refresh attempts by result (success, failure)"
    );
    describe_gauge!(RULES_LOADED, "Number of rules in the active snapshot");
    describe_gauge!(RULES_SNAPSHOT_VERSION, "Version of the active rule snapshot");

    // Alerts
    describe_counter!(
        ALERTS_TOTAL,
        "Alert decisions by outcome (sent, rate_limited, failed)"
    );
    describe_histogram!(
        ALERTS_SEND_DURATION_SECONDS,
        "Webhook delivery latency in seconds"
    );

    // Storage
    describe_counter!(
        STORAGE_RECORDS_PERSISTED_TOTAL,
        "Total number of records written to the durable store"
    );
    describe_histogram!(
        STORAGE_FLUSH_DURATION_SECONDS,
        "Time to persist one batch including retries in seconds"
    );
    describe_counter!(
        STORAGE_FLUSH_RETRIES_TOTAL,
        "Total number of bulk insert retries"
    );
    describe_counter!(
        STORAGE_FLUSH_FAILURES_TOTAL,
        "Total number of batches that exhausted their retries"
    );
    describe_gauge!(
        STORAGE_BUFFER_SIZE,
        "Records currently waiting in the persistence buffer"
    );

    // Daemon
    describe_gauge!(DAEMON_UPTIME_SECONDS, "Promptwatch daemon uptime in seconds");
    describe_gauge!(
        DAEMON_BUILD_INFO,
        "Build information (always 1, with version labels)"
    );
}

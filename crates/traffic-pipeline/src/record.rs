//! Traffic record parsing
//!
//! Turns a raw stream payload into a [`TrafficRecord`]. Anything that does
//! not parse is reported as [`TrafficError::MalformedRecord`]; the consumer
//! skips it and never retries it.
//!
//! ```ignore
//! use promptwatch_pipeline::record::parse_record;
//!
//! let raw = br#"{"timestamp":"2024-01-15T12:00:00Z","request_id":"r-1",
//!     "src_ip":"10.0.0.5","provider":"OpenAI","model":"GPT-4","prompt":"hi"}"#;
//! let record = parse_record(raw)?;
//! assert_eq!(record.provider, "openai");
//! ```

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;

use promptwatch_core::types::TrafficRecord;

use crate::error::TrafficError;

/// Payloads larger than this are rejected without being decoded.
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

const DEFAULT_METHOD: &str = "POST";

/// Naive timestamp layouts accepted in addition to RFC 3339, read as UTC.
const NAIVE_TIMESTAMP_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

#[derive(Deserialize)]
struct WireRecord {
    timestamp: String,
    request_id: String,
    src_ip: String,
    provider: String,
    model: String,
    prompt: String,
    #[serde(default)]
    metadata: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    headers: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    endpoint: Option<String>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    duration_ms: Option<i64>,
    #[serde(default)]
    status_code: Option<i32>,
}

/// Decodes and normalizes one stream payload.
///
/// Provider and model are trimmed and lower-cased; a missing method becomes
/// `POST`.
pub fn parse_record(payload: &[u8]) -> Result<TrafficRecord, TrafficError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(malformed(format!(
            "payload too large: {} bytes (max: {MAX_PAYLOAD_SIZE})",
            payload.len()
        )));
    }

    let wire: WireRecord =
        serde_json::from_slice(payload).map_err(|e| malformed(format!("invalid JSON: {e}")))?;

    let request_id = wire.request_id.trim();
    if request_id.is_empty() {
        return Err(malformed("request_id must not be empty"));
    }

    let timestamp = parse_timestamp(&wire.timestamp)?;

    let method = wire
        .method
        .map(|m| m.trim().to_uppercase())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| DEFAULT_METHOD.to_owned());

    Ok(TrafficRecord {
        request_id: request_id.to_owned(),
        timestamp,
        src_ip: wire.src_ip.trim().to_owned(),
        provider: wire.provider.trim().to_lowercase(),
        model: wire.model.trim().to_lowercase(),
        prompt: wire.prompt,
        response: wire.response,
        metadata: wire.metadata.unwrap_or_default(),
        headers: wire.headers.unwrap_or_default(),
        endpoint: wire.endpoint,
        method,
        duration_ms: wire.duration_ms,
        status_code: wire.status_code,
    })
}

/// Parses RFC 3339 first, then the naive layouts as UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, TrafficError> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    for format in NAIVE_TIMESTAMP_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(naive.and_utc());
        }
    }
    Err(malformed(format!("unparseable timestamp '{raw}'")))
}

/// First `max_chars` characters of `prompt`, with `...` appended when cut.
pub fn prompt_preview(prompt: &str, max_chars: usize) -> String {
    match prompt.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &prompt[..cut]),
        None => prompt.to_owned(),
    }
}

/// Lossy, bounded view of a payload for dead-letter log lines.
pub fn payload_preview(payload: &[u8], max_chars: usize) -> String {
    prompt_preview(&String::from_utf8_lossy(payload), max_chars)
}

fn malformed(reason: impl Into<String>) -> TrafficError {
    TrafficError::MalformedRecord {
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    fn full_payload() -> Vec<u8> {
        serde_json::json!({
            "timestamp": "2024-01-15T12:30:45.123Z",
            "request_id": "req-001",
            "src_ip": " 192.168.1.10 ",
            "provider": " OpenAI ",
            "model": "GPT-4",
            "prompt": "Summarize this document",
            "metadata": {"tokens": 812, "team": "search"},
            "headers": {"Authorization": "Bearer sk-live", "User-Agent": "curl/8.4"},
            "response": "Here is a summary",
            "endpoint": "/v1/chat/completions",
            "method": "post",
            "duration_ms": 1234,
            "status_code": 200
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn parses_full_record() {
        let record = parse_record(&full_payload()).unwrap();
        assert_eq!(record.request_id, "req-001");
        assert_eq!(record.src_ip, "192.168.1.10");
        assert_eq!(record.provider, "openai");
        assert_eq!(record.model, "gpt-4");
        assert_eq!(record.method, "POST");
        assert_eq!(record.duration_ms, Some(1234));
        assert_eq!(record.status_code, Some(200));
        assert_eq!(record.metadata_number("tokens"), Some(812.0));
        assert_eq!(record.headers["User-Agent"], "curl/8.4");
        assert_eq!(record.timestamp.hour(), 12);
    }

    #[test]
    fn optional_fields_default() {
        let raw = br#"{"timestamp":"2024-01-15T12:00:00Z","request_id":"r","src_ip":"h","provider":"p","model":"m","prompt":""}"#;
        let record = parse_record(raw).unwrap();
        assert_eq!(record.method, "POST");
        assert!(record.metadata.is_empty());
        assert!(record.headers.is_empty());
        assert!(record.response.is_none());
        assert!(record.prompt.is_empty());
    }

    #[test]
    fn null_metadata_is_empty() {
        let raw = br#"{"timestamp":"2024-01-15T12:00:00Z","request_id":"r","src_ip":"h","provider":"p","model":"m","prompt":"x","metadata":null}"#;
        assert!(parse_record(raw).unwrap().metadata.is_empty());
    }

    #[test]
    fn null_headers_are_empty() {
        let raw = br#"{"timestamp":"2024-01-15T12:00:00Z","request_id":"r","src_ip":"h","provider":"p","model":"m","prompt":"x","headers":null}"#;
        assert!(parse_record(raw).unwrap().headers.is_empty());
    }

    #[test]
    fn rejects_invalid_json() {
        let err = parse_record(b"{not json").unwrap_err();
        assert!(matches!(err, TrafficError::MalformedRecord { .. }));
    }

    #[test]
    fn rejects_missing_required_field() {
        let raw = br#"{"timestamp":"2024-01-15T12:00:00Z","request_id":"r","src_ip":"h","provider":"p","model":"m"}"#;
        let err = parse_record(raw).unwrap_err();
        assert!(err.to_string().contains("prompt"));
    }

    #[test]
    fn rejects_blank_request_id() {
        let raw = br#"{"timestamp":"2024-01-15T12:00:00Z","request_id":"  ","src_ip":"h","provider":"p","model":"m","prompt":"x"}"#;
        assert!(parse_record(raw).is_err());
    }

    #[test]
    fn rejects_oversized_payload() {
        let raw = vec![b' '; MAX_PAYLOAD_SIZE + 1];
        let err = parse_record(&raw).unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn timestamp_formats() {
        let with_offset = parse_timestamp("2024-01-15T12:00:00+02:00").unwrap();
        assert_eq!(with_offset.hour(), 10);

        let naive_t = parse_timestamp("2024-01-15T12:00:00.5").unwrap();
        assert_eq!(naive_t.minute(), 0);

        let naive_space = parse_timestamp("2024-01-15 08:15:00").unwrap();
        assert_eq!(naive_space.hour(), 8);
        assert_eq!(naive_space.day(), 15);

        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn preview_truncates_on_char_boundary() {
        assert_eq!(prompt_preview("short", 150), "short");
        assert_eq!(prompt_preview("abcdef", 3), "abc...");
        // multi-byte characters
        assert_eq!(prompt_preview("héllo wörld", 4), "héll...");
        assert_eq!(prompt_preview("abc", 3), "abc");
    }

    #[test]
    fn payload_preview_is_lossy() {
        let preview = payload_preview(&[0xff, b'a', b'b'], 10);
        assert!(preview.ends_with("ab"));
    }
}

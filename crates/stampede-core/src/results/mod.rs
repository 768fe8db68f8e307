use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum length of a response body stored per result.
pub const MAX_RESPONSE_BODY_LEN: usize = 4096;

// ---------------------------------------------------------------------------
// TestResult — one observation per executed step
// ---------------------------------------------------------------------------

/// An immutable observation emitted exactly once per executed step,
/// including skipped and errored ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub id: Uuid,
    pub vu_id: u64,
    pub iteration: u64,
    pub scenario: String,
    /// The step variant tag (`rest`, `soap`, `wait`, ...).
    pub action: String,
    pub step_name: String,
    /// JMeter-style thread name: `"{iter}. {step} {vu}-{iter}"`.
    pub thread_name: String,
    /// Wall-clock milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Total step duration in milliseconds (hooks included).
    pub duration: u64,
    /// Protocol-level response time in milliseconds.
    pub response_time: u64,
    pub success: bool,
    pub status: u16,
    #[serde(default)]
    pub status_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default)]
    pub response_size: u64,
    #[serde(default)]
    pub request_url: String,
    #[serde(default)]
    pub request_method: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub request_headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub response_headers: HashMap<String, String>,
    /// Response body, truncated to [`MAX_RESPONSE_BODY_LEN`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    /// Time to establish the connection (ms); zero when pooled.
    #[serde(default)]
    pub connect_time: u64,
    /// Time to first byte (ms).
    #[serde(default)]
    pub latency: u64,
    #[serde(default)]
    pub sent_bytes: u64,
    #[serde(default)]
    pub headers_size_sent: u64,
    #[serde(default)]
    pub body_size_sent: u64,
    #[serde(default)]
    pub headers_size_received: u64,
    #[serde(default)]
    pub body_size_received: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub custom_metrics: HashMap<String, serde_json::Value>,
    /// False only for web commands that are neither verifications nor waits.
    #[serde(default = "default_true")]
    pub should_record: bool,
}

fn default_true() -> bool {
    true
}

impl TestResult {
    /// A blank result for the given identity; callers fill in the outcome.
    pub fn new(
        vu_id: u64,
        iteration: u64,
        scenario: &str,
        action: &str,
        step_name: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            vu_id,
            iteration,
            scenario: scenario.to_string(),
            action: action.to_string(),
            step_name: step_name.to_string(),
            thread_name: format!("{iteration}. {step_name} {vu_id}-{iteration}"),
            timestamp: crate::clock::epoch_ms(),
            duration: 0,
            response_time: 0,
            success: true,
            status: 0,
            status_text: String::new(),
            error: None,
            error_code: None,
            response_size: 0,
            request_url: String::new(),
            request_method: String::new(),
            request_headers: HashMap::new(),
            request_body: None,
            response_headers: HashMap::new(),
            response_body: None,
            connect_time: 0,
            latency: 0,
            sent_bytes: 0,
            headers_size_sent: 0,
            body_size_sent: 0,
            headers_size_received: 0,
            body_size_received: 0,
            data_type: None,
            custom_metrics: HashMap::new(),
            should_record: true,
        }
    }

    /// Mark this result failed with the given message. Failed results are
    /// always recorded.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.success = false;
        self.error = Some(error.into());
        self.should_record = true;
    }
}

// ---------------------------------------------------------------------------
// VuStartEvent — feeds the timeline's active-VU curve
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VuStartEvent {
    pub vu_id: u64,
    /// Wall-clock milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// The load pattern that created the VU (`basic`, `stepping`, `arrivals`).
    pub pattern: String,
}

/// Matching end marker for a VU; together with [`VuStartEvent`] it defines
/// the interval the VU was alive, which the timeline's active-VU curve is
/// computed from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VuEndEvent {
    pub vu_id: u64,
    /// Wall-clock milliseconds since the Unix epoch.
    pub timestamp: i64,
}

// ---------------------------------------------------------------------------
// Summary types
// ---------------------------------------------------------------------------

/// Statistics for one `(scenario, step_name)` group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepStats {
    pub scenario: String,
    pub step_name: String,
    pub total: u64,
    pub success: u64,
    pub fail: u64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub avg_ms: f64,
}

/// One fixed-width interval of the summary timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineBucket {
    /// Bucket start, milliseconds since the Unix epoch.
    pub start: i64,
    pub requests: u64,
    pub errors: u64,
    pub avg_response_ms: f64,
    pub p95_response_ms: u64,
    /// Requests per second within the bucket.
    pub throughput: f64,
    /// VUs alive at the end of the bucket: starts seen so far minus ends
    /// seen so far.
    pub active_vus: u64,
    pub bytes_received: u64,
    /// Requests per HTTP status code.
    pub status_counts: HashMap<u16, u64>,
}

/// A deduplicated error with first-seen metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub scenario: String,
    pub action: String,
    pub status: u16,
    pub message: String,
    pub count: u64,
    pub first_seen: i64,
    pub first_vu_id: u64,
    pub first_step_name: String,
}

/// Aggregated summary of a completed test run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSummary {
    pub test_name: String,
    pub started_at: i64,
    pub finished_at: i64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Percentage in `[0, 100]`.
    pub success_rate: f64,
    pub min_response_ms: u64,
    pub max_response_ms: u64,
    pub mean_response_ms: f64,
    /// Requested percentiles keyed as `"p50"`, `"p95"`, ...
    pub percentiles: std::collections::BTreeMap<String, u64>,
    pub requests_per_second: f64,
    pub bytes_per_second: f64,
    pub total_bytes_received: u64,
    pub step_stats: Vec<StepStats>,
    pub timeline: Vec<TimelineBucket>,
    pub errors: Vec<ErrorSummary>,
    pub vu_ramp_up: Vec<VuStartEvent>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_result_has_thread_name_in_jmeter_format() {
        let r = TestResult::new(7, 3, "checkout", "rest", "Pay");
        assert_eq!(r.thread_name, "3. Pay 7-3");
    }

    #[test]
    fn new_result_timestamp_is_not_in_the_future() {
        let r = TestResult::new(1, 0, "s", "rest", "step");
        assert!(r.timestamp <= crate::clock::epoch_ms());
    }

    #[test]
    fn fail_sets_error_and_forces_recording() {
        let mut r = TestResult::new(1, 0, "s", "web", "click");
        r.should_record = false;
        r.fail("boom");
        assert!(!r.success);
        assert_eq!(r.error.as_deref(), Some("boom"));
        assert!(r.should_record);
    }

    #[test]
    fn result_serde_round_trip_preserves_fields() {
        let mut r = TestResult::new(2, 1, "browse", "rest", "Home");
        r.status = 200;
        r.status_text = "OK".to_string();
        r.duration = 42;
        r.response_time = 40;
        r.response_size = 1024;
        r.request_url = "http://example.com/".to_string();
        r.request_method = "GET".to_string();
        r.custom_metrics
            .insert("rendezvous_vu_count".to_string(), serde_json::json!(5));

        let json = serde_json::to_string(&r).unwrap();
        let parsed: TestResult = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, r.id);
        assert_eq!(parsed.vu_id, 2);
        assert_eq!(parsed.status, 200);
        assert_eq!(parsed.response_time, 40);
        assert_eq!(parsed.thread_name, r.thread_name);
        assert_eq!(
            parsed.custom_metrics.get("rendezvous_vu_count"),
            Some(&serde_json::json!(5))
        );
        assert!(parsed.should_record);
    }

    #[test]
    fn result_deserializes_with_minimal_fields() {
        let json = r#"{
            "id": "00000000-0000-0000-0000-000000000001",
            "vu_id": 1, "iteration": 0,
            "scenario": "s", "action": "rest", "step_name": "x",
            "thread_name": "0. x 1-0", "timestamp": 1700000000000,
            "duration": 10, "response_time": 9,
            "success": true, "status": 200
        }"#;
        let r: TestResult = serde_json::from_str(json).unwrap();
        assert!(r.should_record);
        assert!(r.error.is_none());
        assert!(r.request_headers.is_empty());
    }
}

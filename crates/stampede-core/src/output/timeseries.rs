//! Time-series writer — structured points in InfluxDB line protocol with a
//! batched flush.
//!
//! Point types: `test_result` (one per recorded step), `network_call`
//! (protocol steps only), and `test_summary` (once at finalisation), all
//! tagged by test name, scenario, action, and success.

use std::sync::Arc;
use std::time::Instant;

use crate::results::{TestResult, TestSummary};

pub const DEFAULT_TS_BATCH_SIZE: usize = 500;
pub const DEFAULT_TS_FLUSH_INTERVAL_MS: u64 = 5_000;

pub struct TimeSeriesWriter {
    client: Arc<reqwest::Client>,
    write_url: String,
    test_name: String,
    buffer: Vec<String>,
    batch_size: usize,
    last_flush: Instant,
    flush_interval_ms: u64,
}

impl TimeSeriesWriter {
    pub fn new(
        client: Arc<reqwest::Client>,
        url: &str,
        database: Option<&str>,
        test_name: &str,
    ) -> Self {
        let write_url = match database {
            Some(db) => format!("{}/write?db={db}&precision=ns", url.trim_end_matches('/')),
            None => format!("{}/write?precision=ns", url.trim_end_matches('/')),
        };
        Self {
            client,
            write_url,
            test_name: test_name.to_string(),
            buffer: Vec::new(),
            batch_size: DEFAULT_TS_BATCH_SIZE,
            last_flush: Instant::now(),
            flush_interval_ms: DEFAULT_TS_FLUSH_INTERVAL_MS,
        }
    }

    /// Queue the points for one result; flushes when the batch fills.
    pub async fn add_result(&mut self, result: &TestResult) {
        let ts_ns = (result.timestamp as i128) * 1_000_000;
        let tags = format!(
            "test={},scenario={},action={},success={}",
            escape_tag(&self.test_name),
            escape_tag(&result.scenario),
            escape_tag(&result.action),
            result.success
        );

        self.buffer.push(format!(
            "test_result,{tags} response_time={}i,duration={}i,status={}i {ts_ns}",
            result.response_time, result.duration, result.status
        ));

        // Network-level detail only exists for protocol steps.
        if matches!(result.action.as_str(), "rest" | "soap" | "web") {
            self.buffer.push(format!(
                "network_call,{tags} latency={}i,connect_time={}i,\
                 sent_bytes={}i,response_size={}i {ts_ns}",
                result.latency, result.connect_time, result.sent_bytes, result.response_size
            ));
        }

        if self.buffer.len() >= self.batch_size {
            self.flush().await;
        }
    }

    /// Queue the final summary point.
    pub async fn add_summary(&mut self, summary: &TestSummary) {
        let ts_ns = (summary.finished_at as i128) * 1_000_000;
        self.buffer.push(format!(
            "test_summary,test={} total_requests={}i,failed_requests={}i,\
             success_rate={},mean_response_ms={},requests_per_second={} {ts_ns}",
            escape_tag(&self.test_name),
            summary.total_requests,
            summary.failed_requests,
            summary.success_rate,
            summary.mean_response_ms,
            summary.requests_per_second
        ));
        self.flush().await;
    }

    /// Flush when the interval elapsed; called from the pipeline ticker.
    pub async fn tick(&mut self) {
        if !self.buffer.is_empty()
            && self.last_flush.elapsed().as_millis() as u64 >= self.flush_interval_ms
        {
            self.flush().await;
        }
    }

    pub async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let body = self.buffer.join("\n");
        self.buffer.clear();
        self.last_flush = Instant::now();

        match self.client.post(&self.write_url).body(body).send().await {
            Ok(response) if response.status().is_success() => {
                tracing::trace!("time-series batch written");
            }
            Ok(response) => {
                tracing::warn!(status = %response.status(), "time-series write rejected");
            }
            Err(e) => {
                tracing::warn!(error = %e, "time-series write failed");
            }
        }
    }
}

/// Escape tag values per line protocol: commas, spaces, equals.
pub fn escape_tag(value: &str) -> String {
    value
        .replace(',', "\\,")
        .replace(' ', "\\ ")
        .replace('=', "\\=")
}

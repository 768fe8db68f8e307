//! Metrics core — running statistics, reservoir percentiles, error
//! tracking, and the bounded result store feeding summary generation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::results::{
    ErrorSummary, StepStats, TestResult, TestSummary, TimelineBucket, VuEndEvent, VuStartEvent,
};

/// Reservoir size for percentile estimation.
pub const DEFAULT_RESERVOIR_SIZE: usize = 10_000;

/// Result store capacity; stores beyond it are dropped and flagged.
pub const DEFAULT_STORE_CAPACITY: usize = 50_000;

/// Timeline bucket width in milliseconds.
pub const DEFAULT_BUCKET_MS: i64 = 5_000;

/// Percentiles reported in summaries unless configured otherwise.
pub const DEFAULT_PERCENTILES: &[f64] = &[50.0, 90.0, 95.0, 99.0];

// ---------------------------------------------------------------------------
// RunningStats
// ---------------------------------------------------------------------------

/// O(1) running counters plus a reservoir sample of success durations.
///
/// The reservoir (algorithm R) keeps percentile estimation bounded for
/// arbitrarily long runs; up to the reservoir bound the statistics are
/// numerically identical to recomputing from the full result log.
pub struct RunningStats {
    total: u64,
    success: u64,
    fail: u64,
    sum_ms: u64,
    min_ms: u64,
    max_ms: u64,
    total_bytes: u64,
    reservoir: Vec<u64>,
    reservoir_cap: usize,
    /// Success observations seen, including those not retained.
    successes_seen: u64,
    rng: StdRng,
}

impl RunningStats {
    pub fn new() -> Self {
        Self::with_reservoir(DEFAULT_RESERVOIR_SIZE)
    }

    pub fn with_reservoir(cap: usize) -> Self {
        Self {
            total: 0,
            success: 0,
            fail: 0,
            sum_ms: 0,
            min_ms: u64::MAX,
            max_ms: 0,
            total_bytes: 0,
            reservoir: Vec::with_capacity(cap.min(1024)),
            reservoir_cap: cap,
            successes_seen: 0,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn record(&mut self, duration_ms: u64, success: bool, bytes: u64) {
        self.total += 1;
        if success {
            self.success += 1;
        } else {
            self.fail += 1;
        }
        self.sum_ms += duration_ms;
        if duration_ms < self.min_ms {
            self.min_ms = duration_ms;
        }
        if duration_ms > self.max_ms {
            self.max_ms = duration_ms;
        }
        self.total_bytes += bytes;

        // Only successful durations enter the percentile reservoir.
        if success {
            self.successes_seen += 1;
            if self.reservoir.len() < self.reservoir_cap {
                self.reservoir.push(duration_ms);
            } else {
                let slot = self.rng.gen_range(0..self.successes_seen) as usize;
                if slot < self.reservoir_cap {
                    self.reservoir[slot] = duration_ms;
                }
            }
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn success(&self) -> u64 {
        self.success
    }

    pub fn fail(&self) -> u64 {
        self.fail
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn min_ms(&self) -> u64 {
        if self.min_ms == u64::MAX {
            0
        } else {
            self.min_ms
        }
    }

    pub fn max_ms(&self) -> u64 {
        self.max_ms
    }

    pub fn mean_ms(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.sum_ms as f64 / self.total as f64
        }
    }

    /// The p-th percentile over the reservoir: `ceil((p/100)·n) − 1` on the
    /// sorted sample. Zero when nothing has been recorded.
    pub fn percentile(&self, p: f64) -> u64 {
        percentile_of(&self.reservoir, p)
    }

    /// Percentiles keyed `"p50"`, `"p95"`, ... for the given set.
    pub fn percentiles(&self, set: &[f64]) -> BTreeMap<String, u64> {
        set.iter()
            .map(|&p| {
                let label = if p.fract() == 0.0 {
                    format!("p{}", p as u64)
                } else {
                    format!("p{p}")
                };
                (label, self.percentile(p))
            })
            .collect()
    }
}

impl Default for RunningStats {
    fn default() -> Self {
        Self::new()
    }
}

fn percentile_of(sample: &[u64], p: f64) -> u64 {
    if sample.is_empty() {
        return 0;
    }
    let mut sorted = sample.to_vec();
    sorted.sort_unstable();
    let idx = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[idx.saturating_sub(1).min(sorted.len() - 1)]
}

// ---------------------------------------------------------------------------
// ErrorTracker
// ---------------------------------------------------------------------------

/// Deduplicates errors by `(scenario, action, status, message)`, keeping
/// first-seen metadata and a count.
#[derive(Default)]
pub struct ErrorTracker {
    errors: HashMap<(String, String, u16, String), ErrorSummary>,
}

impl ErrorTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, result: &TestResult) {
        let Some(message) = &result.error else {
            return;
        };
        let key = (
            result.scenario.clone(),
            result.action.clone(),
            result.status,
            message.clone(),
        );
        self.errors
            .entry(key)
            .and_modify(|e| e.count += 1)
            .or_insert_with(|| ErrorSummary {
                scenario: result.scenario.clone(),
                action: result.action.clone(),
                status: result.status,
                message: message.clone(),
                count: 1,
                first_seen: result.timestamp,
                first_vu_id: result.vu_id,
                first_step_name: result.step_name.clone(),
            });
    }

    /// All distinct errors, most frequent first.
    pub fn summaries(&self) -> Vec<ErrorSummary> {
        let mut list: Vec<ErrorSummary> = self.errors.values().cloned().collect();
        list.sort_by(|a, b| b.count.cmp(&a.count).then(a.first_seen.cmp(&b.first_seen)));
        list
    }

    /// Error counts keyed by error code (falling back to the action tag)
    /// over an arbitrary result list.
    pub fn error_type_distribution(results: &[TestResult]) -> HashMap<String, u64> {
        let mut dist = HashMap::new();
        for r in results.iter().filter(|r| !r.success) {
            let key = r
                .error_code
                .clone()
                .unwrap_or_else(|| r.action.clone());
            *dist.entry(key).or_insert(0) += 1;
        }
        dist
    }

    /// Request counts per HTTP status over an arbitrary result list.
    pub fn status_distribution(results: &[TestResult]) -> HashMap<u16, u64> {
        let mut dist = HashMap::new();
        for r in results {
            *dist.entry(r.status).or_insert(0) += 1;
        }
        dist
    }
}

// ---------------------------------------------------------------------------
// ResultStore
// ---------------------------------------------------------------------------

/// Bounded append log of results plus VU start events. On overflow further
/// stores are dropped and a flag is raised; counters keep running in
/// [`RunningStats`] regardless.
pub struct ResultStore {
    results: Vec<TestResult>,
    capacity: usize,
    dropped: bool,
    vu_starts: Vec<VuStartEvent>,
    vu_ends: Vec<VuEndEvent>,
}

impl ResultStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            results: Vec::new(),
            capacity,
            dropped: false,
            vu_starts: Vec::new(),
            vu_ends: Vec::new(),
        }
    }

    pub fn push(&mut self, result: TestResult) {
        if self.results.len() >= self.capacity {
            if !self.dropped {
                tracing::warn!(
                    capacity = self.capacity,
                    "result store full; further results are dropped"
                );
            }
            self.dropped = true;
            return;
        }
        self.results.push(result);
    }

    pub fn record_vu_start(&mut self, vu_id: u64, pattern: &str) {
        self.vu_starts.push(VuStartEvent {
            vu_id,
            timestamp: crate::clock::epoch_ms(),
            pattern: pattern.to_string(),
        });
    }

    pub fn record_vu_end(&mut self, vu_id: u64) {
        self.vu_ends.push(VuEndEvent {
            vu_id,
            timestamp: crate::clock::epoch_ms(),
        });
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn dropped(&self) -> bool {
        self.dropped
    }

    pub fn results(&self) -> &[TestResult] {
        &self.results
    }

    pub fn vu_starts(&self) -> &[VuStartEvent] {
        &self.vu_starts
    }

    pub fn vu_ends(&self) -> &[VuEndEvent] {
        &self.vu_ends
    }

    /// Results whose timestamp falls within `[from_ms, to_ms)`.
    pub fn results_between(&self, from_ms: i64, to_ms: i64) -> Vec<&TestResult> {
        self.results
            .iter()
            .filter(|r| r.timestamp >= from_ms && r.timestamp < to_ms)
            .collect()
    }
}

impl Default for ResultStore {
    fn default() -> Self {
        Self::new(DEFAULT_STORE_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Metrics — the shared hub owned by the test context
// ---------------------------------------------------------------------------

/// The shared metrics hub. `record` is atomic: totals observed through
/// `summary` always correspond to a prefix of the per-VU result sequences.
pub struct Metrics {
    inner: Mutex<MetricsInner>,
    started: Instant,
    started_at_ms: i64,
}

struct MetricsInner {
    stats: RunningStats,
    errors: ErrorTracker,
    store: ResultStore,
}

/// A lightweight snapshot for progress reporting.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub total: u64,
    pub errors: u64,
    pub mean_ms: f64,
    pub p95_ms: u64,
    pub rps: f64,
    pub error_rate: f64,
    pub elapsed_ms: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MetricsInner {
                stats: RunningStats::new(),
                errors: ErrorTracker::new(),
                store: ResultStore::default(),
            }),
            started: Instant::now(),
            started_at_ms: crate::clock::epoch_ms(),
        }
    }

    /// Record one result into stats, error tracker, and store. Results with
    /// `should_record = false` are skipped entirely.
    pub fn record(&self, result: &TestResult) {
        if !result.should_record {
            return;
        }
        let mut inner = self.inner.lock().expect("metrics lock poisoned");
        inner
            .stats
            .record(result.duration, result.success, result.response_size);
        inner.errors.record(result);
        inner.store.push(result.clone());
    }

    pub fn record_vu_start(&self, vu_id: u64, pattern: &str) {
        let mut inner = self.inner.lock().expect("metrics lock poisoned");
        inner.store.record_vu_start(vu_id, pattern);
    }

    pub fn record_vu_end(&self, vu_id: u64) {
        let mut inner = self.inner.lock().expect("metrics lock poisoned");
        inner.store.record_vu_end(vu_id);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.lock().expect("metrics lock poisoned");
        let elapsed = self.started.elapsed();
        let elapsed_secs = elapsed.as_secs_f64().max(0.001);
        let total = inner.stats.total();
        MetricsSnapshot {
            total,
            errors: inner.stats.fail(),
            mean_ms: inner.stats.mean_ms(),
            p95_ms: inner.stats.percentile(95.0),
            rps: total as f64 / elapsed_secs,
            error_rate: if total > 0 {
                inner.stats.fail() as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    /// Build the completed-run summary with the default percentile set and
    /// bucket width.
    pub fn summary(&self, test_name: &str) -> TestSummary {
        self.summary_with(test_name, DEFAULT_PERCENTILES, DEFAULT_BUCKET_MS)
    }

    pub fn summary_with(
        &self,
        test_name: &str,
        percentile_set: &[f64],
        bucket_ms: i64,
    ) -> TestSummary {
        let inner = self.inner.lock().expect("metrics lock poisoned");
        let finished_at = crate::clock::epoch_ms();
        let stats = &inner.stats;

        let total = stats.total();
        let elapsed_secs =
            ((finished_at - self.started_at_ms).max(1)) as f64 / 1000.0;

        TestSummary {
            test_name: test_name.to_string(),
            started_at: self.started_at_ms,
            finished_at,
            total_requests: total,
            successful_requests: stats.success(),
            failed_requests: stats.fail(),
            success_rate: if total > 0 {
                stats.success() as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            min_response_ms: stats.min_ms(),
            max_response_ms: stats.max_ms(),
            mean_response_ms: stats.mean_ms(),
            percentiles: stats.percentiles(percentile_set),
            requests_per_second: total as f64 / elapsed_secs,
            bytes_per_second: stats.total_bytes() as f64 / elapsed_secs,
            total_bytes_received: stats.total_bytes(),
            step_stats: build_step_stats(inner.store.results()),
            timeline: build_timeline(
                inner.store.results(),
                inner.store.vu_starts(),
                inner.store.vu_ends(),
                self.started_at_ms,
                finished_at,
                bucket_ms,
            ),
            errors: inner.errors.summaries(),
            vu_ramp_up: inner.store.vu_starts().to_vec(),
        }
    }

    /// Drain a clone of all stored results (for the worker's `/results`).
    pub fn stored_results(&self) -> Vec<TestResult> {
        let inner = self.inner.lock().expect("metrics lock poisoned");
        inner.store.results().to_vec()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Summary building
// ---------------------------------------------------------------------------

fn build_step_stats(results: &[TestResult]) -> Vec<StepStats> {
    let mut groups: BTreeMap<(String, String), StepStats> = BTreeMap::new();
    let mut sums: HashMap<(String, String), u64> = HashMap::new();

    for r in results {
        let key = (r.scenario.clone(), r.step_name.clone());
        let entry = groups.entry(key.clone()).or_insert_with(|| StepStats {
            scenario: r.scenario.clone(),
            step_name: r.step_name.clone(),
            total: 0,
            success: 0,
            fail: 0,
            min_ms: u64::MAX,
            max_ms: 0,
            avg_ms: 0.0,
        });
        entry.total += 1;
        if r.success {
            entry.success += 1;
        } else {
            entry.fail += 1;
        }
        entry.min_ms = entry.min_ms.min(r.response_time);
        entry.max_ms = entry.max_ms.max(r.response_time);
        *sums.entry(key).or_insert(0) += r.response_time;
    }

    groups
        .into_iter()
        .map(|(key, mut stats)| {
            if stats.min_ms == u64::MAX {
                stats.min_ms = 0;
            }
            stats.avg_ms = sums[&key] as f64 / stats.total as f64;
            stats
        })
        .collect()
}

fn build_timeline(
    results: &[TestResult],
    vu_starts: &[VuStartEvent],
    vu_ends: &[VuEndEvent],
    started_at: i64,
    finished_at: i64,
    bucket_ms: i64,
) -> Vec<TimelineBucket> {
    if results.is_empty() || bucket_ms <= 0 {
        return Vec::new();
    }

    let span = (finished_at - started_at).max(1);
    let bucket_count = (span + bucket_ms - 1) / bucket_ms;

    let mut buckets: Vec<TimelineBucket> = (0..bucket_count)
        .map(|i| TimelineBucket {
            start: started_at + i * bucket_ms,
            requests: 0,
            errors: 0,
            avg_response_ms: 0.0,
            p95_response_ms: 0,
            throughput: 0.0,
            active_vus: 0,
            bytes_received: 0,
            status_counts: HashMap::new(),
        })
        .collect();

    let mut durations: Vec<Vec<u64>> = vec![Vec::new(); bucket_count as usize];

    for r in results {
        let idx = ((r.timestamp - started_at) / bucket_ms)
            .clamp(0, bucket_count - 1) as usize;
        let bucket = &mut buckets[idx];
        bucket.requests += 1;
        if !r.success {
            bucket.errors += 1;
        }
        bucket.bytes_received += r.response_size;
        *bucket.status_counts.entry(r.status).or_insert(0) += 1;
        durations[idx].push(r.response_time);
    }

    for (idx, bucket) in buckets.iter_mut().enumerate() {
        let samples = &durations[idx];
        if !samples.is_empty() {
            bucket.avg_response_ms =
                samples.iter().sum::<u64>() as f64 / samples.len() as f64;
            bucket.p95_response_ms = percentile_of(samples, 95.0);
        }
        bucket.throughput = bucket.requests as f64 / (bucket_ms as f64 / 1000.0);
        // Active VUs sampled at the bucket boundary: every start seen so
        // far minus every end seen so far, so the curve falls again when
        // VUs retire (scale-down steps, expired arrivals).
        let bucket_end = bucket.start + bucket_ms;
        let started = vu_starts
            .iter()
            .filter(|v| v.timestamp < bucket_end)
            .count() as u64;
        let ended = vu_ends
            .iter()
            .filter(|v| v.timestamp < bucket_end)
            .count() as u64;
        bucket.active_vus = started.saturating_sub(ended);
    }

    buckets
}

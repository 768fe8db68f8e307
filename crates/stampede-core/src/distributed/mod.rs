//! Distributed coordinator — partitions a test across workers, drives the
//! worker HTTP protocol, tracks health, and aggregates results.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::StampedeError;
use crate::model::{
    DistributedConfig, DistributionStrategy, LoadPhase, LoadSection, TestConfiguration,
    WorkerSpec,
};
use crate::results::TestSummary;
use crate::worker::{ResultsBody, StartBody, WorkerStatusBody};

/// Minimum lead time for a synchronised start.
const SYNC_START_LEAD: Duration = Duration::from_secs(5);
/// A worker whose last heartbeat is older than this is marked `timeout`.
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);
/// A worker with more errors than this is marked `unhealthy`.
const MAX_ERROR_COUNT: u32 = 10;
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Worker records & client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerHealth {
    Connected,
    Disconnected,
    Unhealthy,
    Timeout,
}

/// Observational health record for one worker. The coordinator never
/// reassigns work based on it.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub spec: WorkerSpec,
    pub health: WorkerHealth,
    pub last_heartbeat: Option<Instant>,
    pub error_count: u32,
    pub response_time_ms: u64,
    pub running: bool,
    pub active_runner: bool,
}

impl WorkerRecord {
    fn new(spec: WorkerSpec) -> Self {
        Self {
            spec,
            health: WorkerHealth::Disconnected,
            last_heartbeat: None,
            error_count: 0,
            response_time_ms: 0,
            running: false,
            active_runner: false,
        }
    }
}

/// Thin typed client for the worker HTTP protocol.
pub struct WorkerClient {
    base: String,
    client: Arc<reqwest::Client>,
}

impl WorkerClient {
    pub fn new(address: &str, client: Arc<reqwest::Client>) -> Self {
        let base = if address.starts_with("http://") || address.starts_with("https://") {
            address.trim_end_matches('/').to_string()
        } else {
            format!("http://{address}")
        };
        Self { base, client }
    }

    async fn check<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, StampedeError> {
        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|v| v["message"].as_str().map(str::to_string))
                .unwrap_or_else(|| status.to_string());
            return Err(StampedeError::Worker {
                address: self.base.clone(),
                message,
            });
        }
        response.json::<T>().await.map_err(|e| StampedeError::Worker {
            address: self.base.clone(),
            message: format!("invalid response body: {e}"),
        })
    }

    pub async fn health(&self) -> Result<(), StampedeError> {
        let response = self
            .client
            .get(format!("{}/health", self.base))
            .send()
            .await
            .map_err(|e| StampedeError::Worker {
                address: self.base.clone(),
                message: e.to_string(),
            })?;
        let _: serde_json::Value = self.check(response).await?;
        Ok(())
    }

    pub async fn status(&self) -> Result<WorkerStatusBody, StampedeError> {
        let response = self
            .client
            .get(format!("{}/status", self.base))
            .send()
            .await
            .map_err(|e| StampedeError::Worker {
                address: self.base.clone(),
                message: e.to_string(),
            })?;
        self.check(response).await
    }

    pub async fn prepare(&self, config: &TestConfiguration) -> Result<(), StampedeError> {
        let response = self
            .client
            .post(format!("{}/prepare", self.base))
            .json(config)
            .send()
            .await
            .map_err(|e| StampedeError::Worker {
                address: self.base.clone(),
                message: e.to_string(),
            })?;
        let _: serde_json::Value = self.check(response).await?;
        Ok(())
    }

    pub async fn start(&self, start_time: Option<i64>) -> Result<(), StampedeError> {
        let response = self
            .client
            .post(format!("{}/start", self.base))
            .json(&StartBody { start_time })
            .send()
            .await
            .map_err(|e| StampedeError::Worker {
                address: self.base.clone(),
                message: e.to_string(),
            })?;
        let _: serde_json::Value = self.check(response).await?;
        Ok(())
    }

    pub async fn results(&self) -> Result<ResultsBody, StampedeError> {
        let response = self
            .client
            .get(format!("{}/results", self.base))
            .send()
            .await
            .map_err(|e| StampedeError::Worker {
                address: self.base.clone(),
                message: e.to_string(),
            })?;
        self.check(response).await
    }

    pub async fn stop(&self) -> Result<(), StampedeError> {
        let response = self
            .client
            .post(format!("{}/stop", self.base))
            .send()
            .await
            .map_err(|e| StampedeError::Worker {
                address: self.base.clone(),
                message: e.to_string(),
            })?;
        let _: serde_json::Value = self.check(response).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// VU distribution
// ---------------------------------------------------------------------------

/// Split `total` VUs across workers by strategy. The returned vector is
/// index-aligned with `workers` and always sums to `total`.
pub fn distribute(
    total: u32,
    strategy: DistributionStrategy,
    workers: &[WorkerSpec],
) -> Vec<u32> {
    let n = workers.len();
    if n == 0 {
        return Vec::new();
    }

    match strategy {
        DistributionStrategy::Even => {
            let base = total / n as u32;
            let remainder = (total % n as u32) as usize;
            (0..n)
                .map(|i| base + u32::from(i < remainder))
                .collect()
        }

        DistributionStrategy::CapacityBased => {
            let capacity_sum: u64 = workers.iter().map(|w| w.capacity.max(1) as u64).sum();
            let mut counts: Vec<u32> = workers
                .iter()
                .map(|w| {
                    ((total as u64 * w.capacity.max(1) as u64) / capacity_sum) as u32
                })
                .collect();
            // Hand the rounding remainder to the earliest workers.
            let mut assigned: u32 = counts.iter().sum();
            let mut i = 0;
            while assigned < total {
                counts[i % n] += 1;
                assigned += 1;
                i += 1;
            }
            counts
        }

        DistributionStrategy::RoundRobin => {
            let mut counts = vec![0u32; n];
            for i in 0..total {
                counts[i as usize % n] += 1;
            }
            counts
        }

        DistributionStrategy::Geographic => {
            // Group workers by region, split evenly across regions, then
            // evenly within each region.
            let mut regions: BTreeMap<String, Vec<usize>> = BTreeMap::new();
            for (i, worker) in workers.iter().enumerate() {
                regions
                    .entry(worker.region.clone().unwrap_or_else(|| "default".to_string()))
                    .or_default()
                    .push(i);
            }

            let region_count = regions.len() as u32;
            let base = total / region_count;
            let remainder = (total % region_count) as usize;

            let mut counts = vec![0u32; n];
            for (r, (_, members)) in regions.into_iter().enumerate() {
                let region_total = base + u32::from(r < remainder);
                let member_count = members.len() as u32;
                let member_base = region_total / member_count;
                let member_remainder = (region_total % member_count) as usize;
                for (m, &index) in members.iter().enumerate() {
                    counts[index] = member_base + u32::from(m < member_remainder);
                }
            }
            counts
        }
    }
}

/// The total VU count a configuration asks for, summed over its phases.
pub fn total_vus(config: &TestConfiguration) -> u32 {
    config
        .load
        .phases()
        .iter()
        .map(|phase| match phase {
            LoadPhase::Basic { virtual_users, .. } => *virtual_users,
            LoadPhase::Stepping { steps } => {
                steps.iter().map(|s| s.users).max().unwrap_or(0)
            }
            LoadPhase::Arrivals { rate, .. } => rate.ceil() as u32,
        })
        .max()
        .unwrap_or(0)
}

/// Rewrite a configuration for one worker: unique name suffix, VU counts
/// scaled to the worker's share, webhook outputs dropped, and report
/// generation disabled.
pub fn rewrite_for_worker(
    config: &TestConfiguration,
    worker_index: usize,
    share: u32,
    total: u32,
) -> TestConfiguration {
    let mut rewritten = config.clone();
    rewritten.name = format!("{}-worker-{}", config.name, worker_index + 1);
    rewritten.report = Some(false);
    rewritten.distributed = None;
    rewritten.outputs.retain(|o| !o.is_webhook());

    let factor = if total > 0 {
        share as f64 / total as f64
    } else {
        0.0
    };
    let scale = |users: u32| -> u32 {
        if users == 0 || share == 0 {
            0
        } else {
            ((users as f64 * factor).round() as u32).max(1)
        }
    };

    let phases: Vec<LoadPhase> = rewritten
        .load
        .phases()
        .into_iter()
        .map(|phase| match phase {
            LoadPhase::Basic {
                virtual_users,
                duration,
                ramp_up,
            } => LoadPhase::Basic {
                virtual_users: if virtual_users == total {
                    share
                } else {
                    scale(virtual_users)
                },
                duration,
                ramp_up,
            },
            LoadPhase::Stepping { mut steps } => {
                for step in &mut steps {
                    step.users = scale(step.users);
                }
                LoadPhase::Stepping { steps }
            }
            LoadPhase::Arrivals {
                rate,
                duration,
                ramp_up,
                vu_duration,
            } => LoadPhase::Arrivals {
                rate: (rate * factor).max(f64::MIN_POSITIVE),
                duration,
                ramp_up,
                vu_duration,
            },
        })
        .collect();

    rewritten.load = if phases.len() == 1 {
        LoadSection::Single(phases.into_iter().next().expect("one phase"))
    } else {
        LoadSection::Phases(phases)
    };
    rewritten
}

// ---------------------------------------------------------------------------
// Combined summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombinedSummary {
    pub test_name: String,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub success_rate: f64,
    /// Per-worker summaries keyed by worker address.
    pub workers: BTreeMap<String, TestSummary>,
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct Coordinator {
    config: TestConfiguration,
    distributed: DistributedConfig,
    client: Arc<reqwest::Client>,
    workers: Arc<Mutex<Vec<WorkerRecord>>>,
    cancel: CancellationToken,
}

impl Coordinator {
    /// Build a coordinator from a configuration carrying a `distributed`
    /// section.
    pub fn new(config: TestConfiguration) -> Result<Self, StampedeError> {
        let Some(distributed) = config.distributed.clone() else {
            return Err(StampedeError::Config(
                "configuration has no distributed section".to_string(),
            ));
        };
        if distributed.workers.is_empty() {
            return Err(StampedeError::Config(
                "distributed configuration has no workers".to_string(),
            ));
        }

        let records = distributed
            .workers
            .iter()
            .cloned()
            .map(WorkerRecord::new)
            .collect();

        Ok(Self {
            config,
            distributed,
            client: Arc::new(reqwest::Client::new()),
            workers: Arc::new(Mutex::new(records)),
            cancel: CancellationToken::new(),
        })
    }

    /// A clone of the cancel token so callers can hook signal handling.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn client_for(&self, spec: &WorkerSpec) -> WorkerClient {
        WorkerClient::new(&spec.address, Arc::clone(&self.client))
    }

    /// Connect to every worker. Failures either abort the run or drop the
    /// worker from the pool, per `retry_failed`.
    pub async fn connect(&self) -> Result<(), StampedeError> {
        let mut workers = self.workers.lock().await;
        let mut connected = Vec::new();

        for mut record in workers.drain(..) {
            match self.client_for(&record.spec).health().await {
                Ok(()) => {
                    record.health = WorkerHealth::Connected;
                    record.last_heartbeat = Some(Instant::now());
                    tracing::info!(worker = %record.spec.address, "worker connected");
                    connected.push(record);
                }
                Err(e) => {
                    if self.distributed.retry_failed {
                        tracing::warn!(
                            worker = %record.spec.address,
                            error = %e,
                            "worker unreachable; continuing without it"
                        );
                    } else {
                        return Err(e);
                    }
                }
            }
        }

        if connected.is_empty() {
            return Err(StampedeError::Config(
                "no workers could be reached".to_string(),
            ));
        }
        *workers = connected;
        Ok(())
    }

    /// Run the distributed test end to end and return the aggregate.
    pub async fn run(&self) -> Result<CombinedSummary, StampedeError> {
        self.connect().await?;

        let specs: Vec<WorkerSpec> = {
            let workers = self.workers.lock().await;
            workers.iter().map(|w| w.spec.clone()).collect()
        };
        let total = total_vus(&self.config);
        let shares = distribute(total, self.distributed.strategy, &specs);
        tracing::info!(?shares, total, "virtual users distributed");

        // Prepare (and for rolling starts, immediately start) each worker.
        let start_time = if self.distributed.synchronized {
            Some(crate::clock::epoch_ms() + SYNC_START_LEAD.as_millis() as i64)
        } else {
            None
        };

        for (i, spec) in specs.iter().enumerate() {
            let worker_config = rewrite_for_worker(&self.config, i, shares[i], total);
            let client = self.client_for(spec);
            client.prepare(&worker_config).await?;
            if !self.distributed.synchronized {
                client.start(None).await?;
            }
        }

        if self.distributed.synchronized {
            for spec in &specs {
                self.client_for(spec).start(start_time).await?;
            }
        }

        self.monitor_until_complete().await?;
        self.collect().await
    }

    /// Poll worker `/status` at the heartbeat interval until every worker
    /// reports an idle runner. Health state is observational only.
    async fn monitor_until_complete(&self) -> Result<(), StampedeError> {
        let interval = self
            .distributed
            .heartbeat_interval
            .as_ref()
            .and_then(|d| d.to_duration().ok())
            .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL);

        loop {
            if self.cancel.is_cancelled() {
                return Err(StampedeError::Cancelled);
            }
            crate::clock::sleep(interval, &self.cancel).await?;

            let mut all_done = true;
            let mut workers = self.workers.lock().await;
            for record in workers.iter_mut() {
                let started = Instant::now();
                match self.client_for(&record.spec).status().await {
                    Ok(status) => {
                        record.last_heartbeat = Some(Instant::now());
                        record.response_time_ms = started.elapsed().as_millis() as u64;
                        record.running = status.running;
                        record.active_runner = status.active_runner;
                        if record.error_count <= MAX_ERROR_COUNT {
                            record.health = WorkerHealth::Connected;
                        }
                        if !(status.active_runner && !status.running) {
                            all_done = false;
                        }
                    }
                    Err(e) => {
                        record.error_count += 1;
                        all_done = false;
                        tracing::warn!(
                            worker = %record.spec.address,
                            errors = record.error_count,
                            "heartbeat failed: {e}"
                        );
                    }
                }

                let heartbeat_age = record
                    .last_heartbeat
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if heartbeat_age > HEARTBEAT_TIMEOUT {
                    record.health = WorkerHealth::Timeout;
                } else if record.error_count > MAX_ERROR_COUNT {
                    record.health = WorkerHealth::Unhealthy;
                }
            }

            if all_done {
                return Ok(());
            }
        }
    }

    /// Pull `/results` from each worker and aggregate keyed by address.
    async fn collect(&self) -> Result<CombinedSummary, StampedeError> {
        let workers = self.workers.lock().await;
        let mut combined = CombinedSummary {
            test_name: self.config.name.clone(),
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            success_rate: 0.0,
            workers: BTreeMap::new(),
        };

        for record in workers.iter() {
            let body = self.client_for(&record.spec).results().await?;
            if let Some(summary) = body.summary {
                combined.total_requests += summary.total_requests;
                combined.successful_requests += summary.successful_requests;
                combined.failed_requests += summary.failed_requests;
                combined
                    .workers
                    .insert(record.spec.address.clone(), summary);
            }
        }

        if combined.total_requests > 0 {
            combined.success_rate =
                combined.successful_requests as f64 / combined.total_requests as f64 * 100.0;
        }
        Ok(combined)
    }

    /// Issue `/stop` to all workers concurrently and raise the local
    /// cancellation signal.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let workers = self.workers.lock().await;
        let clients: Vec<_> = workers
            .iter()
            .map(|record| self.client_for(&record.spec))
            .collect();
        let stops = clients.iter().map(|client| client.stop());
        for (record, result) in workers.iter().zip(join_all(stops).await) {
            if let Err(e) = result {
                tracing::warn!(worker = %record.spec.address, "stop failed: {e}");
            }
        }
    }

    /// Snapshot of the worker records for status display.
    pub async fn worker_records(&self) -> Vec<WorkerRecord> {
        self.workers.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn specs(n: usize) -> Vec<WorkerSpec> {
        (0..n)
            .map(|i| WorkerSpec {
                address: format!("10.0.0.{i}:8080"),
                capacity: 1,
                region: None,
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // distribute
    // -----------------------------------------------------------------------

    #[test]
    fn even_distribution_gives_remainder_to_earliest() {
        let counts = distribute(10, DistributionStrategy::Even, &specs(3));
        assert_eq!(counts, vec![4, 3, 3]);
        assert_eq!(counts.iter().sum::<u32>(), 10);
    }

    #[test]
    fn even_distribution_with_fewer_vus_than_workers() {
        let counts = distribute(2, DistributionStrategy::Even, &specs(3));
        assert_eq!(counts, vec![1, 1, 0]);
    }

    #[test]
    fn capacity_distribution_is_proportional() {
        let mut workers = specs(3);
        workers[0].capacity = 4;
        workers[1].capacity = 2;
        workers[2].capacity = 2;
        let counts = distribute(8, DistributionStrategy::CapacityBased, &workers);
        assert_eq!(counts, vec![4, 2, 2]);
    }

    #[test]
    fn capacity_distribution_sums_to_total_despite_rounding() {
        let mut workers = specs(3);
        workers[0].capacity = 3;
        workers[1].capacity = 3;
        workers[2].capacity = 3;
        let counts = distribute(10, DistributionStrategy::CapacityBased, &workers);
        assert_eq!(counts.iter().sum::<u32>(), 10);
    }

    #[test]
    fn round_robin_cycles_one_at_a_time() {
        let counts = distribute(5, DistributionStrategy::RoundRobin, &specs(3));
        assert_eq!(counts, vec![2, 2, 1]);
    }

    #[test]
    fn geographic_splits_across_then_within_regions() {
        let mut workers = specs(4);
        workers[0].region = Some("eu".to_string());
        workers[1].region = Some("eu".to_string());
        workers[2].region = Some("us".to_string());
        workers[3].region = Some("us".to_string());
        let counts = distribute(8, DistributionStrategy::Geographic, &workers);
        assert_eq!(counts, vec![2, 2, 2, 2]);

        let counts = distribute(6, DistributionStrategy::Geographic, &workers);
        assert_eq!(counts.iter().sum::<u32>(), 6);
    }

    #[test]
    fn distribute_empty_workers_is_empty() {
        assert!(distribute(10, DistributionStrategy::Even, &[]).is_empty());
    }

    // -----------------------------------------------------------------------
    // rewrite_for_worker
    // -----------------------------------------------------------------------

    fn base_config() -> TestConfiguration {
        serde_json::from_value(json!({
            "name": "dist",
            "load": {"pattern": "basic", "virtual_users": 10, "duration": "2s"},
            "scenarios": [{"name": "s", "steps": [
                {"name": "w", "type": "wait", "duration": "1ms"}
            ]}],
            "outputs": [
                {"type": "jsonl", "path": "results.jsonl"},
                {"type": "webhook", "url": "http://hook.local"}
            ],
            "report": true,
            "distributed": {"workers": [{"address": "a:1"}, {"address": "b:1"}]}
        }))
        .unwrap()
    }

    #[test]
    fn rewrite_replaces_vus_and_name() {
        let rewritten = rewrite_for_worker(&base_config(), 0, 4, 10);
        assert_eq!(rewritten.name, "dist-worker-1");
        match &rewritten.load.phases()[0] {
            LoadPhase::Basic { virtual_users, .. } => assert_eq!(*virtual_users, 4),
            other => panic!("expected basic phase, got {other:?}"),
        }
    }

    #[test]
    fn rewrite_drops_webhooks_and_disables_report() {
        let rewritten = rewrite_for_worker(&base_config(), 1, 3, 10);
        assert_eq!(rewritten.outputs.len(), 1);
        assert!(!rewritten.outputs[0].is_webhook());
        assert_eq!(rewritten.report, Some(false));
        assert!(rewritten.distributed.is_none());
    }

    #[test]
    fn rewrite_scales_arrivals_rate() {
        let mut config = base_config();
        config.load = serde_json::from_value(json!({
            "pattern": "arrivals", "rate": 10.0, "duration": "1m"
        }))
        .unwrap();
        let rewritten = rewrite_for_worker(&config, 0, 5, 10);
        match &rewritten.load.phases()[0] {
            LoadPhase::Arrivals { rate, .. } => assert!((rate - 5.0).abs() < 0.001),
            other => panic!("expected arrivals phase, got {other:?}"),
        }
    }

    #[test]
    fn total_vus_over_phase_shapes() {
        let config = base_config();
        assert_eq!(total_vus(&config), 10);

        let mut stepping = base_config();
        stepping.load = serde_json::from_value(json!({
            "pattern": "stepping",
            "steps": [{"users": 2, "duration": "1s"}, {"users": 7, "duration": "1s"}]
        }))
        .unwrap();
        assert_eq!(total_vus(&stepping), 7);
    }

    // -----------------------------------------------------------------------
    // Coordinator construction
    // -----------------------------------------------------------------------

    #[test]
    fn coordinator_requires_distributed_section() {
        let mut config = base_config();
        config.distributed = None;
        assert!(matches!(
            Coordinator::new(config),
            Err(StampedeError::Config(_))
        ));
    }

    // -----------------------------------------------------------------------
    // End-to-end against in-process workers
    // -----------------------------------------------------------------------

    async fn spawn_worker() -> String {
        let state = Arc::new(crate::worker::WorkerState::new());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let router = crate::worker::router(state);
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        address
    }

    #[tokio::test]
    async fn distributed_run_aggregates_worker_results() {
        let worker_a = spawn_worker().await;
        let worker_b = spawn_worker().await;

        let config: TestConfiguration = serde_json::from_value(json!({
            "name": "dist-e2e",
            "load": {"pattern": "basic", "virtual_users": 4},
            "scenarios": [{"name": "s", "steps": [
                {"name": "w", "type": "wait", "duration": "5ms"}
            ]}],
            "distributed": {
                "workers": [{"address": worker_a}, {"address": worker_b}],
                "strategy": "even",
                "synchronized": false,
                "heartbeat_interval": "100ms"
            }
        }))
        .unwrap();

        let coordinator = Coordinator::new(config).unwrap();
        let combined = coordinator.run().await.unwrap();

        // 4 VUs split 2/2, one result each.
        assert_eq!(combined.total_requests, 4);
        assert_eq!(combined.workers.len(), 2);
        let per_worker: u64 = combined
            .workers
            .values()
            .map(|s| s.total_requests)
            .sum();
        assert_eq!(per_worker, combined.total_requests);
        assert!((combined.success_rate - 100.0).abs() < 0.001);

        for record in coordinator.worker_records().await {
            assert_eq!(record.health, WorkerHealth::Connected);
        }
    }

    #[tokio::test]
    async fn unreachable_worker_aborts_without_retry_failed() {
        let config: TestConfiguration = serde_json::from_value(json!({
            "name": "dist-fail",
            "load": {"pattern": "basic", "virtual_users": 2},
            "scenarios": [{"name": "s", "steps": [
                {"name": "w", "type": "wait", "duration": "1ms"}
            ]}],
            "distributed": {
                "workers": [{"address": "127.0.0.1:9"}],
                "retry_failed": false
            }
        }))
        .unwrap();

        let coordinator = Coordinator::new(config).unwrap();
        let result = coordinator.connect().await;
        assert!(matches!(result, Err(StampedeError::Worker { .. })));
    }

    #[tokio::test]
    async fn retry_failed_drops_unreachable_workers() {
        let good = spawn_worker().await;
        let config: TestConfiguration = serde_json::from_value(json!({
            "name": "dist-partial",
            "load": {"pattern": "basic", "virtual_users": 2},
            "scenarios": [{"name": "s", "steps": [
                {"name": "w", "type": "wait", "duration": "1ms"}
            ]}],
            "distributed": {
                "workers": [{"address": good}, {"address": "127.0.0.1:9"}],
                "retry_failed": true
            }
        }))
        .unwrap();

        let coordinator = Coordinator::new(config).unwrap();
        coordinator.connect().await.unwrap();
        assert_eq!(coordinator.worker_records().await.len(), 1);
    }
}

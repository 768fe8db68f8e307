//! Test run orchestration: phase sequencing, the aggregation loop, the
//! progress reporter, and the output pipeline lifecycle.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

use crate::context::TestContext;
use crate::engine::EngineStatus;
use crate::error::StampedeError;
use crate::model::{validation, TestConfiguration};
use crate::output::OutputPipeline;
use crate::pattern::run_phase;
use crate::results::{TestResult, TestSummary};

/// An event emitted by the engine during test execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A single step completed.
    Result(TestResult),

    /// Periodic progress snapshot (~every 500 ms).
    Progress {
        completed_requests: u64,
        total_errors: u64,
        active_vus: u32,
        elapsed_ms: u64,
        current_rps: f64,
        mean_ms: f64,
        p95_ms: u64,
        error_rate: f64,
    },

    /// Engine lifecycle status changed.
    StatusChange { status: EngineStatus },

    /// Test run completed; final summary attached. `failed` is true when a
    /// `fail_test`/`abort` threshold or `stop_test` policy fired.
    Complete { summary: TestSummary, failed: bool },
}

/// A handle to a running test: inspect status, read live metrics, stop.
pub struct EngineHandle {
    /// Cancel to trigger a graceful stop.
    pub cancel: CancellationToken,
    pub status: Arc<RwLock<EngineStatus>>,
    /// The run's shared context (metrics, active VU count).
    pub ctx: Arc<TestContext>,
    /// Fires once the run has fully wound down.
    pub finished: CancellationToken,
}

impl EngineHandle {
    /// Wait until the run has completed and all output is flushed.
    pub async fn wait(&self) {
        self.finished.cancelled().await;
    }

    pub async fn status(&self) -> EngineStatus {
        self.status.read().await.clone()
    }
}

/// Start executing a test configuration asynchronously.
///
/// Validates first, then returns a handle immediately; the run continues
/// in background tasks and reports through `event_tx`.
pub async fn run_test(
    config: TestConfiguration,
    event_tx: mpsc::Sender<EngineEvent>,
) -> Result<EngineHandle, StampedeError> {
    let errors = validation::validate(&config);
    if !errors.is_empty() {
        let joined = errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        return Err(StampedeError::Validation(joined));
    }

    let (result_tx, result_rx) = mpsc::channel::<TestResult>(4096);
    let ctx = Arc::new(TestContext::new(config, result_tx)?);
    let status = Arc::new(RwLock::new(EngineStatus::Running));
    let finished = CancellationToken::new();

    let _ = event_tx
        .send(EngineEvent::StatusChange {
            status: EngineStatus::Running,
        })
        .await;

    // Aggregation loop: drains results into metrics and the output
    // pipeline. Stops when told the phases are done and the channel is dry.
    let drain_done = CancellationToken::new();
    let aggregation = tokio::spawn(aggregate(
        Arc::clone(&ctx),
        result_rx,
        event_tx.clone(),
        drain_done.clone(),
    ));

    // Progress reporter.
    let progress = tokio::spawn(report_progress(
        Arc::clone(&ctx),
        event_tx.clone(),
        finished.clone(),
    ));

    // Orchestrator: phases in order, then wind-down.
    {
        let ctx = Arc::clone(&ctx);
        let status = Arc::clone(&status);
        let finished = finished.clone();
        tokio::spawn(async move {
            let phases = ctx.config.load.phases();
            for (i, phase) in phases.iter().enumerate() {
                if ctx.cancel.is_cancelled() {
                    break;
                }
                tracing::info!(phase = i, "load phase starting");
                if let Err(e) = run_phase(Arc::clone(&ctx), phase).await {
                    tracing::error!(phase = i, error = %e, "load phase failed");
                    ctx.fail_test(false);
                    break;
                }
            }

            {
                let mut s = status.write().await;
                *s = EngineStatus::Stopping;
            }

            // All VUs are done; let the aggregation loop drain and flush.
            drain_done.cancel();
            let _ = aggregation.await;
            progress.abort();

            let summary = ctx.summary();
            {
                let mut s = status.write().await;
                *s = if ctx.run_failed() {
                    EngineStatus::Error
                } else {
                    EngineStatus::Completed
                };
            }
            let _ = event_tx
                .send(EngineEvent::StatusChange {
                    status: status.read().await.clone(),
                })
                .await;
            let _ = event_tx
                .send(EngineEvent::Complete {
                    summary,
                    failed: ctx.run_failed(),
                })
                .await;
            finished.cancel();
        });
    }

    Ok(EngineHandle {
        cancel: ctx.cancel.clone(),
        status,
        ctx,
        finished,
    })
}

/// Drain the result channel into metrics, events, and outputs. After
/// `done` fires, whatever is still buffered in the channel is consumed,
/// then the output pipeline is finalised.
async fn aggregate(
    ctx: Arc<TestContext>,
    mut result_rx: mpsc::Receiver<TestResult>,
    event_tx: mpsc::Sender<EngineEvent>,
    done: CancellationToken,
) {
    let mut outputs = OutputPipeline::new(
        &ctx.config.outputs,
        Arc::clone(&ctx.http),
        &ctx.config.name,
    );
    let has_outputs = !outputs.is_empty();
    let mut flush_ticker = interval(Duration::from_millis(
        crate::output::batch::DEFAULT_FLUSH_INTERVAL_MS,
    ));
    flush_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            maybe_result = result_rx.recv() => {
                match maybe_result {
                    Some(result) => {
                        ctx.metrics.record(&result);
                        if has_outputs && result.should_record {
                            outputs.submit(result.clone()).await;
                        }
                        let _ = event_tx.send(EngineEvent::Result(result)).await;
                    }
                    None => break,
                }
            }
            _ = flush_ticker.tick() => {
                if has_outputs {
                    outputs.tick().await;
                }
            }
            _ = done.cancelled() => {
                // Phases are over; consume the residue without waiting.
                while let Ok(result) = result_rx.try_recv() {
                    ctx.metrics.record(&result);
                    if has_outputs && result.should_record {
                        outputs.submit(result.clone()).await;
                    }
                    let _ = event_tx.send(EngineEvent::Result(result)).await;
                }
                break;
            }
        }
    }

    let summary = ctx.summary();
    outputs.finalize(&summary).await;
}

async fn report_progress(
    ctx: Arc<TestContext>,
    event_tx: mpsc::Sender<EngineEvent>,
    finished: CancellationToken,
) {
    let mut ticker = interval(Duration::from_millis(500));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snap = ctx.metrics.snapshot();
                let _ = event_tx
                    .send(EngineEvent::Progress {
                        completed_requests: snap.total,
                        total_errors: snap.errors,
                        active_vus: ctx.active_vus(),
                        elapsed_ms: snap.elapsed_ms,
                        current_rps: snap.rps,
                        mean_ms: snap.mean_ms,
                        p95_ms: snap.p95_ms,
                        error_rate: snap.error_rate,
                    })
                    .await;
            }
            _ = finished.cancelled() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_config(value: serde_json::Value) -> TestConfiguration {
        serde_json::from_value(value).unwrap()
    }

    async fn collect_until_complete(
        rx: &mut mpsc::Receiver<EngineEvent>,
    ) -> (Vec<TestResult>, Option<TestSummary>, bool) {
        let mut results = Vec::new();
        let mut summary = None;
        let mut failed = false;
        while let Some(event) = rx.recv().await {
            match event {
                EngineEvent::Result(r) => results.push(r),
                EngineEvent::Complete { summary: s, failed: f } => {
                    summary = Some(s);
                    failed = f;
                    break;
                }
                _ => {}
            }
        }
        (results, summary, failed)
    }

    #[tokio::test]
    async fn invalid_configuration_is_rejected_before_execution() {
        let config = make_config(json!({
            "name": "bad",
            "load": {"pattern": "arrivals", "rate": 0.0, "duration": "1s"},
            "scenarios": [{"name": "s", "steps": [
                {"name": "w", "type": "wait", "duration": "1ms"}
            ]}]
        }));
        let (tx, _rx) = mpsc::channel(16);
        let result = run_test(config, tx).await;
        assert!(matches!(result, Err(StampedeError::Validation(_))));
    }

    #[tokio::test]
    async fn basic_run_completes_with_summary() {
        let config = make_config(json!({
            "name": "smoke",
            "load": {"pattern": "basic", "virtual_users": 3},
            "scenarios": [{"name": "ping", "steps": [
                {"name": "w", "type": "wait", "duration": "5ms"}
            ]}]
        }));
        let (tx, mut rx) = mpsc::channel(512);
        let handle = run_test(config, tx).await.unwrap();

        let (results, summary, failed) = collect_until_complete(&mut rx).await;
        handle.wait().await;

        assert!(!failed);
        assert_eq!(results.len(), 3);
        let summary = summary.unwrap();
        assert_eq!(summary.total_requests, 3);
        assert_eq!(summary.vu_ramp_up.len(), 3);
        assert!((summary.success_rate - 100.0).abs() < 0.001);
        assert_eq!(handle.status().await, EngineStatus::Completed);
    }

    #[tokio::test]
    async fn sequential_phases_produce_disjoint_vu_id_ranges() {
        let config = make_config(json!({
            "name": "phases",
            "load": [
                {"pattern": "basic", "virtual_users": 2},
                {"pattern": "basic", "virtual_users": 2}
            ],
            "scenarios": [{"name": "s", "steps": [
                {"name": "w", "type": "wait", "duration": "1ms"}
            ]}]
        }));
        let (tx, mut rx) = mpsc::channel(512);
        let handle = run_test(config, tx).await.unwrap();
        let (results, _, _) = collect_until_complete(&mut rx).await;
        handle.wait().await;

        let ids: std::collections::HashSet<u64> = results.iter().map(|r| r.vu_id).collect();
        assert_eq!(ids.len(), 4, "every VU across phases has a distinct id");
    }

    #[tokio::test]
    async fn failing_threshold_marks_the_run_failed() {
        let config = make_config(json!({
            "name": "fail",
            "load": {"pattern": "basic", "virtual_users": 1},
            "scenarios": [{"name": "s", "steps": [
                {"name": "w", "type": "wait", "duration": "20ms",
                 "thresholds": [
                    {"metric": "response_time", "operator": "<", "value": 1,
                     "action": "fail_test"}
                 ]}
            ]}]
        }));
        let (tx, mut rx) = mpsc::channel(512);
        let handle = run_test(config, tx).await.unwrap();
        let (_, _, failed) = collect_until_complete(&mut rx).await;
        handle.wait().await;

        assert!(failed);
        assert_eq!(handle.status().await, EngineStatus::Error);
    }

    #[tokio::test]
    async fn stop_via_handle_winds_the_run_down() {
        let config = make_config(json!({
            "name": "stop",
            "load": {"pattern": "basic", "virtual_users": 2, "duration": "30s"},
            "scenarios": [{"name": "s", "steps": [
                {"name": "w", "type": "wait", "duration": "10ms"}
            ]}]
        }));
        let (tx, mut rx) = mpsc::channel(4096);
        let handle = run_test(config, tx).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel.cancel();
        let (_, summary, _) = collect_until_complete(&mut rx).await;
        handle.wait().await;

        assert!(summary.is_some());
        assert_eq!(handle.ctx.active_vus(), 0);
    }

    #[tokio::test]
    async fn extracted_value_feeds_the_next_steps_template() {
        use wiremock::matchers::{header, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"token": "T-42"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/me"))
            .and(header("authorization", "Bearer T-42"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let config = make_config(json!({
            "name": "extract-chain",
            "load": {"pattern": "basic", "virtual_users": 1},
            "scenarios": [{"name": "auth", "steps": [
                {
                    "name": "login", "type": "rest", "method": "POST",
                    "url": format!("{}/login", server.uri()),
                    "extract": [{"name": "token", "type": "json_path",
                                 "expression": "$.token"}]
                },
                {
                    "name": "me", "type": "rest",
                    "url": format!("{}/me", server.uri()),
                    "headers": {"Authorization": "Bearer {{token}}"},
                    "checks": [{"type": "status", "expected": 200}]
                }
            ]}]
        }));
        let (tx, mut rx) = mpsc::channel(512);
        let handle = run_test(config, tx).await.unwrap();
        let (results, _, failed) = collect_until_complete(&mut rx).await;
        handle.wait().await;

        assert!(!failed);
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.success), "results: {results:?}");
    }

    #[tokio::test]
    async fn rendezvous_releases_all_vus_together() {
        let config = make_config(json!({
            "name": "rendezvous",
            "load": {"pattern": "basic", "virtual_users": 3},
            "scenarios": [{"name": "sync", "steps": [
                {"name": "gate", "type": "rendezvous", "rendezvous": "go",
                 "count": 3, "timeout": "5s"},
                {"name": "after", "type": "wait", "duration": "1ms"}
            ]}]
        }));
        let (tx, mut rx) = mpsc::channel(512);
        let handle = run_test(config, tx).await.unwrap();
        let (results, _, _) = collect_until_complete(&mut rx).await;
        handle.wait().await;

        let gates: Vec<_> = results.iter().filter(|r| r.step_name == "gate").collect();
        assert_eq!(gates.len(), 3);
        for gate in &gates {
            assert!(gate.success);
            assert_eq!(gate.custom_metrics["rendezvous_vu_count"], json!(3));
        }

        // Released together: the post-gate steps start close to each other.
        let afters: Vec<i64> = results
            .iter()
            .filter(|r| r.step_name == "after")
            .map(|r| r.timestamp)
            .collect();
        assert_eq!(afters.len(), 3);
        let spread = afters.iter().max().unwrap() - afters.iter().min().unwrap();
        assert!(spread <= 50, "post-rendezvous spread was {spread} ms");
    }

    #[tokio::test]
    async fn results_flow_into_configured_jsonl_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.jsonl");
        let config = make_config(json!({
            "name": "out",
            "load": {"pattern": "basic", "virtual_users": 2},
            "scenarios": [{"name": "s", "steps": [
                {"name": "w", "type": "wait", "duration": "1ms"}
            ]}],
            "outputs": [{"type": "jsonl", "path": path.to_string_lossy()}]
        }));
        let (tx, mut rx) = mpsc::channel(512);
        let handle = run_test(config, tx).await.unwrap();
        collect_until_complete(&mut rx).await;
        handle.wait().await;

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}

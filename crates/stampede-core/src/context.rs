//! Per-test and per-VU context objects.
//!
//! The test context owns every shared registry (data providers, rendezvous
//! barriers, template processor, metrics) so component lifecycles are
//! bounded by the run — there are no process-wide singletons.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::data::{DataProviderRegistry, DataRow};
use crate::error::StampedeError;
use crate::handler::HandlerRegistry;
use crate::metrics::Metrics;
use crate::model::TestConfiguration;
use crate::rendezvous::RendezvousManager;
use crate::results::TestResult;
use crate::template::TemplateProcessor;

// ---------------------------------------------------------------------------
// TestContext
// ---------------------------------------------------------------------------

/// Shared state of one test run, passed to every component by `Arc`.
pub struct TestContext {
    pub config: Arc<TestConfiguration>,
    /// The run's single cancellation signal.
    pub cancel: CancellationToken,
    pub template: TemplateProcessor,
    pub data: DataProviderRegistry,
    pub rendezvous: RendezvousManager,
    pub metrics: Arc<Metrics>,
    pub handlers: HandlerRegistry,
    /// Shared HTTP connection pool for all VUs.
    pub http: Arc<reqwest::Client>,
    result_tx: mpsc::Sender<TestResult>,
    vu_counter: AtomicU64,
    active_vus: AtomicU32,
    run_failed: AtomicBool,
    abort_requested: AtomicBool,
}

impl TestContext {
    pub fn new(
        config: TestConfiguration,
        result_tx: mpsc::Sender<TestResult>,
    ) -> Result<Self, StampedeError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(100)
            .pool_idle_timeout(Duration::from_secs(90))
            .user_agent(format!("stampede/{}", env!("CARGO_PKG_VERSION")))
            .gzip(true)
            .brotli(true)
            .build()
            .map_err(|e| StampedeError::Engine(format!("failed to build HTTP client: {e}")))?;
        let http = Arc::new(http);

        let template =
            TemplateProcessor::new(config.global.seed, config.global.locale.clone());

        Ok(Self {
            config: Arc::new(config),
            cancel: CancellationToken::new(),
            template,
            data: DataProviderRegistry::new(),
            rendezvous: RendezvousManager::new(),
            metrics: Arc::new(Metrics::new()),
            handlers: HandlerRegistry::new(Arc::clone(&http)),
            http,
            result_tx,
            vu_counter: AtomicU64::new(0),
            active_vus: AtomicU32::new(0),
            run_failed: AtomicBool::new(false),
            abort_requested: AtomicBool::new(false),
        })
    }

    /// Allocate the next VU id. Phases draw from the same counter, so their
    /// id ranges are disjoint.
    pub fn next_vu_id(&self) -> u64 {
        self.vu_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn vu_started(&self) {
        self.active_vus.fetch_add(1, Ordering::Relaxed);
    }

    pub fn vu_finished(&self) {
        self.active_vus.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active_vus(&self) -> u32 {
        self.active_vus.load(Ordering::Relaxed)
    }

    /// Emit a result into the pipeline. Returns false when the receiver is
    /// gone and the VU should stop producing.
    pub async fn emit(&self, result: TestResult) -> bool {
        self.result_tx.send(result).await.is_ok()
    }

    /// Raise the global cancellation signal and mark the run failed.
    /// `abort` additionally tells load patterns not to await stragglers.
    pub fn fail_test(&self, abort: bool) {
        self.run_failed.store(true, Ordering::Relaxed);
        if abort {
            self.abort_requested.store(true, Ordering::Relaxed);
        }
        self.cancel.cancel();
    }

    pub fn run_failed(&self) -> bool {
        self.run_failed.load(Ordering::Relaxed)
    }

    /// Build the run summary with the configured percentile set and
    /// timeline bucket width.
    pub fn summary(&self) -> crate::results::TestSummary {
        let percentiles = self
            .config
            .global
            .percentiles
            .clone()
            .unwrap_or_else(|| crate::metrics::DEFAULT_PERCENTILES.to_vec());
        let bucket_ms = self
            .config
            .global
            .timeline_interval
            .as_ref()
            .and_then(|d| d.to_duration().ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(crate::metrics::DEFAULT_BUCKET_MS);
        self.metrics
            .summary_with(&self.config.name, &percentiles, bucket_ms)
    }

    pub fn abort_requested(&self) -> bool {
        self.abort_requested.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// VuContext
// ---------------------------------------------------------------------------

/// Per-VU mutable state. Created at VU start, mutated only from the VU's
/// own task, destroyed at VU completion.
pub struct VuContext {
    pub vu_id: u64,
    pub iteration: u64,
    pub variables: HashMap<String, Value>,
    pub extracted_data: HashMap<String, Value>,
    pub csv_row: Option<DataRow>,
    pub started: Instant,
    /// Errors seen in the current scenario loop (drives `max_errors`).
    pub loop_errors: u32,
}

impl VuContext {
    pub fn new(vu_id: u64, globals: &HashMap<String, Value>) -> Self {
        Self {
            vu_id,
            iteration: 0,
            variables: globals.clone(),
            extracted_data: HashMap::new(),
            csv_row: None,
            started: Instant::now(),
            loop_errors: 0,
        }
    }

    /// Resolve a template/expression identifier against this VU's state.
    ///
    /// Supported forms: `__VU`, `__ITER`, `variables.<path>`,
    /// `extracted_data.<path>`, and bare names searched through extracted
    /// data, variables, then the bound CSV row.
    pub fn resolve(&self, name: &str) -> Option<Value> {
        match name {
            "__VU" => return Some(Value::Number(self.vu_id.into())),
            "__ITER" => return Some(Value::Number(self.iteration.into())),
            _ => {}
        }

        if let Some(path) = name.strip_prefix("variables.") {
            return crate::script::lookup_path(&self.variables, path);
        }
        if let Some(path) = name.strip_prefix("extracted_data.") {
            return crate::script::lookup_path(&self.extracted_data, path);
        }

        crate::script::lookup_path(&self.extracted_data, name)
            .or_else(|| crate::script::lookup_path(&self.variables, name))
            .or_else(|| {
                self.csv_row
                    .as_ref()
                    .and_then(|row| row.values.get(name).cloned())
            })
    }

    /// Merge a dispensed data row into scope. The row stays addressable both
    /// by bare column name and through the row binding itself.
    pub fn bind_row(&mut self, row: DataRow) {
        self.csv_row = Some(row);
    }
}

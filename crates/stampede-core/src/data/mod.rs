//! Shared data provider — hands out rows from tabular data files under
//! scope, order, exhaustion, and change policies.
//!
//! One provider instance exists per `(absolute file path, config)` pair and
//! serialises all state changes behind a single async mutex. Blocked
//! `acquire` calls under the `unique` scope park on a `Notify` and are woken
//! by `release`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde_json::Value;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::error::StampedeError;
use crate::model::{ChangePolicy, DataConfig, DataOrder, DataScope, ExhaustedPolicy};

// ---------------------------------------------------------------------------
// DataRow / Dispense
// ---------------------------------------------------------------------------

/// One dispensed row: typed cell values keyed by (possibly renamed) column.
#[derive(Debug, Clone, PartialEq)]
pub struct DataRow {
    /// Index into the provider's row table; used by `release`.
    pub index: usize,
    pub values: BTreeMap<String, Value>,
}

impl DataRow {
    /// The row's values under their variable names — the alias map merged
    /// into VU variables on dispense.
    pub fn variables(&self) -> &BTreeMap<String, Value> {
        &self.values
    }
}

/// Outcome of a dispense operation. Exhaustion is an explicit sentinel, not
/// an error: the VU and load pattern branch on the tag.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispense {
    Row(DataRow),
    /// `no_value` policy (or an empty file): continue without a row.
    Absent,
    /// `stop_vu` policy: the requesting VU should terminate cleanly.
    StopVu,
    /// `stop_test` policy: the caller should raise the test's cancel signal.
    StopTest,
}

// ---------------------------------------------------------------------------
// Provider state
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ProviderState {
    loaded: bool,
    rows: Vec<BTreeMap<String, Value>>,
    global_cursor: usize,
    local_cursors: HashMap<u64, usize>,
    /// Row indices currently dispensed under `unique` scope.
    locked: HashSet<usize>,
    /// Cached row per VU for `each_iteration` / `each_vu` change policies.
    cached: HashMap<u64, (u64, DataRow)>,
    rng: Option<StdRng>,
}

/// A shared dispenser of tabular rows. Create through
/// [`DataProviderRegistry::provider`] so instances are shared per
/// `(path, config)` key.
pub struct DataProvider {
    config: DataConfig,
    state: Mutex<ProviderState>,
    released: Notify,
}

impl DataProvider {
    pub fn new(config: DataConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ProviderState::default()),
            released: Notify::new(),
        }
    }

    pub fn config(&self) -> &DataConfig {
        &self.config
    }

    /// Fetch the next row for `vu_id` under the configured policies.
    /// `iteration` drives the `each_iteration` change policy.
    ///
    /// Under `scope = unique` this is equivalent to [`Self::acquire_unique`].
    pub async fn next(
        &self,
        vu_id: u64,
        iteration: u64,
        cancel: &CancellationToken,
    ) -> Result<Dispense, StampedeError> {
        if self.config.scope == DataScope::Unique {
            return self.acquire_unique(vu_id, iteration, cancel).await;
        }

        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;

        if state.rows.is_empty() {
            return Ok(self.empty_outcome());
        }

        if let Some(row) = cached_row(&state, &self.config, vu_id, iteration) {
            return Ok(Dispense::Row(row));
        }

        let len = state.rows.len();
        let local = self.config.scope == DataScope::Local;
        let cursor = if local {
            *state.local_cursors.entry(vu_id).or_insert(0)
        } else {
            // `any` relaxes ordering but still shares the global cursor.
            state.global_cursor
        };

        let index = if cursor >= len {
            match self.config.on_exhausted {
                ExhaustedPolicy::Cycle => {
                    if self.config.order == DataOrder::Random {
                        reshuffle(&mut state);
                    }
                    0
                }
                ExhaustedPolicy::StopVu => return Ok(Dispense::StopVu),
                ExhaustedPolicy::StopTest => return Ok(Dispense::StopTest),
                ExhaustedPolicy::NoValue => return Ok(Dispense::Absent),
            }
        } else {
            cursor
        };

        if local {
            state.local_cursors.insert(vu_id, index + 1);
        } else {
            state.global_cursor = index + 1;
        }

        let row = self.materialise(&state, index);
        remember_row(&mut state, &self.config, vu_id, iteration, &row);
        Ok(Dispense::Row(row))
    }

    /// Acquire a globally exclusive row. The row stays locked until the
    /// acquiring VU calls [`Self::release`], after which it re-enters the
    /// free pool. When the pool is empty under the `cycle` policy the call
    /// parks until a release instead of busy-waiting.
    pub async fn acquire_unique(
        &self,
        vu_id: u64,
        iteration: u64,
        cancel: &CancellationToken,
    ) -> Result<Dispense, StampedeError> {
        loop {
            {
                let mut state = self.state.lock().await;
                self.ensure_loaded(&mut state).await?;

                if state.rows.is_empty() {
                    return Ok(self.empty_outcome());
                }

                if let Some(row) = cached_row(&state, &self.config, vu_id, iteration) {
                    return Ok(Dispense::Row(row));
                }

                if let Some(index) = self.pick_free(&mut state) {
                    state.locked.insert(index);
                    let row = self.materialise(&state, index);
                    remember_row(&mut state, &self.config, vu_id, iteration, &row);
                    return Ok(Dispense::Row(row));
                }

                match self.config.on_exhausted {
                    ExhaustedPolicy::Cycle => {} // fall through and park
                    ExhaustedPolicy::StopVu => return Ok(Dispense::StopVu),
                    ExhaustedPolicy::StopTest => return Ok(Dispense::StopTest),
                    ExhaustedPolicy::NoValue => return Ok(Dispense::Absent),
                }
            }

            // Pool empty under `cycle`: wait for a release. `notify_one`
            // stores a permit, so a release between unlock and await is
            // not lost.
            tokio::select! {
                _ = self.released.notified() => {}
                _ = cancel.cancelled() => return Err(StampedeError::Cancelled),
            }
        }
    }

    /// Return a previously acquired unique row to the free pool and wake one
    /// parked `acquire_unique` call. Also clears the VU's cached row so the
    /// next iteration draws a fresh one.
    pub async fn release(&self, vu_id: u64, row: &DataRow) {
        let mut state = self.state.lock().await;
        state.locked.remove(&row.index);
        state.cached.remove(&vu_id);
        self.released.notify_one();
    }

    /// Reset all cursors, locks, and caches. Rows stay loaded; a random
    /// order is reshuffled.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.global_cursor = 0;
        state.local_cursors.clear();
        state.locked.clear();
        state.cached.clear();
        if state.loaded && self.config.order == DataOrder::Random {
            reshuffle(&mut state);
        }
    }

    /// Number of rows after filtering. Loads the file on first use.
    pub async fn row_count(&self) -> Result<usize, StampedeError> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        Ok(state.rows.len())
    }

    // -- internal ---------------------------------------------------------

    fn empty_outcome(&self) -> Dispense {
        match self.config.on_exhausted {
            ExhaustedPolicy::StopVu => Dispense::StopVu,
            ExhaustedPolicy::StopTest => Dispense::StopTest,
            // There is nothing to cycle through in an empty file.
            ExhaustedPolicy::Cycle | ExhaustedPolicy::NoValue => Dispense::Absent,
        }
    }

    fn pick_free(&self, state: &mut ProviderState) -> Option<usize> {
        let free: Vec<usize> = (0..state.rows.len())
            .filter(|i| !state.locked.contains(i))
            .collect();
        if free.is_empty() {
            return None;
        }
        match self.config.order {
            DataOrder::Sequential | DataOrder::Any => Some(free[0]),
            DataOrder::Random => {
                let rng = state.rng.get_or_insert_with(StdRng::from_entropy);
                Some(free[rng.gen_range(0..free.len())])
            }
        }
    }

    fn materialise(&self, state: &ProviderState, index: usize) -> DataRow {
        let mut values = BTreeMap::new();
        for (col, value) in &state.rows[index] {
            // Column-to-variable renaming happens on dispense, not on load.
            let name = self
                .config
                .rename
                .get(col)
                .cloned()
                .unwrap_or_else(|| col.clone());
            values.insert(name, value.clone());
        }
        DataRow { index, values }
    }

    async fn ensure_loaded(&self, state: &mut ProviderState) -> Result<(), StampedeError> {
        if state.loaded {
            return Ok(());
        }

        let content = tokio::fs::read_to_string(&self.config.path)
            .await
            .map_err(|e| {
                StampedeError::Data(format!(
                    "failed to read data file \"{}\": {e}",
                    self.config.path
                ))
            })?;

        let mut rows = parse_table(&content, &self.config)?;

        if self.config.shuffle || self.config.order == DataOrder::Random {
            let mut rng = StdRng::from_entropy();
            rows.shuffle(&mut rng);
            state.rng = Some(rng);
        }

        state.rows = rows;
        state.loaded = true;
        tracing::debug!(
            path = %self.config.path,
            rows = state.rows.len(),
            "data file loaded"
        );
        Ok(())
    }
}

fn cached_row(
    state: &ProviderState,
    config: &DataConfig,
    vu_id: u64,
    iteration: u64,
) -> Option<DataRow> {
    if config.change == ChangePolicy::EachUse {
        return None;
    }
    let (cached_iter, row) = state.cached.get(&vu_id)?;
    match config.change {
        ChangePolicy::EachVu => Some(row.clone()),
        ChangePolicy::EachIteration if *cached_iter == iteration => Some(row.clone()),
        _ => None,
    }
}

fn remember_row(
    state: &mut ProviderState,
    config: &DataConfig,
    vu_id: u64,
    iteration: u64,
    row: &DataRow,
) {
    if config.change != ChangePolicy::EachUse {
        state.cached.insert(vu_id, (iteration, row.clone()));
    }
}

fn reshuffle(state: &mut ProviderState) {
    let rng = state.rng.get_or_insert_with(StdRng::from_entropy);
    state.rows.shuffle(rng);
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse CSV content into typed rows, applying header handling, the column
/// filter, and the row filter expression.
fn parse_table(
    content: &str,
    config: &DataConfig,
) -> Result<Vec<BTreeMap<String, Value>>, StampedeError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(config.delimiter as u8)
        .has_headers(config.has_header)
        .flexible(true)
        .from_reader(content.as_bytes());

    let headers: Vec<String> = if config.has_header {
        reader
            .headers()
            .map_err(|e| StampedeError::Data(format!("failed to read CSV headers: {e}")))?
            .iter()
            .map(|h| h.trim().to_string())
            .collect()
    } else {
        Vec::new()
    };

    let filter = config
        .filter
        .as_deref()
        .map(RowFilter::parse)
        .transpose()?;

    let mut rows = Vec::new();
    for record in reader.records() {
        let record =
            record.map_err(|e| StampedeError::Data(format!("failed to read CSV row: {e}")))?;

        let mut row = BTreeMap::new();
        for (i, cell) in record.iter().enumerate() {
            let name = headers
                .get(i)
                .cloned()
                .unwrap_or_else(|| format!("column_{i}"));
            if !config.columns.is_empty() && !config.columns.contains(&name) {
                continue;
            }
            row.insert(name, typed_cell(cell.trim()));
        }

        if let Some(filter) = &filter {
            if !filter.matches(&row) {
                continue;
            }
        }
        rows.push(row);
    }

    Ok(rows)
}

/// Parse a cell into bool, integer, float, or string.
fn typed_cell(cell: &str) -> Value {
    match cell {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(n) = cell.parse::<i64>() {
        return Value::Number(serde_json::Number::from(n));
    }
    if let Ok(f) = cell.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    Value::String(cell.to_string())
}

/// A parsed `col OP value` row filter.
struct RowFilter {
    column: String,
    op: FilterOp,
    value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum FilterOp {
    Eq,
    Neq,
    Gt,
    Lt,
    Gte,
    Lte,
}

impl RowFilter {
    fn parse(input: &str) -> Result<Self, StampedeError> {
        // Two-character operators must be tried first.
        const OPS: &[(&str, FilterOp)] = &[
            ("!=", FilterOp::Neq),
            (">=", FilterOp::Gte),
            ("<=", FilterOp::Lte),
            ("=", FilterOp::Eq),
            (">", FilterOp::Gt),
            ("<", FilterOp::Lt),
        ];
        for (symbol, op) in OPS {
            if let Some(pos) = input.find(symbol) {
                let column = input[..pos].trim();
                let raw = input[pos + symbol.len()..].trim();
                if column.is_empty() || raw.is_empty() {
                    break;
                }
                return Ok(Self {
                    column: column.to_string(),
                    op: *op,
                    value: typed_cell(raw.trim_matches(|c| c == '\'' || c == '"')),
                });
            }
        }
        Err(StampedeError::Data(format!(
            "invalid row filter \"{input}\" (expected: col OP value)"
        )))
    }

    fn matches(&self, row: &BTreeMap<String, Value>) -> bool {
        let Some(actual) = row.get(&self.column) else {
            return false;
        };

        let numeric = match (as_f64(actual), as_f64(&self.value)) {
            (Some(a), Some(b)) => Some((a, b)),
            _ => None,
        };

        match self.op {
            FilterOp::Eq => match numeric {
                Some((a, b)) => a == b,
                None => actual == &self.value,
            },
            FilterOp::Neq => match numeric {
                Some((a, b)) => a != b,
                None => actual != &self.value,
            },
            FilterOp::Gt => numeric.map(|(a, b)| a > b).unwrap_or(false),
            FilterOp::Lt => numeric.map(|(a, b)| a < b).unwrap_or(false),
            FilterOp::Gte => numeric.map(|(a, b)| a >= b).unwrap_or(false),
            FilterOp::Lte => numeric.map(|(a, b)| a <= b).unwrap_or(false),
        }
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Per-test registry of data providers keyed by `(absolute path, config)`.
/// Owned by the test context — no process-wide singletons.
#[derive(Default)]
pub struct DataProviderRegistry {
    providers: std::sync::Mutex<HashMap<(String, DataConfig), Arc<DataProvider>>>,
}

impl DataProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch or create the provider for this configuration. Two bindings
    /// with the same file and config share one instance (and its cursors).
    pub fn provider(&self, config: &DataConfig) -> Arc<DataProvider> {
        let abs_path = Path::new(&config.path)
            .canonicalize()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| config.path.clone());
        let key = (abs_path, config.clone());

        let mut providers = self.providers.lock().expect("data registry poisoned");
        providers
            .entry(key)
            .or_insert_with(|| Arc::new(DataProvider::new(config.clone())))
            .clone()
    }
}

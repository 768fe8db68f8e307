pub mod io;
pub mod validation;

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::parse_duration;
use crate::error::StampedeError;

// ---------------------------------------------------------------------------
// DurationValue
// ---------------------------------------------------------------------------

/// A duration as written in configuration files: either a bare number
/// (seconds) or a string with a unit suffix (`"250ms"`, `"30s"`, `"5m"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DurationValue {
    Number(f64),
    Text(String),
}

impl DurationValue {
    pub fn to_duration(&self) -> Result<Duration, StampedeError> {
        match self {
            DurationValue::Number(secs) => {
                if *secs < 0.0 {
                    return Err(StampedeError::Config(format!(
                        "duration must not be negative: {secs}"
                    )));
                }
                Ok(Duration::from_millis((secs * 1000.0).round() as u64))
            }
            DurationValue::Text(s) => parse_duration(s),
        }
    }
}

impl From<&str> for DurationValue {
    fn from(s: &str) -> Self {
        DurationValue::Text(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// HttpMethod
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Checks
// ---------------------------------------------------------------------------

/// Accepted forms for a response-time check: a bare millisecond bound or a
/// `"<500ms"` / `">10ms"` shorthand string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseTimeBound {
    Millis(u64),
    Shorthand(String),
}

/// An assertion evaluated against a step's result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Check {
    /// The HTTP status must equal `expected`.
    Status { expected: u16 },
    /// The response time must satisfy the bound.
    ResponseTime { value: ResponseTimeBound },
    /// A JSONPath expression over the response body must equal `expected`
    /// (or merely resolve, when `expected` is absent).
    JsonPath {
        expression: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected: Option<serde_json::Value>,
    },
    /// The response body must contain the given substring.
    TextContains { text: String },
    /// A custom expression evaluated with the step result in scope.
    Custom { expression: String },
}

// ---------------------------------------------------------------------------
// Extracts
// ---------------------------------------------------------------------------

/// How a value is pulled out of a step result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExtractRule {
    JsonPath { expression: String },
    Regex {
        pattern: String,
        #[serde(default = "default_group")]
        group: u32,
    },
    Header { header: String },
    Custom { expression: String },
}

fn default_group() -> u32 {
    1
}

/// A rule that captures a value from a result into `extracted_data[name]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Extract {
    pub name: String,
    #[serde(flatten)]
    pub rule: ExtractRule,
    /// Fallback value used when the rule does not match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThresholdOperator {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Neq,
}

impl std::fmt::Display for ThresholdOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ThresholdOperator::Gt => ">",
            ThresholdOperator::Gte => ">=",
            ThresholdOperator::Lt => "<",
            ThresholdOperator::Lte => "<=",
            ThresholdOperator::Eq => "=",
            ThresholdOperator::Neq => "!=",
        };
        write!(f, "{s}")
    }
}

impl ThresholdOperator {
    pub fn compare(&self, lhs: f64, rhs: f64) -> bool {
        match self {
            ThresholdOperator::Gt => lhs > rhs,
            ThresholdOperator::Gte => lhs >= rhs,
            ThresholdOperator::Lt => lhs < rhs,
            ThresholdOperator::Lte => lhs <= rhs,
            ThresholdOperator::Eq => (lhs - rhs).abs() < f64::EPSILON,
            ThresholdOperator::Neq => (lhs - rhs).abs() >= f64::EPSILON,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdAction {
    #[default]
    Log,
    FailStep,
    FailScenario,
    FailTest,
    Abort,
}

/// A post-step rule over an observed metric. `fail_*` and `abort` actions
/// raise a typed violation that propagates to the VU and load pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Threshold {
    pub metric: String,
    pub operator: ThresholdOperator,
    pub value: f64,
    #[serde(default)]
    pub action: ThresholdAction,
}

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

/// Hook scripts attached to a step. Each hook is a script in the embedded
/// expression language (`set name = expr` statements separated by `;` or
/// newlines).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepHooks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_step_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teardown_step: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScenarioHooks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_scenario: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teardown_scenario: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_loop: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_loop: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestHooks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_vu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teardown_vu: Option<String>,
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<DurationValue>,
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

/// Fields shared by all step variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCommon {
    pub name: String,
    /// Predicate over the VU context; a false result skips the step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default)]
    pub hooks: StepHooks,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub thresholds: Vec<Threshold>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub think_time: Option<DurationValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checks: Vec<Check>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extract: Vec<Extract>,
    /// When false, a failed step terminates the VU's current scenario.
    #[serde(default = "default_true")]
    pub continue_on_error: bool,
}

/// How waiters are released from a rendezvous barrier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleasePolicy {
    /// Release every waiter once the target count is reached.
    #[default]
    All,
    /// Release the first `n` waiters in arrival order; the rest keep waiting.
    FirstN,
    /// Release everyone at timeout even if the target was never reached.
    Partial,
}

/// The action payload of a step, dispatched by the `type` tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepAction {
    Rest {
        #[serde(default)]
        method: HttpMethod,
        url: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
        /// Inline JSON body.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        json: Option<serde_json::Value>,
        /// Path to a JSON file loaded as the body before templating.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        json_file: Option<String>,
        /// Templated dot-path overrides applied on top of `json`/`json_file`.
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        overrides: HashMap<String, serde_json::Value>,
        /// Raw text body; mutually exclusive with `json`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        form: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth: Option<BasicAuth>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout: Option<DurationValue>,
    },
    Soap {
        url: String,
        /// Value sent as the `SOAPAction` header.
        #[serde(default)]
        action: String,
        /// Inner XML placed inside the envelope body.
        envelope: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout: Option<DurationValue>,
    },
    /// Browser-style command forwarded to a registered opaque handler.
    Web {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
    },
    /// Arbitrary payload forwarded to a registered custom handler.
    Custom {
        handler: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
    },
    Wait { duration: DurationValue },
    /// A script in the embedded expression language mutating VU variables.
    Script { script: String },
    Rendezvous {
        rendezvous: String,
        count: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout: Option<DurationValue>,
        #[serde(default)]
        policy: ReleasePolicy,
    },
}

impl StepAction {
    /// The tag used in result records and handler dispatch.
    pub fn kind(&self) -> &'static str {
        match self {
            StepAction::Rest { .. } => "rest",
            StepAction::Soap { .. } => "soap",
            StepAction::Web { .. } => "web",
            StepAction::Custom { .. } => "custom",
            StepAction::Wait { .. } => "wait",
            StepAction::Script { .. } => "script",
            StepAction::Rendezvous { .. } => "rendezvous",
        }
    }
}

/// An immutable declarative action executed by a virtual user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    #[serde(flatten)]
    pub common: StepCommon,
    #[serde(flatten)]
    pub action: StepAction,
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum LoopMode {
    Count { count: u64 },
    Duration { duration: DurationValue },
    /// Continue while the condition is true, evaluated before each iteration.
    While { condition: String },
    /// Continue until the condition is true, evaluated before each iteration.
    Until { condition: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    #[serde(flatten)]
    pub mode: LoopMode,
    #[serde(default)]
    pub break_on_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_errors: Option<u32>,
}

// ---------------------------------------------------------------------------
// Data provider configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataScope {
    /// Each VU keeps an independent cursor.
    #[default]
    Local,
    /// One shared cursor, round-robin across VUs.
    Global,
    /// Rows are globally exclusive until released by the acquiring VU.
    Unique,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataOrder {
    #[default]
    Sequential,
    Random,
    /// Best-effort sequential with relaxed locking.
    Any,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustedPolicy {
    /// Reset to the start (reshuffling when the order is random).
    #[default]
    Cycle,
    /// Terminate the requesting VU cleanly.
    StopVu,
    /// Abort the whole test.
    StopTest,
    /// Hand back an absent row.
    NoValue,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangePolicy {
    /// A fresh row on every access.
    #[default]
    EachUse,
    /// One row per VU iteration.
    EachIteration,
    /// One row for the VU's whole lifetime.
    EachVu,
}

/// Configuration of a tabular data file binding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataConfig {
    pub path: String,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    #[serde(default = "default_true")]
    pub has_header: bool,
    /// Keep only these columns (all when empty).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<String>,
    /// Row filter of the form `col OP value` with OP in {=, !=, >, <, >=, <=}.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(default)]
    pub shuffle: bool,
    #[serde(default)]
    pub scope: DataScope,
    #[serde(default)]
    pub order: DataOrder,
    #[serde(default)]
    pub on_exhausted: ExhaustedPolicy,
    #[serde(default)]
    pub change: ChangePolicy,
    /// Column-to-variable renames, applied on dispense.
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub rename: std::collections::BTreeMap<String, String>,
}

fn default_delimiter() -> char {
    ','
}

// ---------------------------------------------------------------------------
// Scenario
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    /// Relative weight for scenario selection (normalised by the sum).
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default, rename = "loop", skip_serializing_if = "Option::is_none")]
    pub looping: Option<LoopConfig>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub variables: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csv_data: Option<DataConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub think_time: Option<DurationValue>,
    #[serde(default)]
    pub hooks: ScenarioHooks,
}

fn default_weight() -> u32 {
    100
}

// ---------------------------------------------------------------------------
// Load phases
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadStep {
    pub users: u32,
    pub duration: DurationValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ramp_up: Option<DurationValue>,
}

/// A virtual-user creation schedule. Phases in a list run sequentially.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "pattern", rename_all = "snake_case")]
pub enum LoadPhase {
    Basic {
        #[serde(alias = "vus")]
        virtual_users: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration: Option<DurationValue>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ramp_up: Option<DurationValue>,
    },
    Stepping {
        steps: Vec<LoadStep>,
    },
    Arrivals {
        /// Target arrival rate in users per second.
        rate: f64,
        duration: DurationValue,
        /// Time over which the rate climbs linearly from zero to `rate`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ramp_up: Option<DurationValue>,
        /// Lifetime of each arriving VU; a single pass when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        vu_duration: Option<DurationValue>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LoadSection {
    Single(LoadPhase),
    Phases(Vec<LoadPhase>),
}

impl LoadSection {
    pub fn phases(&self) -> Vec<LoadPhase> {
        match self {
            LoadSection::Single(p) => vec![p.clone()],
            LoadSection::Phases(ps) => ps.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputConfig {
    Jsonl {
        path: String,
    },
    Csv {
        path: String,
    },
    /// Rotating full-array JSON snapshot written alongside the JSONL log.
    JsonSnapshot {
        path: String,
    },
    Graphite {
        host: String,
        port: u16,
        #[serde(default = "default_graphite_prefix")]
        prefix: String,
    },
    Webhook {
        url: String,
    },
    Influxdb {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        database: Option<String>,
    },
    Websocket {
        url: String,
    },
}

fn default_graphite_prefix() -> String {
    "stampede".to_string()
}

impl OutputConfig {
    pub fn is_webhook(&self) -> bool {
        matches!(self, OutputConfig::Webhook { .. })
    }
}

// ---------------------------------------------------------------------------
// Distributed configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionStrategy {
    #[default]
    Even,
    CapacityBased,
    RoundRobin,
    Geographic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSpec {
    /// `host:port` of the worker's HTTP surface.
    pub address: String,
    #[serde(default = "default_capacity")]
    pub capacity: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

fn default_capacity() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedConfig {
    pub workers: Vec<WorkerSpec>,
    #[serde(default)]
    pub strategy: DistributionStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval: Option<DurationValue>,
    /// Continue with the remaining workers when one fails to connect.
    #[serde(default)]
    pub retry_failed: bool,
    /// Prepare all workers first, then start them at a common absolute time.
    #[serde(default = "default_true")]
    pub synchronized: bool,
}

// ---------------------------------------------------------------------------
// Global configuration & test configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub think_time: Option<DurationValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_file: Option<DataConfig>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub variables: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub hooks: TestHooks,
    /// Seed for the template processor's RNG (faker, randomInt).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Faker locale tag, e.g. `"en"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    /// Percentiles reported in summaries (defaults to 50/90/95/99).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentiles: Option<Vec<f64>>,
    /// Width of the summary timeline buckets (default 5 s).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeline_interval: Option<DurationValue>,
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestConfiguration {
    pub name: String,
    pub load: LoadSection,
    pub scenarios: Vec<Scenario>,
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<OutputConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distributed: Option<DistributedConfig>,
}

fn default_true() -> bool {
    true
}

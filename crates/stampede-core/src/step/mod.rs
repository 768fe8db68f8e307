//! Step executor — runs one step through its full lifecycle:
//! hooks → condition → dispatch → checks → extracts → thresholds →
//! teardown, emitting exactly one result per executed step.

use std::time::Instant;

use serde_json::Value;

use crate::check::{self, CheckContext};
use crate::clock::{self, DEFAULT_TIMEOUT};
use crate::context::{TestContext, VuContext};
use crate::error::StampedeError;
use crate::extract::{self, ExtractContext};
use crate::handler::StepOutcome;
use crate::model::{Scenario, Step, StepAction, Threshold, ThresholdAction};
use crate::results::{TestResult, MAX_RESPONSE_BODY_LEN};
use crate::script::run_hook;

/// What the VU loop should do after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepSignal {
    Continue,
    /// Stop the current scenario iteration (failed step with
    /// `continue_on_error = false`, or a `fail_scenario` threshold).
    EndScenario,
    /// Stop this VU (result channel closed or cancellation observed).
    StopVu,
}

/// Execute one step for a VU and emit its result. The caller owns loop
/// control; this function owns the single-step state machine.
pub async fn execute_step(
    ctx: &TestContext,
    scenario: &Scenario,
    step: &Step,
    vu: &mut VuContext,
) -> StepSignal {
    let started = Instant::now();
    let mut result = TestResult::new(
        vu.vu_id,
        vu.iteration,
        &scenario.name,
        step.action.kind(),
        &step.common.name,
    );

    // -- before-step hook --------------------------------------------------
    let mut hook_failed = false;
    if let Some(script) = &step.common.hooks.before_step {
        let extra = hook_resolver(vu.vu_id, vu.iteration, &vu.extracted_data, &vu.csv_row);
        let ok = run_hook("before_step", script, None, &mut vu.variables, &extra).await;
        hook_failed = !ok;
    }
    if hook_failed && !step.common.continue_on_error {
        result.fail("before_step hook failed");
        result.error_code = Some("hook".to_string());
        return finish(ctx, scenario, step, vu, result, started, StepSignal::EndScenario).await;
    }

    // -- templating --------------------------------------------------------
    let resolver = |name: &str| vu.resolve(name);
    let processed = match ctx.template.process_step(step, &resolver) {
        Ok(p) => p,
        Err(e) => {
            result.fail(e.to_string());
            result.error_code = Some("template".to_string());
            let signal = if step.common.continue_on_error {
                StepSignal::Continue
            } else {
                StepSignal::EndScenario
            };
            return finish(ctx, scenario, step, vu, result, started, signal).await;
        }
    };

    // -- condition ---------------------------------------------------------
    if let Some(condition) = &processed.common.condition {
        // A condition error is handled as a skip.
        let active = crate::expr::evaluate_bool(condition, &resolver).unwrap_or(false);
        if !active {
            result.status_text = "SKIPPED".to_string();
            result.duration = started.elapsed().as_millis() as u64;
            if !ctx.emit(result).await {
                return StepSignal::StopVu;
            }
            return StepSignal::Continue;
        }
    }

    // -- dispatch (with retry) ---------------------------------------------
    let mut outcome = dispatch(ctx, &processed, vu).await;
    if let Some(retry) = &processed.common.retry {
        let mut attempt = 0;
        while !outcome.success && attempt < retry.count {
            if ctx.cancel.is_cancelled() {
                break;
            }
            if let Some(delay) = &retry.delay {
                if let Ok(d) = delay.to_duration() {
                    if clock::sleep(d, &ctx.cancel).await.is_err() {
                        break;
                    }
                }
            }
            tracing::debug!(
                step = %processed.common.name,
                attempt = attempt + 1,
                "retrying failed step"
            );
            outcome = dispatch(ctx, &processed, vu).await;
            attempt += 1;
        }
    }

    // -- checks ------------------------------------------------------------
    let empty_body = String::new();
    let body = outcome.response_body.as_ref().unwrap_or(&empty_body);
    if !processed.common.checks.is_empty() {
        let check_ctx = CheckContext {
            status: outcome.status,
            headers: &outcome.response_headers,
            body,
            response_time_ms: outcome.response_time_ms,
        };
        let outcomes = check::evaluate_all(
            &processed.common.checks,
            &check_ctx,
            &response_resolver(&outcome, vu),
        );
        if let Some(message) = check::failure_message(&outcomes) {
            outcome.success = false;
            outcome.should_record = true;
            match &mut outcome.error {
                Some(existing) => {
                    existing.push_str("; ");
                    existing.push_str(&message);
                }
                None => outcome.error = Some(message),
            }
            outcome.error_code.get_or_insert_with(|| "check".to_string());
        }
    }

    // -- extracts ----------------------------------------------------------
    if !processed.common.extract.is_empty() {
        let extract_ctx = ExtractContext {
            status: outcome.status,
            headers: &outcome.response_headers,
            body,
        };
        let extracted = extract::evaluate_all(
            &processed.common.extract,
            &extract_ctx,
            &response_resolver(&outcome, vu),
        );
        for e in extracted {
            match e.value {
                Some(value) => {
                    vu.extracted_data.insert(e.name, value);
                }
                None => {
                    tracing::debug!(extract = %e.name, message = %e.message, "extract produced no value");
                }
            }
        }
    }

    // -- build the result --------------------------------------------------
    apply_outcome(&mut result, outcome);
    result.duration = started.elapsed().as_millis() as u64;

    // -- thresholds --------------------------------------------------------
    let mut signal = StepSignal::Continue;
    for threshold in &processed.common.thresholds {
        if let Err(violation) = evaluate_threshold(ctx, threshold, &result) {
            let StampedeError::Threshold { message, action, .. } = &violation else {
                continue;
            };
            match action {
                ThresholdAction::Log => {
                    tracing::warn!(step = %result.step_name, "{violation}");
                }
                ThresholdAction::FailStep => {
                    result.fail(message.clone());
                    result.error_code = Some("threshold".to_string());
                }
                ThresholdAction::FailScenario => {
                    result.fail(message.clone());
                    result.error_code = Some("threshold".to_string());
                    signal = StepSignal::EndScenario;
                }
                ThresholdAction::FailTest => {
                    result.fail(message.clone());
                    result.error_code = Some("threshold".to_string());
                    tracing::error!(step = %result.step_name, "{violation}; failing test");
                    ctx.fail_test(false);
                }
                ThresholdAction::Abort => {
                    result.fail(message.clone());
                    result.error_code = Some("threshold".to_string());
                    tracing::error!(step = %result.step_name, "{violation}; aborting test");
                    ctx.fail_test(true);
                }
            }
        }
    }

    if !result.success && !step.common.continue_on_error && signal == StepSignal::Continue {
        signal = StepSignal::EndScenario;
    }

    finish(ctx, scenario, step, vu, result, started, signal).await
}

// ---------------------------------------------------------------------------
// Lifecycle tail: error hook, teardown, emit, think time
// ---------------------------------------------------------------------------

async fn finish(
    ctx: &TestContext,
    scenario: &Scenario,
    step: &Step,
    vu: &mut VuContext,
    mut result: TestResult,
    started: Instant,
    signal: StepSignal,
) -> StepSignal {
    if !result.success {
        vu.loop_errors += 1;
        if let Some(script) = &step.common.hooks.on_step_error {
            let extra = hook_resolver(vu.vu_id, vu.iteration, &vu.extracted_data, &vu.csv_row);
            run_hook("on_step_error", script, None, &mut vu.variables, &extra).await;
        }
    }

    if let Some(script) = &step.common.hooks.teardown_step {
        let extra = hook_resolver(vu.vu_id, vu.iteration, &vu.extracted_data, &vu.csv_row);
        run_hook("teardown_step", script, None, &mut vu.variables, &extra).await;
    }

    if result.duration == 0 {
        result.duration = started.elapsed().as_millis() as u64;
    }

    if !ctx.emit(result).await {
        return StepSignal::StopVu;
    }

    // Think time: step override, then scenario default, then global.
    let think = step
        .common
        .think_time
        .as_ref()
        .or(scenario.think_time.as_ref())
        .or(ctx.config.global.think_time.as_ref());
    if let Some(think) = think {
        if let Ok(d) = think.to_duration() {
            if clock::sleep(d, &ctx.cancel).await.is_err() {
                return StepSignal::StopVu;
            }
        }
    }

    signal
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

async fn dispatch(ctx: &TestContext, step: &Step, vu: &mut VuContext) -> StepOutcome {
    match &step.action {
        StepAction::Rest { .. } => ctx.handlers.rest.execute(&step.action, &ctx.config.global).await,
        StepAction::Soap { .. } => ctx.handlers.soap.execute(&step.action, &ctx.config.global).await,

        StepAction::Wait { duration } => {
            let mut outcome = StepOutcome::default();
            match duration.to_duration() {
                Ok(d) => {
                    let start = Instant::now();
                    if clock::sleep(d, &ctx.cancel).await.is_err() {
                        outcome.success = false;
                        outcome.error = Some("cancelled during wait".to_string());
                        outcome.error_code = Some("cancelled".to_string());
                    }
                    outcome.response_time_ms = start.elapsed().as_millis() as u64;
                }
                Err(e) => {
                    outcome.success = false;
                    outcome.error = Some(e.to_string());
                    outcome.error_code = Some("config".to_string());
                }
            }
            outcome
        }

        StepAction::Script { script } => {
            let mut outcome = StepOutcome::default();
            let extra = hook_resolver(vu.vu_id, vu.iteration, &vu.extracted_data, &vu.csv_row);
            let start = Instant::now();
            if let Err(e) = crate::script::run_script(script, None, &mut vu.variables, &extra).await
            {
                outcome.success = false;
                outcome.error = Some(e.to_string());
                outcome.error_code = Some("script".to_string());
            }
            outcome.response_time_ms = start.elapsed().as_millis() as u64;
            outcome
        }

        StepAction::Rendezvous {
            rendezvous,
            count,
            timeout,
            policy,
        } => {
            let mut outcome = StepOutcome::default();
            let timeout = timeout.as_ref().and_then(|t| t.to_duration().ok());
            match ctx
                .rendezvous
                .wait(rendezvous, *count, timeout, *policy, vu.vu_id, &ctx.cancel)
                .await
            {
                Ok(wait) => {
                    outcome.success = wait.released;
                    outcome.response_time_ms = wait.wait_time_ms;
                    outcome
                        .custom_metrics
                        .insert("rendezvous_vu_count".to_string(), wait.vu_count.into());
                    outcome.custom_metrics.insert(
                        "rendezvous_wait_time_ms".to_string(),
                        wait.wait_time_ms.into(),
                    );
                    outcome.custom_metrics.insert(
                        "rendezvous_reason".to_string(),
                        serde_json::to_value(wait.reason).unwrap_or(Value::Null),
                    );
                    if !wait.released {
                        outcome.error =
                            Some(format!("rendezvous \"{rendezvous}\" timed out"));
                        outcome.error_code = Some("rendezvous_timeout".to_string());
                    }
                }
                Err(e) => {
                    outcome.success = false;
                    outcome.error = Some(e.to_string());
                    outcome.error_code = Some("rendezvous".to_string());
                }
            }
            outcome
        }

        StepAction::Web { command, .. } => {
            let handler = match ctx.handlers.web() {
                Some(h) => h,
                None => return StepOutcome::failed("no web handler registered", "unregistered"),
            };
            let mut outcome =
                match clock::with_deadline(handler.execute(step, vu), DEFAULT_TIMEOUT).await {
                    Ok(o) => o,
                    Err(e) => StepOutcome::failed(e.to_string(), "timeout"),
                };
            // Only verification and wait-for commands are recorded; failed
            // steps are always recorded.
            outcome.should_record =
                command.starts_with("verify") || command.starts_with("wait");
            if !outcome.success {
                outcome.should_record = true;
            }
            outcome
        }

        StepAction::Custom { handler, .. } => match ctx.handlers.custom(handler) {
            Some(h) => match clock::with_deadline(h.execute(step, vu), DEFAULT_TIMEOUT).await {
                Ok(o) => o,
                Err(e) => StepOutcome::failed(e.to_string(), "timeout"),
            },
            None => StepOutcome::failed(
                format!("no custom handler registered for \"{handler}\""),
                "unregistered",
            ),
        },
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Extra resolver for hooks/scripts: VU specials, extracted data, and the
/// bound CSV row. Deliberately built from individual fields so the caller
/// can hand `&mut vu.variables` to the script engine at the same time.
fn hook_resolver<'a>(
    vu_id: u64,
    iteration: u64,
    extracted: &'a std::collections::HashMap<String, Value>,
    csv_row: &'a Option<crate::data::DataRow>,
) -> impl Fn(&str) -> Option<Value> + 'a {
    move |name: &str| match name {
        "__VU" => Some(vu_id.into()),
        "__ITER" => Some(iteration.into()),
        _ => {
            if let Some(path) = name.strip_prefix("extracted_data.") {
                return crate::script::lookup_path(extracted, path);
            }
            crate::script::lookup_path(extracted, name).or_else(|| {
                csv_row
                    .as_ref()
                    .and_then(|row| row.values.get(name).cloned())
            })
        }
    }
}

/// Resolver exposing response fields to custom checks/extracts, falling
/// back to VU state.
fn response_resolver<'a>(
    outcome: &'a StepOutcome,
    vu: &'a VuContext,
) -> impl Fn(&str) -> Option<Value> + 'a {
    move |name: &str| match name {
        "status" => Some(outcome.status.into()),
        "response_time" => Some(outcome.response_time_ms.into()),
        "response_size" => Some(outcome.response_size.into()),
        "body" => Some(Value::String(
            outcome.response_body.clone().unwrap_or_default(),
        )),
        "success" => Some(Value::Bool(outcome.success)),
        _ => vu.resolve(name),
    }
}

fn apply_outcome(result: &mut TestResult, outcome: StepOutcome) {
    result.success = outcome.success;
    result.status = outcome.status;
    result.status_text = outcome.status_text;
    result.error = outcome.error;
    result.error_code = outcome.error_code;
    result.response_time = outcome.response_time_ms;
    result.connect_time = outcome.connect_time_ms;
    result.latency = outcome.latency_ms;
    result.request_url = outcome.request_url;
    result.request_method = outcome.request_method;
    result.request_headers = outcome.request_headers;
    result.request_body = outcome.request_body;
    result.response_headers = outcome.response_headers;
    result.response_body = outcome.response_body.map(|body| {
        if body.len() > MAX_RESPONSE_BODY_LEN {
            let mut truncated: String = body.chars().take(MAX_RESPONSE_BODY_LEN).collect();
            truncated.push_str("…[truncated]");
            truncated
        } else {
            body
        }
    });
    result.response_size = outcome.response_size;
    result.sent_bytes = outcome.sent_bytes;
    result.headers_size_sent = outcome.headers_size_sent;
    result.body_size_sent = outcome.body_size_sent;
    result.headers_size_received = outcome.headers_size_received;
    result.body_size_received = outcome.body_size_received;
    result.data_type = outcome.data_type;
    result.custom_metrics = outcome.custom_metrics;
    result.should_record = outcome.should_record;
    if !result.success {
        result.should_record = true;
    }
}

/// Evaluate one threshold against a result. A `fail_*`/`abort` violation is
/// returned as a typed error so callers can propagate it.
fn evaluate_threshold(
    ctx: &TestContext,
    threshold: &Threshold,
    result: &TestResult,
) -> Result<(), StampedeError> {
    let observed = match threshold.metric.as_str() {
        "response_time" => result.response_time as f64,
        "duration" => result.duration as f64,
        "status" => result.status as f64,
        "response_size" => result.response_size as f64,
        "error_rate" => ctx.metrics.snapshot().error_rate,
        "avg_response_time" => ctx.metrics.snapshot().mean_ms,
        "p95" => ctx.metrics.snapshot().p95_ms as f64,
        other => {
            tracing::warn!(metric = other, "unknown threshold metric; skipping");
            return Ok(());
        }
    };

    // The threshold states the acceptable condition; violation is its
    // negation.
    if threshold.operator.compare(observed, threshold.value) {
        return Ok(());
    }

    Err(StampedeError::Threshold {
        metric: threshold.metric.clone(),
        message: format!(
            "{} = {observed} violates {} {}",
            threshold.metric, threshold.operator, threshold.value
        ),
        action: threshold.action,
    })
}

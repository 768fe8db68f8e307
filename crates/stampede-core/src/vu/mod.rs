//! Virtual user — owns a `VuContext` and drives scenario selection, loop
//! control, and per-iteration state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;

use crate::context::{TestContext, VuContext};
use crate::data::{DataProvider, Dispense};
use crate::model::{DataScope, LoopMode, Scenario};
use crate::script::run_hook;
use crate::step::{execute_step, StepSignal};

/// Why a VU stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VuExit {
    /// Loop exhaustion or lifetime reached.
    Completed,
    /// The data provider signalled `stop_vu`.
    DataExhausted,
    /// The test's cancellation signal fired.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScenarioExit {
    Completed,
    StopVu,
    Cancelled,
}

/// Run one virtual user to completion.
///
/// With a `lifetime`, scenarios are picked by weighted random selection
/// until the lifetime elapses; without one, every scenario runs once in
/// source order. The `cancel` token is this VU's own (a child of the test
/// token), so stepping patterns can retire individual VUs.
pub async fn run_virtual_user(
    ctx: Arc<TestContext>,
    vu_id: u64,
    lifetime: Option<Duration>,
    pattern: &str,
    cancel: CancellationToken,
) -> VuExit {
    ctx.metrics.record_vu_start(vu_id, pattern);
    ctx.vu_started();
    let exit = drive(&ctx, vu_id, lifetime, &cancel).await;
    ctx.vu_finished();
    ctx.metrics.record_vu_end(vu_id);
    tracing::debug!(vu_id, ?exit, "virtual user finished");
    exit
}

async fn drive(
    ctx: &Arc<TestContext>,
    vu_id: u64,
    lifetime: Option<Duration>,
    cancel: &CancellationToken,
) -> VuExit {
    let mut vu = VuContext::new(vu_id, &ctx.config.global.variables);

    if let Some(script) = &ctx.config.global.hooks.before_vu {
        let extra = specials(vu.vu_id, vu.iteration, &vu.extracted_data);
        run_hook("before_vu", script, None, &mut vu.variables, &extra).await;
    }

    let mut exit = VuExit::Completed;

    match lifetime {
        None => {
            for scenario in &ctx.config.scenarios {
                match run_scenario(ctx, scenario, &mut vu, cancel).await {
                    ScenarioExit::Completed => {}
                    ScenarioExit::StopVu => {
                        exit = VuExit::DataExhausted;
                        break;
                    }
                    ScenarioExit::Cancelled => {
                        exit = VuExit::Cancelled;
                        break;
                    }
                }
            }
        }
        Some(lifetime) => {
            // Scenario selection shares the run's seed (offset per VU) so a
            // seeded test replays the same scenario sequence.
            let mut rng = match ctx.config.global.seed {
                Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(vu_id)),
                None => StdRng::from_entropy(),
            };
            let deadline = Instant::now() + lifetime;
            while Instant::now() < deadline && !cancel.is_cancelled() {
                let Some(scenario) = pick_scenario(&ctx.config.scenarios, &mut rng) else {
                    break;
                };
                match run_scenario(ctx, scenario, &mut vu, cancel).await {
                    ScenarioExit::Completed => {}
                    ScenarioExit::StopVu => {
                        exit = VuExit::DataExhausted;
                        break;
                    }
                    ScenarioExit::Cancelled => {
                        exit = VuExit::Cancelled;
                        break;
                    }
                }
            }
            if cancel.is_cancelled() && exit == VuExit::Completed {
                exit = VuExit::Cancelled;
            }
        }
    }

    if let Some(script) = &ctx.config.global.hooks.teardown_vu {
        let extra = specials(vu.vu_id, vu.iteration, &vu.extracted_data);
        run_hook("teardown_vu", script, None, &mut vu.variables, &extra).await;
    }

    exit
}

/// Weighted random pick; weights default to 100 and are normalised by sum.
fn pick_scenario<'a>(scenarios: &'a [Scenario], rng: &mut StdRng) -> Option<&'a Scenario> {
    if scenarios.is_empty() {
        return None;
    }
    let total: u64 = scenarios.iter().map(|s| s.weight.max(1) as u64).sum();
    let mut roll = rng.gen_range(0..total);
    for scenario in scenarios {
        let weight = scenario.weight.max(1) as u64;
        if roll < weight {
            return Some(scenario);
        }
        roll -= weight;
    }
    scenarios.last()
}

// ---------------------------------------------------------------------------
// Scenario execution
// ---------------------------------------------------------------------------

async fn run_scenario(
    ctx: &Arc<TestContext>,
    scenario: &Scenario,
    vu: &mut VuContext,
    cancel: &CancellationToken,
) -> ScenarioExit {
    // Scenario-local variables overlay the VU's current set.
    for (name, value) in &scenario.variables {
        vu.variables.insert(name.clone(), value.clone());
    }

    if let Some(script) = &scenario.hooks.before_scenario {
        let extra = specials(vu.vu_id, vu.iteration, &vu.extracted_data);
        run_hook("before_scenario", script, None, &mut vu.variables, &extra).await;
    }

    let provider = scenario
        .csv_data
        .as_ref()
        .or(ctx.config.global.data_file.as_ref())
        .map(|config| ctx.data.provider(config));

    let exit = run_loop(ctx, scenario, vu, cancel, provider.as_deref()).await;

    // Teardown runs even when the VU is winding down from cancellation.
    if let Some(script) = &scenario.hooks.teardown_scenario {
        let extra = specials(vu.vu_id, vu.iteration, &vu.extracted_data);
        run_hook("teardown_scenario", script, None, &mut vu.variables, &extra).await;
    }

    exit
}

async fn run_loop(
    ctx: &Arc<TestContext>,
    scenario: &Scenario,
    vu: &mut VuContext,
    cancel: &CancellationToken,
    provider: Option<&DataProvider>,
) -> ScenarioExit {
    let loop_config = scenario.looping.as_ref();
    let loop_deadline = match loop_config.map(|l| &l.mode) {
        Some(LoopMode::Duration { duration }) => match duration.to_duration() {
            Ok(d) => Some(Instant::now() + d),
            Err(e) => {
                tracing::error!(scenario = %scenario.name, error = %e, "invalid loop duration");
                return ScenarioExit::Completed;
            }
        },
        _ => None,
    };

    let mut count = 0u64;
    vu.loop_errors = 0;

    loop {
        if cancel.is_cancelled() {
            release_row(vu, provider).await;
            return ScenarioExit::Cancelled;
        }

        // Pre-iteration termination checks.
        match loop_config.map(|l| &l.mode) {
            None => {
                if count >= 1 {
                    break;
                }
            }
            Some(LoopMode::Count { count: limit }) => {
                if count >= *limit {
                    break;
                }
            }
            Some(LoopMode::Duration { .. }) => {
                if Instant::now() >= loop_deadline.expect("deadline set above") {
                    break;
                }
            }
            // `while` continues while true, `until` continues until true,
            // both evaluated before each iteration.
            Some(LoopMode::While { condition }) => {
                let resolver = |name: &str| vu.resolve(name);
                if !crate::expr::evaluate_bool(condition, &resolver).unwrap_or(false) {
                    break;
                }
            }
            Some(LoopMode::Until { condition }) => {
                let resolver = |name: &str| vu.resolve(name);
                if crate::expr::evaluate_bool(condition, &resolver).unwrap_or(true) {
                    break;
                }
            }
        }

        if let Some(script) = &scenario.hooks.before_loop {
            let extra = specials(vu.vu_id, vu.iteration, &vu.extracted_data);
            run_hook("before_loop", script, None, &mut vu.variables, &extra).await;
        }

        // Bind a data row for this iteration.
        if let Some(provider) = provider {
            match provider.next(vu.vu_id, vu.iteration, cancel).await {
                Ok(Dispense::Row(row)) => vu.bind_row(row),
                Ok(Dispense::Absent) => vu.csv_row = None,
                Ok(Dispense::StopVu) => return ScenarioExit::StopVu,
                Ok(Dispense::StopTest) => {
                    tracing::error!(
                        scenario = %scenario.name,
                        "data exhausted with stop_test policy; aborting run"
                    );
                    ctx.fail_test(false);
                    return ScenarioExit::Cancelled;
                }
                Err(_) => return ScenarioExit::Cancelled,
            }
        }

        let errors_before = vu.loop_errors;

        for step in &scenario.steps {
            if cancel.is_cancelled() {
                release_row(vu, provider).await;
                return ScenarioExit::Cancelled;
            }
            match execute_step(ctx, scenario, step, vu).await {
                StepSignal::Continue => {}
                StepSignal::EndScenario => break,
                StepSignal::StopVu => {
                    release_row(vu, provider).await;
                    return ScenarioExit::StopVu;
                }
            }
        }

        // A unique row is held for the iteration and returned here.
        release_row(vu, provider).await;

        if let Some(script) = &scenario.hooks.after_loop {
            let extra = specials(vu.vu_id, vu.iteration, &vu.extracted_data);
            run_hook("after_loop", script, None, &mut vu.variables, &extra).await;
        }

        if let Some(config) = loop_config {
            let iteration_failed = vu.loop_errors > errors_before;
            if config.break_on_error && iteration_failed {
                tracing::debug!(scenario = %scenario.name, "loop stopped by break_on_error");
                break;
            }
            if let Some(max) = config.max_errors {
                if vu.loop_errors >= max {
                    tracing::debug!(scenario = %scenario.name, "loop stopped by max_errors");
                    break;
                }
            }
        }

        count += 1;
        vu.iteration += 1;
    }

    ScenarioExit::Completed
}

/// Return a held unique-scope row to the pool. Rows under other scopes have
/// no lock to give back.
async fn release_row(vu: &mut VuContext, provider: Option<&DataProvider>) {
    let Some(provider) = provider else {
        return;
    };
    if provider.config().scope != DataScope::Unique {
        return;
    }
    if let Some(row) = vu.csv_row.take() {
        provider.release(vu.vu_id, &row).await;
    }
}

/// Specials-only resolver for VU/scenario/loop hooks, built from disjoint
/// fields so the variables map can be borrowed mutably alongside it.
fn specials(
    vu_id: u64,
    iteration: u64,
    extracted: &std::collections::HashMap<String, serde_json::Value>,
) -> impl Fn(&str) -> Option<serde_json::Value> + '_ {
    move |name: &str| match name {
        "__VU" => Some(vu_id.into()),
        "__ITER" => Some(iteration.into()),
        _ => crate::script::lookup_path(extracted, name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn make_ctx(config: serde_json::Value) -> (Arc<TestContext>, mpsc::Receiver<crate::results::TestResult>) {
        let config: crate::model::TestConfiguration = serde_json::from_value(config).unwrap();
        let (tx, rx) = mpsc::channel(256);
        (Arc::new(TestContext::new(config, tx).unwrap()), rx)
    }

    fn drain(rx: &mut mpsc::Receiver<crate::results::TestResult>) -> Vec<crate::results::TestResult> {
        let mut results = Vec::new();
        while let Ok(r) = rx.try_recv() {
            results.push(r);
        }
        results
    }

    #[tokio::test]
    async fn single_pass_runs_each_scenario_once_in_order() {
        let (ctx, mut rx) = make_ctx(json!({
            "name": "t",
            "load": {"pattern": "basic", "virtual_users": 1},
            "scenarios": [
                {"name": "first", "steps": [
                    {"name": "a", "type": "wait", "duration": "1ms"}
                ]},
                {"name": "second", "steps": [
                    {"name": "b", "type": "wait", "duration": "1ms"}
                ]}
            ]
        }));

        let exit = run_virtual_user(
            Arc::clone(&ctx),
            1,
            None,
            "basic",
            ctx.cancel.child_token(),
        )
        .await;
        assert_eq!(exit, VuExit::Completed);

        let results = drain(&mut rx);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].scenario, "first");
        assert_eq!(results[1].scenario, "second");
        // Per-VU results are appended in source order with non-decreasing
        // timestamps.
        assert!(results[0].timestamp <= results[1].timestamp);
    }

    #[tokio::test]
    async fn count_loop_runs_fixed_iterations() {
        let (ctx, mut rx) = make_ctx(json!({
            "name": "t",
            "load": {"pattern": "basic", "virtual_users": 1},
            "scenarios": [{
                "name": "s",
                "loop": {"mode": "count", "count": 3},
                "steps": [{"name": "a", "type": "wait", "duration": "1ms"}]
            }]
        }));

        run_virtual_user(Arc::clone(&ctx), 1, None, "basic", ctx.cancel.child_token()).await;
        let results = drain(&mut rx);
        assert_eq!(results.len(), 3);
        assert_eq!(results[2].iteration, 2);
    }

    #[tokio::test]
    async fn while_loop_stops_when_condition_turns_false() {
        let (ctx, mut rx) = make_ctx(json!({
            "name": "t",
            "load": {"pattern": "basic", "virtual_users": 1},
            "scenarios": [{
                "name": "s",
                "variables": {"counter": 0},
                "loop": {"mode": "while", "condition": "counter < 2"},
                "steps": [
                    {"name": "inc", "type": "script", "script": "set counter = counter + 1"}
                ]
            }]
        }));

        run_virtual_user(Arc::clone(&ctx), 1, None, "basic", ctx.cancel.child_token()).await;
        let results = drain(&mut rx);
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn until_loop_runs_until_condition_is_true() {
        let (ctx, mut rx) = make_ctx(json!({
            "name": "t",
            "load": {"pattern": "basic", "virtual_users": 1},
            "scenarios": [{
                "name": "s",
                "variables": {"counter": 0},
                "loop": {"mode": "until", "condition": "counter >= 3"},
                "steps": [
                    {"name": "inc", "type": "script", "script": "set counter = counter + 1"}
                ]
            }]
        }));

        run_virtual_user(Arc::clone(&ctx), 1, None, "basic", ctx.cancel.child_token()).await;
        assert_eq!(drain(&mut rx).len(), 3);
    }

    #[tokio::test]
    async fn break_on_error_stops_the_loop_after_a_failed_iteration() {
        let (ctx, mut rx) = make_ctx(json!({
            "name": "t",
            "load": {"pattern": "basic", "virtual_users": 1},
            "scenarios": [{
                "name": "s",
                "loop": {"mode": "count", "count": 10, "break_on_error": true},
                "steps": [
                    // An unregistered web handler fails every time.
                    {"name": "boom", "type": "web", "command": "click"}
                ]
            }]
        }));

        run_virtual_user(Arc::clone(&ctx), 1, None, "basic", ctx.cancel.child_token()).await;
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn unique_data_exhaustion_terminates_the_vu_cleanly() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"email\nonly@test.dev\n").unwrap();

        let (ctx, mut rx) = make_ctx(json!({
            "name": "t",
            "load": {"pattern": "basic", "virtual_users": 2},
            "scenarios": [{
                "name": "s",
                "csv_data": {
                    "path": file.path().to_str().unwrap(),
                    "scope": "unique",
                    "on_exhausted": "stop_vu"
                },
                "steps": [{"name": "use-row", "type": "wait", "duration": "1ms"}]
            }]
        }));

        // First VU consumes the single row and completes, releasing it at
        // iteration end.
        let exit1 =
            run_virtual_user(Arc::clone(&ctx), 1, None, "basic", ctx.cancel.child_token()).await;
        assert_eq!(exit1, VuExit::Completed);
        assert_eq!(drain(&mut rx).len(), 1);

        // Hold the row from outside, then the next VU must stop cleanly.
        let config: crate::model::DataConfig = serde_json::from_value(json!({
            "path": file.path().to_str().unwrap(),
            "scope": "unique",
            "on_exhausted": "stop_vu"
        }))
        .unwrap();
        let provider = ctx.data.provider(&config);
        let row = match provider.next(99, 0, &ctx.cancel).await.unwrap() {
            crate::data::Dispense::Row(row) => row,
            other => panic!("expected row, got {other:?}"),
        };

        let exit2 =
            run_virtual_user(Arc::clone(&ctx), 2, None, "basic", ctx.cancel.child_token()).await;
        assert_eq!(exit2, VuExit::DataExhausted);
        assert!(drain(&mut rx).is_empty());

        provider.release(99, &row).await;
    }

    #[tokio::test]
    async fn lifetime_loops_until_deadline() {
        let (ctx, mut rx) = make_ctx(json!({
            "name": "t",
            "load": {"pattern": "basic", "virtual_users": 1},
            "scenarios": [{
                "name": "s",
                "steps": [{"name": "a", "type": "wait", "duration": "5ms"}]
            }]
        }));

        run_virtual_user(
            Arc::clone(&ctx),
            1,
            Some(Duration::from_millis(60)),
            "basic",
            ctx.cancel.child_token(),
        )
        .await;
        let results = drain(&mut rx);
        assert!(results.len() >= 2, "expected several iterations, got {}", results.len());
    }

    #[tokio::test]
    async fn cancellation_stops_the_vu() {
        let (ctx, _rx) = make_ctx(json!({
            "name": "t",
            "load": {"pattern": "basic", "virtual_users": 1},
            "scenarios": [{
                "name": "s",
                "steps": [{"name": "a", "type": "wait", "duration": "10s"}]
            }]
        }));

        let cancel = ctx.cancel.child_token();
        let handle = {
            let ctx = Arc::clone(&ctx);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_virtual_user(ctx, 1, Some(Duration::from_secs(30)), "basic", cancel).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let exit = handle.await.unwrap();
        assert_eq!(exit, VuExit::Cancelled);
    }

    #[tokio::test]
    async fn vu_hooks_run_and_mutate_variables() {
        let (ctx, mut rx) = make_ctx(json!({
            "name": "t",
            "load": {"pattern": "basic", "virtual_users": 1},
            "global": {
                "hooks": {"before_vu": "set greeting = 'hello-' + __VU"}
            },
            "scenarios": [{
                "name": "s",
                "steps": [{
                    "name": "use", "type": "script",
                    "script": "set copy = greeting"
                }]
            }]
        }));

        run_virtual_user(Arc::clone(&ctx), 7, None, "basic", ctx.cancel.child_token()).await;
        let results = drain(&mut rx);
        assert!(results[0].success, "error: {:?}", results[0].error);
    }

    #[test]
    fn weighted_pick_respects_weights() {
        let scenarios: Vec<Scenario> = serde_json::from_value(json!([
            {"name": "heavy", "weight": 900, "steps": []},
            {"name": "light", "weight": 100, "steps": []}
        ]))
        .unwrap();

        let mut rng = StdRng::seed_from_u64(7);
        let mut heavy = 0;
        for _ in 0..1000 {
            if pick_scenario(&scenarios, &mut rng).unwrap().name == "heavy" {
                heavy += 1;
            }
        }
        // ~90% expected; allow a generous band.
        assert!(heavy > 750, "heavy picked only {heavy}/1000");
    }

    #[test]
    fn weighted_pick_is_reproducible_with_one_seed() {
        let scenarios: Vec<Scenario> = serde_json::from_value(json!([
            {"name": "a", "steps": []},
            {"name": "b", "steps": []},
            {"name": "c", "steps": []}
        ]))
        .unwrap();

        let pick_sequence = |seed: u64| -> Vec<String> {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..20)
                .map(|_| pick_scenario(&scenarios, &mut rng).unwrap().name.clone())
                .collect()
        };
        assert_eq!(pick_sequence(42), pick_sequence(42));
    }

    #[test]
    fn pick_scenario_empty_is_none() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(pick_scenario(&[], &mut rng).is_none());
    }
}

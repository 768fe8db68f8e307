//! Load patterns — schedules that create and retire virtual users over
//! time. All three disciplines share the same VU runner and honour the
//! test's cancellation signal; VU errors from data exhaustion terminate
//! that VU only.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::clock;
use crate::context::TestContext;
use crate::error::StampedeError;
use crate::model::LoadPhase;
use crate::vu::run_virtual_user;

/// Run one load phase to completion. Phases in a list run sequentially and
/// draw VU ids from the shared counter, so their id ranges are disjoint.
pub async fn run_phase(ctx: Arc<TestContext>, phase: &LoadPhase) -> Result<(), StampedeError> {
    match phase {
        LoadPhase::Basic {
            virtual_users,
            duration,
            ramp_up,
        } => {
            let duration = parse_opt(duration.as_ref())?;
            let ramp_up = parse_opt(ramp_up.as_ref())?;
            run_basic(ctx, *virtual_users, duration, ramp_up).await
        }
        LoadPhase::Stepping { steps } => run_stepping(ctx, steps).await,
        LoadPhase::Arrivals {
            rate,
            duration,
            ramp_up,
            vu_duration,
        } => {
            let duration = duration.to_duration()?;
            let ramp_up = parse_opt(ramp_up.as_ref())?;
            let vu_duration = parse_opt(vu_duration.as_ref())?;
            run_arrivals(ctx, *rate, duration, ramp_up, vu_duration).await
        }
    }
}

fn parse_opt(
    value: Option<&crate::model::DurationValue>,
) -> Result<Option<Duration>, StampedeError> {
    value.map(|v| v.to_duration()).transpose()
}

// ---------------------------------------------------------------------------
// Basic
// ---------------------------------------------------------------------------

/// Start `n` VUs evenly spaced over the ramp-up. With a duration each VU
/// loops scenarios until it elapses; otherwise each runs its scenarios
/// once. Waits for every VU to finish.
async fn run_basic(
    ctx: Arc<TestContext>,
    n: u32,
    duration: Option<Duration>,
    ramp_up: Option<Duration>,
) -> Result<(), StampedeError> {
    if n == 0 {
        tracing::warn!("basic phase with zero virtual users performs no work");
        return Ok(());
    }

    let ramp_delay = spacing(ramp_up, n);
    let mut join_set: JoinSet<()> = JoinSet::new();

    for i in 0..n {
        if ctx.cancel.is_cancelled() {
            break;
        }
        if i > 0 && !ramp_delay.is_zero() {
            if clock::sleep(ramp_delay, &ctx.cancel).await.is_err() {
                break;
            }
        }

        let vu_id = ctx.next_vu_id();
        let ctx_clone = Arc::clone(&ctx);
        let vu_cancel = ctx.cancel.child_token();
        join_set.spawn(async move {
            run_virtual_user(ctx_clone, vu_id, duration, "basic", vu_cancel).await;
        });
    }

    await_all(&ctx, join_set).await;
    Ok(())
}

/// Delay between consecutive VU starts for a ramp-up window.
fn spacing(ramp_up: Option<Duration>, n: u32) -> Duration {
    match ramp_up {
        Some(ramp) if n > 1 && !ramp.is_zero() => ramp / (n - 1),
        _ => Duration::ZERO,
    }
}

// ---------------------------------------------------------------------------
// Stepping
// ---------------------------------------------------------------------------

/// Ordered `{users, duration, ramp_up}` steps. Scaling up spaces the new
/// VUs over the step's ramp-up; scaling down stops the most recently
/// started VUs. Spawned VUs persist across steps (their lifetime is the
/// remaining phase time) so the active count tracks the step targets.
async fn run_stepping(
    ctx: Arc<TestContext>,
    steps: &[crate::model::LoadStep],
) -> Result<(), StampedeError> {
    let mut durations = Vec::with_capacity(steps.len());
    for step in steps {
        durations.push(step.duration.to_duration()?);
    }
    let total: Duration = durations.iter().sum();

    let mut join_set: JoinSet<()> = JoinSet::new();
    // Most-recent-first stack of per-VU cancel tokens for scale-down.
    let mut active: Vec<CancellationToken> = Vec::new();
    let mut elapsed = Duration::ZERO;

    for (step, step_duration) in steps.iter().zip(durations.iter()) {
        if ctx.cancel.is_cancelled() {
            break;
        }

        let current = active.len() as i64;
        let delta = step.users as i64 - current;

        if delta > 0 {
            let ramp = step
                .ramp_up
                .as_ref()
                .map(|r| r.to_duration())
                .transpose()?;
            let delay = spacing(ramp, delta as u32);
            let lifetime = total - elapsed;

            for i in 0..delta {
                if i > 0 && !delay.is_zero() {
                    if clock::sleep(delay, &ctx.cancel).await.is_err() {
                        break;
                    }
                }
                let vu_id = ctx.next_vu_id();
                let ctx_clone = Arc::clone(&ctx);
                let vu_cancel = ctx.cancel.child_token();
                active.push(vu_cancel.clone());
                join_set.spawn(async move {
                    run_virtual_user(ctx_clone, vu_id, Some(lifetime), "stepping", vu_cancel)
                        .await;
                });
            }
        } else if delta < 0 {
            for _ in 0..(-delta) {
                if let Some(token) = active.pop() {
                    token.cancel();
                }
            }
        }

        tracing::debug!(
            target_users = step.users,
            active = active.len(),
            "stepping phase step started"
        );

        if clock::sleep(*step_duration, &ctx.cancel).await.is_err() {
            break;
        }
        elapsed += *step_duration;
    }

    // Phase over: retire whatever is still running and await it.
    for token in &active {
        token.cancel();
    }
    await_all(&ctx, join_set).await;
    Ok(())
}

// ---------------------------------------------------------------------------
// Arrivals
// ---------------------------------------------------------------------------

/// Open model: during each one-second window, spawn `⌈rate⌉` VUs spaced
/// `1/rate` apart. The arrival clock never blocks on VU execution — each
/// arrival is dispatched onto its own task. After `duration`, stragglers
/// get up to one `vu_duration` of grace.
async fn run_arrivals(
    ctx: Arc<TestContext>,
    rate: f64,
    duration: Duration,
    ramp_up: Option<Duration>,
    vu_duration: Option<Duration>,
) -> Result<(), StampedeError> {
    if rate <= 0.0 || !rate.is_finite() {
        return Err(StampedeError::Validation(format!(
            "arrivals pattern requires a positive rate (got {rate})"
        )));
    }

    let started = tokio::time::Instant::now();
    let mut join_set: JoinSet<()> = JoinSet::new();

    'windows: while started.elapsed() < duration {
        if ctx.cancel.is_cancelled() {
            break;
        }

        // Rate climbs linearly from zero over the ramp-up window.
        let current_rate = match ramp_up {
            Some(ramp) if !ramp.is_zero() => {
                let progress =
                    (started.elapsed().as_secs_f64() / ramp.as_secs_f64()).min(1.0);
                (rate * progress).max(rate.min(1.0))
            }
            _ => rate,
        };

        let window_start = tokio::time::Instant::now();
        let arrivals = current_rate.ceil() as u32;
        let gap = Duration::from_secs_f64(1.0 / current_rate);

        for i in 0..arrivals {
            if started.elapsed() >= duration || ctx.cancel.is_cancelled() {
                break 'windows;
            }

            let vu_id = ctx.next_vu_id();
            let ctx_clone = Arc::clone(&ctx);
            let vu_cancel = ctx.cancel.child_token();
            join_set.spawn(async move {
                run_virtual_user(ctx_clone, vu_id, vu_duration, "arrivals", vu_cancel).await;
            });

            if i + 1 < arrivals {
                if clock::sleep(gap, &ctx.cancel).await.is_err() {
                    break 'windows;
                }
            }
        }

        // Absorb scheduling drift so windows stay one second wide.
        let consumed = window_start.elapsed();
        if consumed < Duration::from_secs(1) {
            if clock::sleep(Duration::from_secs(1) - consumed, &ctx.cancel)
                .await
                .is_err()
            {
                break;
            }
        }
    }

    // Stragglers get one vu_duration (or a short default) to finish.
    let grace = vu_duration.unwrap_or(Duration::from_secs(30));
    let ctx_ref = &ctx;
    let drain = async {
        await_all(ctx_ref, join_set).await;
    };
    if tokio::time::timeout(grace, drain).await.is_err() {
        tracing::warn!("arrivals phase: stragglers did not finish within grace period");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Shared wind-down
// ---------------------------------------------------------------------------

/// Await every spawned VU. An abort request (threshold `action=abort`)
/// drops the set instead, which aborts the remaining tasks.
async fn await_all(ctx: &TestContext, mut join_set: JoinSet<()>) {
    while join_set.join_next().await.is_some() {
        if ctx.abort_requested() {
            tracing::warn!("abort requested; not awaiting remaining virtual users");
            join_set.abort_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn make_ctx(
        config: serde_json::Value,
    ) -> (Arc<TestContext>, mpsc::Receiver<crate::results::TestResult>) {
        let config: crate::model::TestConfiguration = serde_json::from_value(config).unwrap();
        let (tx, rx) = mpsc::channel(1024);
        (Arc::new(TestContext::new(config, tx).unwrap()), rx)
    }

    fn drain(
        rx: &mut mpsc::Receiver<crate::results::TestResult>,
    ) -> Vec<crate::results::TestResult> {
        let mut results = Vec::new();
        while let Ok(r) = rx.try_recv() {
            results.push(r);
        }
        results
    }

    fn wait_scenario() -> serde_json::Value {
        json!([{
            "name": "s",
            "steps": [{"name": "w", "type": "wait", "duration": "5ms"}]
        }])
    }

    #[tokio::test]
    async fn basic_zero_users_emits_nothing() {
        let (ctx, mut rx) = make_ctx(json!({
            "name": "t",
            "load": {"pattern": "basic", "virtual_users": 0},
            "scenarios": wait_scenario()
        }));
        let phase = ctx.config.load.phases()[0].clone();
        run_phase(Arc::clone(&ctx), &phase).await.unwrap();
        assert!(drain(&mut rx).is_empty());
        assert_eq!(ctx.metrics.summary("t").vu_ramp_up.len(), 0);
    }

    #[tokio::test]
    async fn basic_without_duration_runs_single_pass_per_vu() {
        let (ctx, mut rx) = make_ctx(json!({
            "name": "t",
            "load": {"pattern": "basic", "virtual_users": 3},
            "scenarios": wait_scenario()
        }));
        let phase = ctx.config.load.phases()[0].clone();
        run_phase(Arc::clone(&ctx), &phase).await.unwrap();

        let results = drain(&mut rx);
        assert_eq!(results.len(), 3);
        // VU ids are distinct.
        let ids: std::collections::HashSet<u64> = results.iter().map(|r| r.vu_id).collect();
        assert_eq!(ids.len(), 3);
        // One ramp-up entry per VU.
        assert_eq!(ctx.metrics.summary("t").vu_ramp_up.len(), 3);
    }

    #[tokio::test]
    async fn basic_with_duration_iterates_each_vu() {
        let (ctx, mut rx) = make_ctx(json!({
            "name": "t",
            "load": {"pattern": "basic", "virtual_users": 2, "duration": "60ms"},
            "scenarios": wait_scenario()
        }));
        let phase = ctx.config.load.phases()[0].clone();
        run_phase(Arc::clone(&ctx), &phase).await.unwrap();

        let results = drain(&mut rx);
        assert!(results.len() > 2, "expected iteration, got {}", results.len());
    }

    #[tokio::test]
    async fn stepping_scales_up_and_down() {
        let (ctx, mut rx) = make_ctx(json!({
            "name": "t",
            "load": {"pattern": "stepping", "steps": [
                {"users": 2, "duration": "40ms"},
                {"users": 4, "duration": "40ms"},
                {"users": 1, "duration": "40ms"}
            ]},
            "scenarios": wait_scenario()
        }));
        let phase = ctx.config.load.phases()[0].clone();
        run_phase(Arc::clone(&ctx), &phase).await.unwrap();

        // 2 initial + 2 scaled up; scale-down stops VUs but starts none.
        let starts = ctx.metrics.summary("t").vu_ramp_up.len();
        assert_eq!(starts, 4);
        assert!(!drain(&mut rx).is_empty());
        assert_eq!(ctx.active_vus(), 0);

        // The timeline's active-VU curve rises to the middle step and falls
        // again after the scale-down: VUs that were stopped must not stay
        // counted as active.
        let summary = ctx.metrics.summary_with(
            "t",
            crate::metrics::DEFAULT_PERCENTILES,
            40,
        );
        let active: Vec<u64> = summary.timeline.iter().map(|b| b.active_vus).collect();
        let peak = active.iter().copied().max().unwrap_or(0);
        let last = *active.last().unwrap_or(&0);
        assert!(peak >= 3, "expected the 4-user step to show, got {active:?}");
        assert!(
            last <= 2,
            "expected the scale-down to 1 user to show, got {active:?}"
        );
    }

    #[tokio::test]
    async fn arrivals_rejects_zero_rate() {
        let (ctx, _rx) = make_ctx(json!({
            "name": "t",
            "load": {"pattern": "arrivals", "rate": 0.0, "duration": "1s"},
            "scenarios": wait_scenario()
        }));
        let phase = ctx.config.load.phases()[0].clone();
        let err = run_phase(Arc::clone(&ctx), &phase).await.unwrap_err();
        assert!(matches!(err, StampedeError::Validation(_)));
    }

    #[tokio::test]
    async fn arrivals_spawns_at_roughly_the_target_rate() {
        let (ctx, mut rx) = make_ctx(json!({
            "name": "t",
            "load": {"pattern": "arrivals", "rate": 5.0, "duration": "1s"},
            "scenarios": wait_scenario()
        }));
        let phase = ctx.config.load.phases()[0].clone();
        run_phase(Arc::clone(&ctx), &phase).await.unwrap();

        let starts = ctx.metrics.summary("t").vu_ramp_up.len();
        assert!(
            (4..=7).contains(&starts),
            "expected about 5 arrivals, got {starts}"
        );
        assert!(!drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn cancellation_stops_spawning() {
        let (ctx, _rx) = make_ctx(json!({
            "name": "t",
            "load": {"pattern": "basic", "virtual_users": 50, "ramp_up": "10s"},
            "scenarios": wait_scenario()
        }));
        let phase = ctx.config.load.phases()[0].clone();

        let handle = {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move { run_phase(ctx, &phase).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        ctx.cancel.cancel();
        handle.await.unwrap().unwrap();

        // Far fewer than 50 VUs were started before cancellation.
        assert!(ctx.metrics.summary("t").vu_ramp_up.len() < 10);
    }

    #[test]
    fn spacing_divides_ramp_evenly() {
        assert_eq!(
            spacing(Some(Duration::from_secs(4)), 5),
            Duration::from_secs(1)
        );
        assert_eq!(spacing(Some(Duration::from_secs(4)), 1), Duration::ZERO);
        assert_eq!(spacing(None, 10), Duration::ZERO);
    }
}

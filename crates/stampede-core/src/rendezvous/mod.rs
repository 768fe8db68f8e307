//! Rendezvous — named N-party barriers synchronising VUs across a test.
//!
//! One registry per test context. Each barrier serialises its state behind
//! its own lock; wakeups go through a `Notify` whose future is enabled
//! while the lock is still held, so releases are never lost.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::clock::DEFAULT_TIMEOUT;
use crate::error::StampedeError;
use crate::model::ReleasePolicy;

// ---------------------------------------------------------------------------
// Outcome types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    TargetReached,
    Timeout,
}

/// What a VU observes when its `wait` completes.
///
/// `released` is true when the target count was reached, or on timeout
/// under the `partial` policy; a plain timeout under `all`/`first_n`
/// reports `released = false` with `reason = timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitOutcome {
    pub released: bool,
    pub reason: ReleaseReason,
    /// Number of VUs released together in this batch.
    pub vu_count: u32,
    pub wait_time_ms: u64,
}

// ---------------------------------------------------------------------------
// Barrier
// ---------------------------------------------------------------------------

struct BarrierState {
    /// VUs currently waiting, in FIFO arrival order.
    waiters: Vec<u64>,
    /// Outcomes for VUs released but not yet returned.
    released: HashMap<u64, (ReleaseReason, u32, bool)>,
}

struct Barrier {
    state: Mutex<BarrierState>,
    notify: Notify,
}

impl Barrier {
    fn new() -> Self {
        Self {
            state: Mutex::new(BarrierState {
                waiters: Vec::new(),
                released: HashMap::new(),
            }),
            notify: Notify::new(),
        }
    }
}

fn release_batch(
    state: &mut BarrierState,
    vu_ids: Vec<u64>,
    reason: ReleaseReason,
    released_flag: bool,
) {
    let count = vu_ids.len() as u32;
    for vu in vu_ids {
        state.released.insert(vu, (reason, count, released_flag));
    }
}

// ---------------------------------------------------------------------------
// RendezvousManager
// ---------------------------------------------------------------------------

/// Registry of named barriers, owned by the test context.
#[derive(Default)]
pub struct RendezvousManager {
    barriers: std::sync::Mutex<HashMap<String, Arc<Barrier>>>,
}

impl RendezvousManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn barrier(&self, name: &str) -> Arc<Barrier> {
        let mut barriers = self.barriers.lock().expect("rendezvous registry poisoned");
        barriers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Barrier::new()))
            .clone()
    }

    /// Register `vu_id` as waiting at `name` and block until the waiter
    /// count reaches `target`, the timeout expires, or the test is
    /// cancelled. Waiting twice at the same name from one VU is an error.
    pub async fn wait(
        &self,
        name: &str,
        target: u32,
        timeout: Option<Duration>,
        policy: ReleasePolicy,
        vu_id: u64,
        cancel: &CancellationToken,
    ) -> Result<WaitOutcome, StampedeError> {
        if target == 0 {
            return Err(StampedeError::Rendezvous(format!(
                "rendezvous \"{name}\": target count must be at least 1"
            )));
        }

        let barrier = self.barrier(name);
        let timeout = timeout.unwrap_or(DEFAULT_TIMEOUT);
        let started = Instant::now();
        let deadline = started + timeout;

        // Register, possibly releasing a full batch right away.
        {
            let mut state = barrier.state.lock().await;
            if state.waiters.contains(&vu_id) || state.released.contains_key(&vu_id) {
                return Err(StampedeError::Rendezvous(format!(
                    "VU {vu_id} is already waiting at rendezvous \"{name}\""
                )));
            }
            state.waiters.push(vu_id);

            if state.waiters.len() >= target as usize {
                let batch: Vec<u64> = match policy {
                    // `first_n` releases the first N in FIFO arrival order;
                    // later arrivals keep waiting for the next fill.
                    ReleasePolicy::FirstN => {
                        state.waiters.drain(..target as usize).collect()
                    }
                    ReleasePolicy::All | ReleasePolicy::Partial => {
                        std::mem::take(&mut state.waiters)
                    }
                };
                release_batch(&mut state, batch, ReleaseReason::TargetReached, true);
                barrier.notify.notify_waiters();
            }
        }

        loop {
            // Check for release while holding the lock, and arm the wakeup
            // future before letting go of it so no notify is lost.
            let mut state = barrier.state.lock().await;
            if let Some((reason, vu_count, released)) = state.released.remove(&vu_id) {
                return Ok(WaitOutcome {
                    released,
                    reason,
                    vu_count,
                    wait_time_ms: started.elapsed().as_millis() as u64,
                });
            }
            let notified = barrier.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            drop(state);

            tokio::select! {
                _ = notified.as_mut() => {}
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                    let mut state = barrier.state.lock().await;
                    // A release may have slipped in just before the deadline.
                    if let Some((reason, vu_count, released)) = state.released.remove(&vu_id) {
                        return Ok(WaitOutcome {
                            released,
                            reason,
                            vu_count,
                            wait_time_ms: started.elapsed().as_millis() as u64,
                        });
                    }
                    // First VU to time out releases everyone still waiting.
                    let batch = std::mem::take(&mut state.waiters);
                    let released_flag = policy == ReleasePolicy::Partial;
                    release_batch(&mut state, batch, ReleaseReason::Timeout, released_flag);
                    let (reason, vu_count, released) = state
                        .released
                        .remove(&vu_id)
                        .unwrap_or((ReleaseReason::Timeout, 1, released_flag));
                    barrier.notify.notify_waiters();
                    return Ok(WaitOutcome {
                        released,
                        reason,
                        vu_count,
                        wait_time_ms: started.elapsed().as_millis() as u64,
                    });
                }
                _ = cancel.cancelled() => {
                    let mut state = barrier.state.lock().await;
                    state.waiters.retain(|&v| v != vu_id);
                    state.released.remove(&vu_id);
                    return Err(StampedeError::Cancelled);
                }
            }
        }
    }

    /// Number of VUs currently waiting at `name` (zero for unknown names).
    pub async fn waiting(&self, name: &str) -> usize {
        let barrier = {
            let barriers = self.barriers.lock().expect("rendezvous registry poisoned");
            barriers.get(name).cloned()
        };
        match barrier {
            Some(b) => b.state.lock().await.waiters.len(),
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::task::JoinSet;

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn all_policy_releases_everyone_at_target() {
        let manager = Arc::new(RendezvousManager::new());
        let c = cancel();
        let mut join_set = JoinSet::new();

        for vu in 0..5u64 {
            let manager = Arc::clone(&manager);
            let c = c.clone();
            join_set.spawn(async move {
                manager
                    .wait("go", 5, Some(Duration::from_secs(5)), ReleasePolicy::All, vu, &c)
                    .await
            });
        }

        let mut outcomes = Vec::new();
        while let Some(res) = join_set.join_next().await {
            outcomes.push(res.unwrap().unwrap());
        }
        assert_eq!(outcomes.len(), 5);
        for outcome in outcomes {
            assert!(outcome.released);
            assert_eq!(outcome.reason, ReleaseReason::TargetReached);
            assert_eq!(outcome.vu_count, 5);
        }
    }

    #[tokio::test]
    async fn timeout_reports_not_released_under_all_policy() {
        let manager = RendezvousManager::new();
        let c = cancel();
        let outcome = manager
            .wait(
                "lonely",
                3,
                Some(Duration::from_millis(30)),
                ReleasePolicy::All,
                1,
                &c,
            )
            .await
            .unwrap();
        assert!(!outcome.released);
        assert_eq!(outcome.reason, ReleaseReason::Timeout);
        assert_eq!(outcome.vu_count, 1);
        assert!(outcome.wait_time_ms >= 25);
    }

    #[tokio::test]
    async fn partial_policy_releases_on_timeout() {
        let manager = RendezvousManager::new();
        let c = cancel();
        let outcome = manager
            .wait(
                "partial",
                3,
                Some(Duration::from_millis(30)),
                ReleasePolicy::Partial,
                1,
                &c,
            )
            .await
            .unwrap();
        assert!(outcome.released);
        assert_eq!(outcome.reason, ReleaseReason::Timeout);
    }

    #[tokio::test]
    async fn first_n_releases_in_fifo_order_and_holds_the_rest() {
        let manager = Arc::new(RendezvousManager::new());
        let c = cancel();

        // Two early arrivals park at a barrier with target 2... but we
        // start three waiters; the third must stay parked after the first
        // two are released.
        let mut handles = Vec::new();
        for vu in 0..2u64 {
            let manager = Arc::clone(&manager);
            let c = c.clone();
            handles.push(tokio::spawn(async move {
                manager
                    .wait("fifo", 2, Some(Duration::from_secs(5)), ReleasePolicy::FirstN, vu, &c)
                    .await
            }));
            // Deterministic arrival order.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        for handle in handles {
            let outcome = handle.await.unwrap().unwrap();
            assert!(outcome.released);
            assert_eq!(outcome.vu_count, 2);
        }

        // A late third waiter parks alone until its own timeout.
        let late = manager
            .wait(
                "fifo",
                2,
                Some(Duration::from_millis(30)),
                ReleasePolicy::FirstN,
                99,
                &c,
            )
            .await
            .unwrap();
        assert!(!late.released);
        assert_eq!(late.reason, ReleaseReason::Timeout);
    }

    #[tokio::test]
    async fn reentry_from_same_vu_is_an_error() {
        let manager = Arc::new(RendezvousManager::new());
        let c = cancel();

        let first = {
            let manager = Arc::clone(&manager);
            let c = c.clone();
            tokio::spawn(async move {
                manager
                    .wait("dup", 3, Some(Duration::from_millis(200)), ReleasePolicy::All, 1, &c)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = manager
            .wait("dup", 3, Some(Duration::from_millis(50)), ReleasePolicy::All, 1, &c)
            .await;
        assert!(matches!(second, Err(StampedeError::Rendezvous(_))));

        // Let the first waiter finish via timeout.
        let _ = first.await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_returns_cancelled_error() {
        let manager = Arc::new(RendezvousManager::new());
        let c = cancel();

        let waiter = {
            let manager = Arc::clone(&manager);
            let c = c.clone();
            tokio::spawn(async move {
                manager
                    .wait("cancel", 2, Some(Duration::from_secs(5)), ReleasePolicy::All, 1, &c)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        c.cancel();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(StampedeError::Cancelled)));
        assert_eq!(manager.waiting("cancel").await, 0);
    }

    #[tokio::test]
    async fn zero_target_is_rejected() {
        let manager = RendezvousManager::new();
        let c = cancel();
        let result = manager
            .wait("zero", 0, None, ReleasePolicy::All, 1, &c)
            .await;
        assert!(matches!(result, Err(StampedeError::Rendezvous(_))));
    }

    #[tokio::test]
    async fn different_names_are_independent_barriers() {
        let manager = Arc::new(RendezvousManager::new());
        let c = cancel();

        let a = {
            let manager = Arc::clone(&manager);
            let c = c.clone();
            tokio::spawn(async move {
                manager
                    .wait("a", 2, Some(Duration::from_millis(60)), ReleasePolicy::All, 1, &c)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(manager.waiting("a").await, 1);
        assert_eq!(manager.waiting("b").await, 0);

        let _ = a.await.unwrap();
    }
}

//! Keel wait controller.
//!
//! Polls an object until a readiness predicate holds (or until it is gone,
//! for deletions), backing off exponentially from `base` up to `max`.
//!
//! ```text
//! Pending -> Polling -> Satisfied | TimedOut | Failed | Cancelled
//! ```
//!
//! A wait times out when the next poll would start at or after the deadline,
//! so a deadline of N constant intervals ends right after the Nth poll. A
//! fetch is never allowed to run past the deadline.
//! Terminal states are reported, never retried.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use keel_core::{ErrorKind, KeelResult, WaitConfig};
use keel_kubehub::{Cluster, ObjectRef};
use metrics::counter;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod predicate;

pub use crate::predicate::{AllOf, ConditionMatch, FieldsMatch, ReadinessPredicate, Rollout};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitState {
    Pending,
    Polling,
    Satisfied,
    TimedOut,
    Failed,
    Cancelled,
}

impl WaitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitState::Pending => "pending",
            WaitState::Polling => "polling",
            WaitState::Satisfied => "satisfied",
            WaitState::TimedOut => "timed_out",
            WaitState::Failed => "failed",
            WaitState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, WaitState::Pending | WaitState::Polling)
    }
}

/// What to wait for.
#[derive(Clone)]
pub enum WaitTarget {
    Ready(Arc<dyn ReadinessPredicate>),
    /// The object no longer exists.
    Deleted,
}

impl WaitTarget {
    pub fn ready<P: ReadinessPredicate + 'static>(p: P) -> Self {
        WaitTarget::Ready(Arc::new(p))
    }

    pub fn describe(&self) -> String {
        match self {
            WaitTarget::Ready(p) => p.describe(),
            WaitTarget::Deleted => "deletion".to_string(),
        }
    }
}

impl std::fmt::Debug for WaitTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.describe())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WaitOutcome {
    pub state: WaitState,
    pub polls: u32,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl WaitOutcome {
    pub fn is_satisfied(&self) -> bool {
        self.state == WaitState::Satisfied
    }

    /// `Ok` when satisfied, the matching error otherwise.
    pub fn into_result(self) -> KeelResult<WaitOutcome> {
        match self.state {
            WaitState::Satisfied => Ok(self),
            WaitState::TimedOut => Err(ErrorKind::TimedOut { polls: self.polls, elapsed_ms: self.elapsed_ms }.into()),
            WaitState::Cancelled => Err(ErrorKind::Cancelled.into()),
            _ => Err(ErrorKind::Failed { reason: self.reason.unwrap_or_else(|| "wait failed".into()) }.into()),
        }
    }
}

/// Delay before poll `k + 1` (0-based `k`): `min(base * 2^k, max)`.
pub fn backoff(config: &WaitConfig, k: u32) -> Duration {
    let factor = 1u32 << k.min(20);
    config.base().saturating_mul(factor).min(config.max())
}

#[derive(Clone)]
pub struct WaitController {
    cluster: Arc<dyn Cluster>,
    config: WaitConfig,
}

impl WaitController {
    pub fn new(cluster: Arc<dyn Cluster>, config: WaitConfig) -> Self {
        Self { cluster, config }
    }

    pub fn config(&self) -> &WaitConfig {
        &self.config
    }

    /// Run one wait to a terminal state.
    pub async fn wait(&self, target: &ObjectRef, what: &WaitTarget, cancel: &CancellationToken) -> WaitOutcome {
        let object = target.identity();
        let start = Instant::now();
        let deadline = start + self.config.timeout();
        let mut polls = 0u32;
        let mut fetch_errors = 0u32;
        info!(object = %object, until = %what.describe(), timeout_ms = %self.config.timeout().as_millis(), "wait start");

        let (state, reason) = loop {
            polls += 1;
            counter!("wait_polls", 1u64);

            // a fetch still running at the deadline is abandoned
            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => break (WaitState::Cancelled, None),
                r = tokio::time::timeout_at(deadline, self.cluster.get(target)) => r,
            };
            let Ok(fetched) = fetched else {
                break (WaitState::TimedOut, Some("deadline passed during fetch".to_string()));
            };
            match fetched {
                Err(e) if e.is_cancelled() => break (WaitState::Cancelled, None),
                Err(e) if !e.is_not_found() => {
                    fetch_errors += 1;
                    if fetch_errors > self.config.max_fetch_errors {
                        break (WaitState::Failed, Some(format!("fetch failed {fetch_errors} times in a row: {e}")));
                    }
                    warn!(object = %object, poll = polls, error = %e, "wait fetch failed; retrying");
                }
                res => {
                    fetch_errors = 0;
                    let current = res.ok().flatten();
                    match (what, current) {
                        (WaitTarget::Deleted, None) => break (WaitState::Satisfied, None),
                        (WaitTarget::Deleted, Some(_)) => {}
                        (WaitTarget::Ready(_), None) => {
                            break (WaitState::Failed, Some("object was deleted while waiting".to_string()))
                        }
                        (WaitTarget::Ready(p), Some(obj)) => match p.evaluate(&obj) {
                            Ok(true) => break (WaitState::Satisfied, None),
                            Ok(false) => {}
                            Err(e) => break (WaitState::Failed, Some(format!("readiness check failed: {e}"))),
                        },
                    }
                    debug!(object = %object, poll = polls, "not ready");
                }
            }

            let delay = backoff(&self.config, polls - 1);
            if Instant::now() + delay >= deadline {
                break (WaitState::TimedOut, None);
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break (WaitState::Cancelled, None),
                _ = tokio::time::sleep(delay) => {}
            }
        };

        let outcome = WaitOutcome { state, polls, elapsed_ms: start.elapsed().as_millis() as u64, reason };
        counter!("wait_outcome", 1u64, "state" => state.as_str());
        match state {
            WaitState::Satisfied => info!(object = %object, polls, took_ms = outcome.elapsed_ms, "wait satisfied"),
            _ => warn!(object = %object, state = state.as_str(), polls, reason = ?outcome.reason, "wait ended"),
        }
        outcome
    }
}

//! Eventual-consistency poller.
//!
//! Provisioning finishing does not mean the agent-management service already
//! sees the new agents: containers must start, pull their image and register.
//! The poller bridges that gap with a bounded wait. Every policy has a
//! deadline, so VALIDATE cannot block indefinitely.

use crate::error::{HarnessError, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// How long and how often to re-check an eventually-consistent value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SettlePolicy {
    /// Wait before the first check.
    pub initial_delay: Duration,
    /// Wait between the first and second check.
    pub interval: Duration,
    /// Upper bound for the backoff interval.
    pub max_interval: Duration,
    /// Factor applied to the interval after each miss.
    pub multiplier: f64,
    /// Total time budget measured from the start of polling.
    pub deadline: Duration,
}

impl SettlePolicy {
    /// Sleep for `wait`, then check exactly once.
    pub fn fixed(wait: Duration) -> Self {
        Self {
            initial_delay: wait,
            interval: wait,
            max_interval: wait,
            multiplier: 1.0,
            deadline: wait,
        }
    }

    /// Poll with backoff until `deadline`.
    pub fn bounded(deadline: Duration) -> Self {
        Self {
            initial_delay: Duration::from_secs(10).min(deadline),
            interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(30),
            multiplier: 1.5,
            deadline,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_interval(mut self, interval: Duration, max_interval: Duration) -> Self {
        self.interval = interval;
        self.max_interval = max_interval;
        self
    }

    fn next_interval(&self, current: Duration) -> Duration {
        current
            .mul_f64(self.multiplier.max(1.0))
            .min(self.max_interval)
            .max(MIN_INTERVAL)
    }
}

/// Result of one settle wait.
#[derive(Debug, Clone, PartialEq)]
pub struct PollOutcome<T> {
    pub expected: T,
    pub observed: T,
    pub matches_expected: bool,
    pub attempts: u32,
    pub elapsed: Duration,
}

impl<T: Debug> PollOutcome<T> {
    /// Turn a non-matching outcome into a `PostconditionMismatch`.
    pub fn into_result(self, check: &str) -> Result<T> {
        if self.matches_expected {
            return Ok(self.observed);
        }
        Err(HarnessError::PostconditionMismatch {
            check: check.to_string(),
            expected: format!("{:?}", self.expected),
            observed: format!("{:?}", self.observed),
            attempts: self.attempts,
        })
    }
}

/// Sleep for `wait`, then run `check` once.
pub async fn wait_then_check<T, F, Fut>(wait: Duration, expected: T, check: F) -> Result<PollOutcome<T>>
where
    T: PartialEq + Debug,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let start = Instant::now();
    sleep(wait).await;
    let observed = check().await?;
    Ok(PollOutcome {
        matches_expected: observed == expected,
        expected,
        observed,
        attempts: 1,
        elapsed: start.elapsed(),
    })
}

/// Re-run `check` until it returns `expected` or the policy deadline passes.
///
/// The final check happens at the deadline, so a bounded policy never
/// observes less than a fixed wait of the same length. Errors from `check`
/// are returned immediately.
pub async fn poll_until<T, F, Fut>(
    policy: &SettlePolicy,
    expected: T,
    mut check: F,
) -> Result<PollOutcome<T>>
where
    T: PartialEq + Debug,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let start = Instant::now();
    let deadline = start + policy.deadline;
    let mut interval = policy.interval.max(MIN_INTERVAL);
    let mut attempts = 0u32;

    sleep(policy.initial_delay.min(policy.deadline)).await;

    loop {
        attempts += 1;
        let observed = check().await?;
        let now = Instant::now();

        if observed == expected || now >= deadline {
            debug!(
                attempts,
                elapsed_ms = start.elapsed().as_millis() as u64,
                matched = observed == expected,
                "settle wait finished"
            );
            return Ok(PollOutcome {
                matches_expected: observed == expected,
                expected,
                observed,
                attempts,
                elapsed: start.elapsed(),
            });
        }

        debug!(attempt = attempts, observed = ?observed, expected = ?expected, "not settled yet");
        sleep(interval.min(deadline - now)).await;
        interval = policy.next_interval(interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn counter_check(counter: &Arc<AtomicU32>) -> impl FnMut() -> std::future::Ready<Result<u32>> {
        let counter = Arc::clone(counter);
        move || std::future::ready(Ok(counter.fetch_add(1, Ordering::SeqCst) + 1))
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_policy_checks_once_after_wait() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = SettlePolicy::fixed(Duration::from_secs(45));

        let outcome = poll_until(&policy, 5, counter_check(&calls)).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.attempts, 1);
        assert!(!outcome.matches_expected);
        assert!(outcome.elapsed >= Duration::from_secs(45));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_policy_stops_when_matched() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = SettlePolicy::bounded(Duration::from_secs(150));

        let outcome = poll_until(&policy, 3, counter_check(&calls)).await.unwrap();

        assert!(outcome.matches_expected);
        assert_eq!(outcome.observed, 3);
        assert_eq!(outcome.attempts, 3);
        assert!(outcome.elapsed < Duration::from_secs(150));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_policy_respects_deadline() {
        let policy = SettlePolicy::bounded(Duration::from_secs(60))
            .with_interval(Duration::from_secs(7), Duration::from_secs(20));

        let outcome = poll_until(&policy, 2, || async { Ok(0) }).await.unwrap();

        assert!(!outcome.matches_expected);
        assert!(outcome.attempts > 1);
        assert!(outcome.elapsed >= Duration::from_secs(60));
        assert!(outcome.elapsed < Duration::from_secs(61));
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_error_propagates_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&calls);
        let policy = SettlePolicy::bounded(Duration::from_secs(60));

        let err = poll_until(&policy, 1usize, move || {
            seen.fetch_add(1, Ordering::SeqCst);
            async { Err(HarnessError::pool_not_found("e2e-agents-1")) }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, HarnessError::NotFound { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_then_check() {
        let outcome = wait_then_check(Duration::from_secs(45), 2usize, || async { Ok(2) })
            .await
            .unwrap();
        assert!(outcome.matches_expected);
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.elapsed >= Duration::from_secs(45));
    }

    #[test]
    fn test_into_result_mismatch_carries_values() {
        let outcome = PollOutcome {
            expected: 2usize,
            observed: 1usize,
            matches_expected: false,
            attempts: 4,
            elapsed: Duration::from_secs(45),
        };
        match outcome.into_result("agents in pool e2e-agents-1") {
            Err(HarnessError::PostconditionMismatch {
                expected,
                observed,
                attempts,
                ..
            }) => {
                assert_eq!(expected, "2");
                assert_eq!(observed, "1");
                assert_eq!(attempts, 4);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = SettlePolicy::bounded(Duration::from_secs(300));
        let mut interval = policy.interval;
        for _ in 0..20 {
            interval = policy.next_interval(interval);
        }
        assert_eq!(interval, policy.max_interval);
    }
}

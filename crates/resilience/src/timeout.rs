//! Hard timeout enforcement for wrapped calls
//!
//! [`TimeoutGuard`] wraps an operation with a wall-clock budget and tracks it
//! in an active-operations table while it runs. The table entry is removed on
//! every exit path, so the table never leaks and can be trusted by health
//! probes.
//!
//! Cancellation is cooperative: the async variant drops the wrapped future
//! when the budget expires, which stops it at its next suspension point. The
//! blocking variant cannot preempt a running call at all; it measures elapsed
//! time after the call returns and reports a timeout after the fact. This is
//! a design limitation, not a bug — callers that need guaranteed preemption
//! must run the risky call in an isolated, killable worker.

use std::future::Future;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::warn;

use crate::clock::{Clock, SystemClock};
use crate::error::{ServiceError, ServiceResult};

/// Default wall-clock budget when the caller does not supply one
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Removes an active-operations entry when the wrapped call exits, on every
/// path.
struct ActiveEntryGuard<'a> {
    table: &'a DashMap<String, Instant>,
    name: &'a str,
}

impl Drop for ActiveEntryGuard<'_> {
    fn drop(&mut self) {
        self.table.remove(self.name);
    }
}

/// Enforces wall-clock budgets and tracks in-flight operations.
#[derive(Debug)]
pub struct TimeoutGuard<C: Clock = SystemClock> {
    default_timeout: Duration,
    active: DashMap<String, Instant>,
    clock: C,
}

impl Default for TimeoutGuard<SystemClock> {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl TimeoutGuard<SystemClock> {
    /// Create a guard with the given default budget
    pub fn new(default_timeout: Duration) -> Self {
        Self::with_clock(default_timeout, SystemClock)
    }
}

impl<C: Clock> TimeoutGuard<C> {
    /// Create a guard with a custom clock (useful for testing probes)
    pub fn with_clock(default_timeout: Duration, clock: C) -> Self {
        Self { default_timeout, active: DashMap::new(), clock }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Run an async operation under a hard wall-clock budget.
    ///
    /// On expiry the wrapped future is dropped (best-effort cooperative
    /// cancellation) and a [`ServiceError::Timeout`] carrying the operation
    /// name, budget and elapsed time is returned.
    pub async fn with_timeout<T, F>(
        &self,
        operation: F,
        timeout: Option<Duration>,
        operation_name: &str,
    ) -> ServiceResult<T>
    where
        F: Future<Output = ServiceResult<T>>,
    {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let start = self.clock.now();
        self.active.insert(operation_name.to_string(), start);
        let _entry = ActiveEntryGuard { table: &self.active, name: operation_name };

        match tokio::time::timeout(timeout, operation).await {
            Ok(result) => result,
            Err(_) => {
                let elapsed = self.clock.now().duration_since(start);
                warn!(
                    operation = operation_name,
                    timeout_ms = timeout.as_millis() as u64,
                    "operation timed out"
                );
                Err(ServiceError::timeout(operation_name, timeout, elapsed))
            }
        }
    }

    /// Run a blocking operation and check its budget after the fact.
    ///
    /// A blocked call cannot be interrupted here; if it eventually returns
    /// having exceeded the budget, its result is discarded and a
    /// [`ServiceError::Timeout`] is returned instead.
    pub fn with_timeout_blocking<T, F>(
        &self,
        operation: F,
        timeout: Option<Duration>,
        operation_name: &str,
    ) -> ServiceResult<T>
    where
        F: FnOnce() -> ServiceResult<T>,
    {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let start = self.clock.now();
        self.active.insert(operation_name.to_string(), start);
        let _entry = ActiveEntryGuard { table: &self.active, name: operation_name };

        let result = operation();
        let elapsed = self.clock.now().duration_since(start);
        if elapsed > timeout {
            warn!(
                operation = operation_name,
                timeout_ms = timeout.as_millis() as u64,
                elapsed_ms = elapsed.as_millis() as u64,
                "blocking operation exceeded its budget"
            );
            return Err(ServiceError::timeout(operation_name, timeout, elapsed));
        }
        result
    }

    /// Whether a tracked operation has consumed more than `threshold` of the
    /// default budget. Intended for external health probes.
    pub fn is_operation_timeout_likely(&self, operation_name: &str, threshold: f64) -> bool {
        match self.active.get(operation_name) {
            Some(start) => {
                let elapsed = self.clock.now().duration_since(*start);
                elapsed > self.default_timeout.mul_f64(threshold)
            }
            None => false,
        }
    }

    /// Names and ages of currently tracked operations
    pub fn active_operations(&self) -> Vec<(String, Duration)> {
        let now = self.clock.now();
        self.active
            .iter()
            .map(|entry| (entry.key().clone(), now.duration_since(*entry.value())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::clock::MockClock;

    use super::*;

    #[tokio::test]
    async fn test_success_passes_through_and_cleans_up() {
        let guard = TimeoutGuard::new(Duration::from_secs(1));
        assert!(guard.active_operations().is_empty());

        let result = guard.with_timeout(async { Ok(7) }, None, "quick_op").await;

        assert_eq!(result.expect("should succeed"), 7);
        assert!(guard.active_operations().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_raises_and_cleans_up() {
        let guard = TimeoutGuard::new(Duration::from_secs(300));

        let started = Instant::now();
        let result: ServiceResult<()> = guard
            .with_timeout(
                async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(())
                },
                Some(Duration::from_millis(20)),
                "slow_op",
            )
            .await;

        assert!(started.elapsed() < Duration::from_secs(5), "must not wait for the operation");
        match result {
            Err(ServiceError::Timeout { operation, timeout, .. }) => {
                assert_eq!(operation, "slow_op");
                assert_eq!(timeout, Duration::from_millis(20));
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
        assert!(guard.active_operations().is_empty());
    }

    #[tokio::test]
    async fn test_operation_error_cleans_up() {
        let guard = TimeoutGuard::new(Duration::from_secs(1));

        let result: ServiceResult<()> = guard
            .with_timeout(async { Err(ServiceError::from("boom")) }, None, "failing_op")
            .await;

        assert!(result.is_err());
        assert!(guard.active_operations().is_empty());
    }

    #[tokio::test]
    async fn test_operation_is_tracked_while_running() {
        let guard = TimeoutGuard::new(Duration::from_secs(1));

        let result = guard
            .with_timeout(
                async {
                    let active = guard.active_operations();
                    assert_eq!(active.len(), 1);
                    assert_eq!(active[0].0, "tracked_op");
                    Ok(())
                },
                None,
                "tracked_op",
            )
            .await;

        assert!(result.is_ok());
        assert!(guard.active_operations().is_empty());
    }

    #[test]
    fn test_blocking_over_budget_is_reported_after_the_fact() {
        let guard = TimeoutGuard::new(Duration::from_secs(300));

        let result = guard.with_timeout_blocking(
            || {
                std::thread::sleep(Duration::from_millis(30));
                Ok("finished anyway")
            },
            Some(Duration::from_millis(5)),
            "blocking_op",
        );

        match result {
            Err(ServiceError::Timeout { operation, elapsed, .. }) => {
                assert_eq!(operation, "blocking_op");
                assert!(elapsed >= Duration::from_millis(30));
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
        assert!(guard.active_operations().is_empty());
    }

    #[test]
    fn test_blocking_within_budget_passes_through() {
        let guard = TimeoutGuard::new(Duration::from_secs(1));
        let result = guard.with_timeout_blocking(|| Ok(3), None, "blocking_op");
        assert_eq!(result.expect("should succeed"), 3);
        assert!(guard.active_operations().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_likely_probe() {
        let clock = MockClock::new();
        let guard = TimeoutGuard::with_clock(Duration::from_secs(100), clock.clone());

        assert!(!guard.is_operation_timeout_likely("slow_op", 0.8), "untracked name");

        let result = guard
            .with_timeout(
                async {
                    assert!(!guard.is_operation_timeout_likely("slow_op", 0.8));
                    clock.advance(Duration::from_secs(90));
                    assert!(guard.is_operation_timeout_likely("slow_op", 0.8));
                    Ok(())
                },
                Some(Duration::from_secs(1)),
                "slow_op",
            )
            .await;

        assert!(result.is_ok());
        assert!(!guard.is_operation_timeout_likely("slow_op", 0.8), "entry removed on exit");
    }
}

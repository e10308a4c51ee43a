//! Orchestration of the resilience layers
//!
//! [`ResilienceEngine`] wraps a call as: circuit breaker gate → timeout guard
//! → recovery decision on failure → sleep/retry or surface. One engine
//! instance protects one external dependency and is passed by reference to
//! every call site; there is no ambient global instance.

use std::future::Future;

use tracing::{debug, warn};

use crate::breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus};
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, ResilienceConfig};
use crate::error::{ServiceError, ServiceResult};
use crate::recovery::RecoveryEngine;
use crate::timeout::TimeoutGuard;

/// Introspection snapshot for a health-check collaborator.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineStatus {
    pub enabled: bool,
    pub breaker: CircuitBreakerStatus,
}

/// Composes breaker, timeout guard and recovery engine around a dependency.
#[derive(Debug)]
pub struct ResilienceEngine<C: Clock = SystemClock> {
    config: ResilienceConfig,
    breaker: CircuitBreaker<C>,
    timeout: TimeoutGuard<C>,
    recovery: RecoveryEngine,
}

impl ResilienceEngine<SystemClock> {
    /// Create an engine protecting the named dependency
    pub fn new<S: Into<String>>(
        dependency: S,
        config: ResilienceConfig,
        breaker_config: CircuitBreakerConfig,
    ) -> Result<Self, ConfigError> {
        Self::with_clock(dependency, config, breaker_config, SystemClock)
    }
}

impl<C: Clock + Clone> ResilienceEngine<C> {
    /// Create an engine with a custom clock (useful for testing)
    pub fn with_clock<S: Into<String>>(
        dependency: S,
        config: ResilienceConfig,
        breaker_config: CircuitBreakerConfig,
        clock: C,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let breaker = CircuitBreaker::with_clock(dependency, breaker_config, clock.clone())?;
        let timeout = TimeoutGuard::with_clock(config.default_timeout, clock);
        Ok(Self { config, breaker, timeout, recovery: RecoveryEngine::new() })
    }
}

impl<C: Clock> ResilienceEngine<C> {
    /// Run an async operation under the full resilience stack.
    ///
    /// With the kill switch off, the operation is called once, directly, with
    /// no breaker, timeout or retry involvement. Otherwise the loop is
    /// bounded by `config.max_attempts` regardless of what the recovery
    /// decisions ask for, and the last observed error is surfaced when the
    /// bound is hit.
    pub async fn run<T, F, Fut>(&self, operation_name: &str, mut operation: F) -> ServiceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ServiceResult<T>>,
    {
        if !self.config.enabled {
            return operation().await;
        }

        let mut attempt = 0u32;
        loop {
            if !self.breaker.can_execute() {
                debug!(
                    operation = operation_name,
                    dependency = self.breaker.name(),
                    "rejected by open circuit breaker"
                );
                return Err(ServiceError::CircuitOpen {
                    dependency: self.breaker.name().to_string(),
                });
            }

            let result = self
                .timeout
                .with_timeout(operation(), Some(self.config.default_timeout), operation_name)
                .await;

            match result {
                Ok(value) => {
                    self.breaker.record_success();
                    self.recovery.reset_retry_count(operation_name);
                    return Ok(value);
                }
                Err(error) => {
                    self.breaker.record_failure();
                    attempt += 1;
                    if attempt >= self.config.max_attempts {
                        warn!(
                            operation = operation_name,
                            attempts = attempt,
                            error = %error,
                            "attempt budget exhausted"
                        );
                        return Err(error);
                    }

                    let decision = self.recovery.handle_error(&error, operation_name);
                    if !decision.should_retry {
                        return Err(error);
                    }
                    if let Some(adjustment) = &decision.adjusted_input {
                        debug!(
                            operation = operation_name,
                            ?adjustment,
                            "recovery suggested an input adjustment"
                        );
                    }
                    if !decision.retry_delay.is_zero() {
                        tokio::time::sleep(decision.retry_delay).await;
                    }
                }
            }
        }
    }

    /// Breaker protecting this engine's dependency
    pub fn breaker(&self) -> &CircuitBreaker<C> {
        &self.breaker
    }

    /// Recovery engine, for call sites that consume decisions directly
    pub fn recovery(&self) -> &RecoveryEngine {
        &self.recovery
    }

    /// Timeout guard, for health probes over in-flight operations
    pub fn timeout_guard(&self) -> &TimeoutGuard<C> {
        &self.timeout
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// Snapshot for a health-check collaborator
    pub fn status(&self) -> EngineStatus {
        EngineStatus { enabled: self.config.enabled, breaker: self.breaker.status() }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use crate::breaker::CircuitState;

    use super::*;

    fn fast_config() -> ResilienceConfig {
        ResilienceConfig {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            default_timeout: Duration::from_millis(200),
            ..ResilienceConfig::default()
        }
    }

    fn engine(config: ResilienceConfig) -> ResilienceEngine {
        ResilienceEngine::new("warehouse", config, CircuitBreakerConfig::default())
            .expect("valid engine")
    }

    #[tokio::test]
    async fn test_success_records_and_resets() {
        let engine = engine(fast_config());

        // Prime a recovery counter, then confirm success clears it
        engine.recovery().handle_error(&"network error".into(), "op");
        assert_eq!(engine.recovery().retry_count("op"), 1);

        let result = engine.run("op", || async { Ok(5) }).await;
        assert_eq!(result.expect("should succeed"), 5);
        assert_eq!(engine.recovery().retry_count("op"), 0);
        assert_eq!(engine.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let engine = engine(fast_config());
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let result = engine
            .run("op", || {
                let calls = Arc::clone(&calls_clone);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ServiceError::from("network error"))
                    } else {
                        Ok("recovered")
                    }
                }
            })
            .await;

        assert_eq!(result.expect("should recover"), "recovered");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempt_budget_bounds_the_loop() {
        let engine = engine(fast_config());
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let result: ServiceResult<()> = engine
            .run("op", || {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ServiceError::from("network error"))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3, "bounded by max_attempts");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_user_guided_failures_surface_without_retry() {
        let engine = engine(fast_config());
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let result: ServiceResult<()> = engine
            .run("op", || {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ServiceError::from("Syntax error near SELECT"))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_open_breaker_rejects_without_calling() {
        let engine = engine(fast_config());
        for _ in 0..5 {
            engine.breaker().record_failure();
        }
        assert_eq!(engine.breaker().state(), CircuitState::Open);

        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        let result: ServiceResult<()> = engine
            .run("op", || {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0, "operation must not run");
        match result {
            Err(ServiceError::CircuitOpen { dependency }) => assert_eq!(dependency, "warehouse"),
            other => panic!("expected CircuitOpen, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_kill_switch_is_a_direct_passthrough() {
        let config = ResilienceConfig { enabled: false, ..fast_config() };
        let engine = engine(config);

        // Breaker open, yet the call still goes straight through
        for _ in 0..5 {
            engine.breaker().record_failure();
        }

        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        let result = engine
            .run("op", || {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("direct")
                }
            })
            .await;
        assert_eq!(result.expect("passthrough succeeds"), "direct");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // And failures are surfaced raw, exactly once
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        let result: ServiceResult<()> = engine
            .run("op", || {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ServiceError::from("network error"))
                }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1, "no retries when disabled");
        assert!(matches!(result, Err(ServiceError::Message(_))));
    }

    #[tokio::test]
    async fn test_timeouts_flow_through_the_stack() {
        let config = ResilienceConfig {
            default_timeout: Duration::from_millis(10),
            max_attempts: 1,
            ..fast_config()
        };
        let engine = engine(config);

        let result: ServiceResult<()> = engine
            .run("slow_op", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        match result {
            Err(ServiceError::Timeout { operation, .. }) => assert_eq!(operation, "slow_op"),
            other => panic!("expected Timeout, got {other:?}"),
        }
        assert!(engine.breaker().status().failure_count > 0, "timeouts count against the breaker");
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let engine = engine(fast_config());
        engine.breaker().record_failure();

        let status = engine.status();
        assert!(status.enabled);
        assert_eq!(status.breaker.failure_count, 1);

        let json = serde_json::to_string(&status).expect("serializes");
        assert!(json.contains("failure_count"));
    }
}

//! Retry strategy and executor
//!
//! A [`RetryStrategy`] is an immutable policy value: attempt bound, delay
//! shape, and jitter flag. Delay calculation is a pure function over an
//! injectable random source so it can be pinned down in tests with a seeded
//! generator. The [`RetryExecutor`] runs an operation under a strategy,
//! classifying every failure and enforcing the classifier's retry-eligibility
//! verdict. It offers an async and a blocking variant that share one decision
//! routine, so the two paths cannot drift apart.

use std::time::{Duration, Instant};

use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

use crate::classifier::{ErrorCategory, ErrorClassifier};
use crate::config::ConfigError;
use crate::error::{ServiceError, ServiceResult};

/// Jitter band applied around the computed delay (±10%)
pub const JITTER_FACTOR: f64 = 0.1;

/// Floor for jittered delays, so a perturbed delay never reaches zero
pub const MIN_RETRY_DELAY: Duration = Duration::from_millis(100);

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Immutable retry policy for one class of operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryStrategy {
    /// Maximum number of calls to the wrapped operation (first try included)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Cap applied to every computed delay
    pub max_delay: Duration,
    /// Factor by which the delay grows per attempt
    pub backoff_multiplier: f64,
    /// Whether to perturb delays to avoid synchronized retry storms
    pub jitter: bool,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter: true,
        }
    }
}

impl RetryStrategy {
    /// Create a strategy builder
    pub fn builder() -> RetryStrategyBuilder {
        RetryStrategyBuilder::new()
    }

    /// Preset for SQL generation: user-facing, fail reasonably fast
    pub fn sql_generation() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Preset for transient warehouse errors: infrastructure level, patient
    pub fn warehouse_transient() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Preset for LLM provider timeouts: two tries, then surface
    pub fn llm_timeout() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Preset for rate limits: long delays, no jitter so an exact
    /// provider-supplied Retry-After is honored as-is
    pub fn rate_limit() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    /// Validate the strategy invariants
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts must be at least 1"));
        }
        if self.base_delay.is_zero() {
            return Err(ConfigError::invalid("base_delay must be greater than zero"));
        }
        if self.max_delay < self.base_delay {
            return Err(ConfigError::invalid("max_delay must be at least base_delay"));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid("backoff_multiplier must be at least 1.0"));
        }
        Ok(())
    }

    /// Calculate the delay before the retry that follows `attempt`
    /// (zero-based).
    ///
    /// `delay = min(base_delay * multiplier^attempt, max_delay)`, optionally
    /// perturbed by a uniform draw from ±[`JITTER_FACTOR`] and floored at
    /// [`MIN_RETRY_DELAY`]. The result never exceeds `max_delay`. Passing a
    /// seeded generator makes the jittered value deterministic.
    pub fn calculate_delay<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let exponential =
            self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = exponential.min(self.max_delay.as_secs_f64());

        let delay = if self.jitter {
            let band = capped * JITTER_FACTOR;
            let jittered = capped + rng.gen_range(-band..=band);
            jittered.max(MIN_RETRY_DELAY.as_secs_f64())
        } else {
            capped
        };

        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

/// Builder for [`RetryStrategy`] with validation at `build` time.
#[derive(Debug, Default)]
pub struct RetryStrategyBuilder {
    strategy: RetryStrategy,
}

impl RetryStrategyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.strategy.max_attempts = attempts;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.strategy.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.strategy.max_delay = delay;
        self
    }

    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.strategy.backoff_multiplier = multiplier;
        self
    }

    pub fn jitter(mut self, jitter: bool) -> Self {
        self.strategy.jitter = jitter;
        self
    }

    pub fn build(self) -> Result<RetryStrategy, ConfigError> {
        self.strategy.validate()?;
        Ok(self.strategy)
    }
}

/// Per-call record of retry attempts, kept for diagnostics.
#[derive(Debug, Clone)]
pub struct RetryContext {
    pub operation_name: String,
    pub attempt_count: u32,
    pub errors: Vec<String>,
    pub start_time: Instant,
}

impl RetryContext {
    pub fn new<S: Into<String>>(operation_name: S) -> Self {
        Self {
            operation_name: operation_name.into(),
            attempt_count: 0,
            errors: Vec::new(),
            start_time: Instant::now(),
        }
    }

    /// Record one failed attempt
    pub fn record_attempt(&mut self, error: &ServiceError) {
        self.attempt_count += 1;
        self.errors.push(format!("attempt {}: {}", self.attempt_count, error));
    }

    /// One-line summary for logs
    pub fn summary(&self) -> String {
        format!(
            "operation={} attempts={} duration={:.2}s errors={}",
            self.operation_name,
            self.attempt_count,
            self.start_time.elapsed().as_secs_f64(),
            self.errors.len()
        )
    }
}

/// Terminal failure of a retried operation. Always carries the last observed
/// error; a permanent error is surfaced after exactly one attempt.
#[derive(Debug, Error)]
pub enum RetryError {
    /// The failure was classified `Permanent` and was not retried
    #[error("operation '{operation}' failed with a non-retryable error: {source}")]
    Permanent {
        operation: String,
        #[source]
        source: ServiceError,
    },

    /// Every allowed attempt failed; `source` is the last error observed
    #[error("operation '{operation}' exhausted {attempts} attempts; last error: {source}")]
    Exhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: ServiceError,
    },
}

impl RetryError {
    /// The underlying service failure
    pub fn inner(&self) -> &ServiceError {
        match self {
            Self::Permanent { source, .. } | Self::Exhausted { source, .. } => source,
        }
    }

    /// Consume the wrapper and return the underlying failure
    pub fn into_inner(self) -> ServiceError {
        match self {
            Self::Permanent { source, .. } | Self::Exhausted { source, .. } => source,
        }
    }
}

/// What the executor does after a failed attempt.
#[derive(Debug, PartialEq)]
enum Step {
    GiveUp,
    Exhausted,
    RetryAfter(Duration),
}

/// Runs operations under a [`RetryStrategy`], classifying every failure.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    strategy: RetryStrategy,
    classifier: ErrorClassifier,
}

impl RetryExecutor {
    /// Create an executor with the default classifier
    pub fn new(strategy: RetryStrategy) -> Self {
        Self { strategy, classifier: ErrorClassifier::new() }
    }

    /// Create an executor with a custom classifier
    pub fn with_classifier(strategy: RetryStrategy, classifier: ErrorClassifier) -> Self {
        Self { strategy, classifier }
    }

    pub fn strategy(&self) -> &RetryStrategy {
        &self.strategy
    }

    /// Decide the next step after a failed attempt (zero-based).
    ///
    /// This single routine backs both the async and the blocking execution
    /// paths. Permanent failures stop immediately regardless of remaining
    /// attempts; rate-limited failures prefer the provider-supplied
    /// Retry-After hint, capped at `max_delay`.
    fn next_step<R: Rng>(&self, error: &ServiceError, attempt: u32, rng: &mut R) -> Step {
        let (category, _) = self.classifier.classify(error);
        if !category.is_retry_eligible() {
            return Step::GiveUp;
        }
        if attempt + 1 >= self.strategy.max_attempts {
            return Step::Exhausted;
        }

        let delay = match (category, error.retry_after()) {
            (ErrorCategory::RateLimit, Some(hint)) => hint.min(self.strategy.max_delay),
            _ => self.strategy.calculate_delay(attempt, rng),
        };
        Step::RetryAfter(delay)
    }

    /// Execute an async operation under the strategy.
    ///
    /// The operation is invoked at most `max_attempts` times. Delays suspend
    /// the task cooperatively via `tokio::time::sleep`.
    pub async fn execute<T, F, Fut>(
        &self,
        operation_name: &str,
        mut operation: F,
    ) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = ServiceResult<T>>,
    {
        let mut context = RetryContext::new(operation_name);
        let mut rng = rand::thread_rng();
        let mut attempt = 0;

        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(
                            operation = operation_name,
                            attempts = attempt + 1,
                            "operation succeeded after retries"
                        );
                    }
                    return Ok(value);
                }
                Err(error) => {
                    context.record_attempt(&error);
                    match self.next_step(&error, attempt, &mut rng) {
                        Step::GiveUp => {
                            warn!(operation = operation_name, error = %error, "non-retryable error");
                            return Err(RetryError::Permanent {
                                operation: operation_name.to_string(),
                                source: error,
                            });
                        }
                        Step::Exhausted => {
                            warn!(summary = %context.summary(), "retry attempts exhausted");
                            return Err(RetryError::Exhausted {
                                operation: operation_name.to_string(),
                                attempts: attempt + 1,
                                source: error,
                            });
                        }
                        Step::RetryAfter(delay) => {
                            warn!(
                                operation = operation_name,
                                attempt = attempt + 1,
                                delay_ms = delay.as_millis() as u64,
                                error = %error,
                                "attempt failed, retrying"
                            );
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                        }
                    }
                }
            }
        }
    }

    /// Execute a blocking operation under the strategy.
    ///
    /// Identical decision logic to [`execute`](Self::execute); delays block
    /// the calling thread with `std::thread::sleep`. Do not call from an
    /// async context.
    pub fn execute_blocking<T, F>(
        &self,
        operation_name: &str,
        mut operation: F,
    ) -> Result<T, RetryError>
    where
        F: FnMut() -> ServiceResult<T>,
    {
        let mut context = RetryContext::new(operation_name);
        let mut rng = rand::thread_rng();
        let mut attempt = 0;

        loop {
            match operation() {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(
                            operation = operation_name,
                            attempts = attempt + 1,
                            "operation succeeded after retries"
                        );
                    }
                    return Ok(value);
                }
                Err(error) => {
                    context.record_attempt(&error);
                    match self.next_step(&error, attempt, &mut rng) {
                        Step::GiveUp => {
                            warn!(operation = operation_name, error = %error, "non-retryable error");
                            return Err(RetryError::Permanent {
                                operation: operation_name.to_string(),
                                source: error,
                            });
                        }
                        Step::Exhausted => {
                            warn!(summary = %context.summary(), "retry attempts exhausted");
                            return Err(RetryError::Exhausted {
                                operation: operation_name.to_string(),
                                attempts: attempt + 1,
                                source: error,
                            });
                        }
                        Step::RetryAfter(delay) => {
                            warn!(
                                operation = operation_name,
                                attempt = attempt + 1,
                                delay_ms = delay.as_millis() as u64,
                                error = %error,
                                "attempt failed, retrying"
                            );
                            std::thread::sleep(delay);
                            attempt += 1;
                        }
                    }
                }
            }
        }
    }
}

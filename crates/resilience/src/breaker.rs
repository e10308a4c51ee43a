//! Per-dependency circuit breaker
//!
//! One breaker instance protects one external dependency (the LLM provider,
//! the warehouse). It tracks failures within a sliding window and, once a
//! threshold is crossed, rejects calls for a cooldown period before letting a
//! trial call through. State lives behind a single mutex per instance, so
//! transitions are linearizable; different breakers share nothing.

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::ConfigError;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum CircuitState {
    /// Circuit is closed, calls flow through
    Closed,
    /// Circuit is open, calls are rejected
    Open,
    /// Probe state: one trial call is allowed to test recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures within `window` required to open the circuit
    pub failure_threshold: u32,
    /// Sliding window over which failures are counted
    pub window: Duration,
    /// Time the circuit stays open before allowing a trial call
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(300),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid("failure_threshold must be at least 1"));
        }
        if self.window.is_zero() {
            return Err(ConfigError::invalid("window must be greater than zero"));
        }
        if self.cooldown.is_zero() {
            return Err(ConfigError::invalid("cooldown must be greater than zero"));
        }
        Ok(())
    }
}

/// Builder for [`CircuitBreakerConfig`]
#[derive(Debug, Default)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    pub fn new() -> Self {
        Self { config: CircuitBreakerConfig::default() }
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.config.window = window;
        self
    }

    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.config.cooldown = cooldown;
        self
    }

    pub fn build(self) -> Result<CircuitBreakerConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Point-in-time snapshot of breaker health for status endpoints.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CircuitBreakerStatus {
    pub state: CircuitState,
    pub failure_count: u32,
    /// Time since the most recent recorded failure
    pub last_failure_age: Option<Duration>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    first_failure_time: Option<Instant>,
    last_failure_time: Option<Instant>,
}

/// Health state machine for one protected dependency.
///
/// Invariants: closed→open only when `failure_count >= failure_threshold`
/// within `window`; open→half-open only after `cooldown` has elapsed since
/// the last failure; half-open→closed on the next success; half-open→open on
/// the next failure.
#[derive(Debug)]
pub struct CircuitBreaker<C: Clock = SystemClock> {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    clock: C,
}

impl CircuitBreaker<SystemClock> {
    /// Create a breaker named after the dependency it protects
    pub fn new<S: Into<String>>(
        name: S,
        config: CircuitBreakerConfig,
    ) -> Result<Self, ConfigError> {
        Self::with_clock(name, config, SystemClock)
    }

    /// Create a breaker with default configuration
    pub fn with_defaults<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            config: CircuitBreakerConfig::default(),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                first_failure_time: None,
                last_failure_time: None,
            }),
            clock: SystemClock,
        }
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a breaker with a custom clock (useful for testing)
    pub fn with_clock<S: Into<String>>(
        name: S,
        config: CircuitBreakerConfig,
        clock: C,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                first_failure_time: None,
                last_failure_time: None,
            }),
            clock,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check whether a call may proceed.
    ///
    /// An open circuit whose cooldown has elapsed transitions to half-open
    /// here, atomically with the check, so exactly one caller observes the
    /// transition. Half-open allows the probe through.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled_down = inner
                    .last_failure_time
                    .is_some_and(|last| self.clock.now().duration_since(last) > self.config.cooldown);
                if cooled_down {
                    inner.state = CircuitState::HalfOpen;
                    info!(breaker = %self.name, "circuit breaker half-open, allowing trial call");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => true,
        }
    }

    /// Record a failed call against this dependency.
    pub fn record_failure(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        // A failure outside the window starts a fresh run
        let stale = inner
            .first_failure_time
            .is_some_and(|first| now.duration_since(first) > self.config.window);
        if stale {
            inner.failure_count = 0;
            inner.first_failure_time = None;
        }

        if inner.first_failure_time.is_none() {
            inner.first_failure_time = Some(now);
        }
        inner.failure_count += 1;
        inner.last_failure_time = Some(now);

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                warn!(breaker = %self.name, "trial call failed, circuit breaker re-opened");
            }
            CircuitState::Closed => {
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    warn!(
                        breaker = %self.name,
                        failures = inner.failure_count,
                        "circuit breaker opened"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a successful call. Closes the circuit unconditionally and
    /// resets the failure count, including from half-open.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        let was_half_open = inner.state == CircuitState::HalfOpen;
        inner.failure_count = 0;
        inner.first_failure_time = None;
        inner.state = CircuitState::Closed;
        if was_half_open {
            info!(breaker = %self.name, "trial call succeeded, circuit breaker closed");
        }
    }

    /// Current state without side effects
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Consistent snapshot for health checks
    pub fn status(&self) -> CircuitBreakerStatus {
        let inner = self.inner.lock();
        CircuitBreakerStatus {
            state: inner.state,
            failure_count: inner.failure_count,
            last_failure_age: inner
                .last_failure_time
                .map(|last| self.clock.now().duration_since(last)),
        }
    }

    /// Force the breaker back to closed, clearing all counts
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.first_failure_time = None;
        inner.last_failure_time = None;
        info!(breaker = %self.name, "circuit breaker manually reset");
    }
}

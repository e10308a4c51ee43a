//! Resilience engine for Tidegate's external call sites.
//!
//! Tidegate talks to two unreliable dependencies — an LLM provider and a
//! data-warehouse query engine — and must survive transient failures, rate
//! limits and partial outages without hanging or cascading. This crate is the
//! engine that makes that survivable:
//!
//! - **Error classification** ([`classifier`]): a total mapping from any
//!   failure to one `(ErrorCategory, Severity)` pair, via typed variants and
//!   an ordered, registrable pattern table.
//! - **Retry execution** ([`retry`]): immutable strategies with exponential
//!   backoff and ±10% jitter, run by an executor with matching async and
//!   blocking variants.
//! - **Circuit breaking** ([`breaker`]): per-dependency closed/open/half-open
//!   health state, windowed failure counting and cooldown-gated probes.
//! - **Timeout enforcement** ([`timeout`]): hard wall-clock budgets with a
//!   leak-free active-operations table. Cancellation is cooperative; a
//!   blocked synchronous call cannot be preempted and is reported after the
//!   fact.
//! - **Recovery decisions** ([`recovery`]): per-category handlers that turn a
//!   raw failure into a bounded next step — retry now, retry later, degrade,
//!   ask the caller, or give up — including the null-array query rewrite.
//! - **Orchestration** ([`engine`]): breaker gate → timeout guard → recovery
//!   loop, with a global kill switch for passthrough debugging.
//!
//! All state is process-local and per-instance. Construct one engine (or
//! breaker) per protected dependency and pass it by reference; nothing in
//! this crate is a global.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod breaker;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod recovery;
pub mod retry;
pub mod timeout;

// Re-export commonly used types for convenience
pub use breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerConfigBuilder, CircuitBreakerStatus,
    CircuitState,
};
pub use classifier::{ErrorCategory, ErrorClassifier};
pub use clock::{Clock, MockClock, SystemClock};
pub use config::{ConfigError, ResilienceConfig};
pub use engine::{EngineStatus, ResilienceEngine};
pub use error::{Severity, ServiceError, ServiceResult};
pub use recovery::{InputAdjustment, RecoveryDecision, RecoveryEngine, RecoveryStrategyKind};
pub use retry::{RetryContext, RetryError, RetryExecutor, RetryStrategy, RetryStrategyBuilder};
pub use timeout::TimeoutGuard;

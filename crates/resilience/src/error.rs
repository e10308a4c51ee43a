//! Failure types for the resilience engine
//!
//! Every failure that reaches the engine is represented as a [`ServiceError`]:
//! either one of the system's own typed failures (SQL generation, warehouse
//! query execution, provider rate limiting, operation timeout) or a bare
//! message string from call sites that have nothing more structured to offer.
//! Keeping the union closed gives the classifier a total function from any
//! failure to exactly one category.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Standard result type for operations protected by the engine
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Failures raised by, or reported to, the resilience engine.
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    /// SQL generation produced an unusable statement
    #[error("SQL generation failed: {message}")]
    SqlGeneration { message: String },

    /// The warehouse rejected or aborted a query
    #[error("query execution failed: {message}")]
    QueryExecution { message: String, job_id: Option<String>, query: Option<String> },

    /// The provider throttled the call, optionally telling us when to retry
    #[error("rate limited: {message}")]
    RateLimited { message: String, retry_after: Option<Duration> },

    /// A wrapped call exceeded its wall-clock budget
    #[error("operation '{operation}' timed out after {timeout:?} (elapsed {elapsed:?})")]
    Timeout { operation: String, timeout: Duration, elapsed: Duration },

    /// The circuit breaker for a dependency is open
    #[error("circuit breaker open for '{dependency}'")]
    CircuitOpen { dependency: String },

    /// An unstructured failure known only by its message
    #[error("{0}")]
    Message(String),
}

impl ServiceError {
    /// Create a SQL generation error
    pub fn sql_generation<S: Into<String>>(message: S) -> Self {
        Self::SqlGeneration { message: message.into() }
    }

    /// Create a query execution error without job context
    pub fn query_execution<S: Into<String>>(message: S) -> Self {
        Self::QueryExecution { message: message.into(), job_id: None, query: None }
    }

    /// Create a query execution error carrying the failed query text
    ///
    /// The query payload is what the recovery engine rewrites when a
    /// known-fixable pattern (such as a null-valued array constructor) caused
    /// the failure.
    pub fn query_execution_with_query<S: Into<String>, Q: Into<String>>(
        message: S,
        query: Q,
    ) -> Self {
        Self::QueryExecution { message: message.into(), job_id: None, query: Some(query.into()) }
    }

    /// Create a rate limit error with an optional provider-supplied delay
    pub fn rate_limited<S: Into<String>>(message: S, retry_after: Option<Duration>) -> Self {
        Self::RateLimited { message: message.into(), retry_after }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S, timeout: Duration, elapsed: Duration) -> Self {
        Self::Timeout { operation: operation.into(), timeout, elapsed }
    }

    /// The human-readable message the classifier pattern-matches against
    pub fn message(&self) -> String {
        match self {
            Self::SqlGeneration { message }
            | Self::QueryExecution { message, .. }
            | Self::RateLimited { message, .. } => message.clone(),
            Self::Message(message) => message.clone(),
            Self::Timeout { .. } | Self::CircuitOpen { .. } => self.to_string(),
        }
    }

    /// Provider-suggested retry delay, when the failure carries one
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// The query payload attached to the failure, if any
    pub fn query(&self) -> Option<&str> {
        match self {
            Self::QueryExecution { query, .. } => query.as_deref(),
            _ => None,
        }
    }
}

impl From<String> for ServiceError {
    fn from(message: String) -> Self {
        Self::Message(message)
    }
}

impl From<&str> for ServiceError {
    fn from(message: &str) -> Self {
        Self::Message(message.to_string())
    }
}

/// Failure severity levels for monitoring and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
pub enum Severity {
    /// Minor issue, degraded functionality
    Low,
    /// Significant issue, partial functionality loss
    Medium,
    /// Critical issue, major functionality loss
    High,
    /// System failure, complete functionality loss
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_context() {
        let err = ServiceError::timeout(
            "warehouse_query",
            Duration::from_secs(30),
            Duration::from_secs(31),
        );
        let text = err.to_string();
        assert!(text.contains("warehouse_query"));
        assert!(text.contains("timed out"));
    }

    #[test]
    fn test_message_strips_variant_framing() {
        let err = ServiceError::query_execution("Table not found: orders");
        assert_eq!(err.message(), "Table not found: orders");

        let err = ServiceError::from("plain string failure");
        assert_eq!(err.message(), "plain string failure");
    }

    #[test]
    fn test_retry_after_only_on_rate_limits() {
        let hint = Duration::from_secs(7);
        let err = ServiceError::rate_limited("Rate limit exceeded", Some(hint));
        assert_eq!(err.retry_after(), Some(hint));

        let err = ServiceError::query_execution("boom");
        assert_eq!(err.retry_after(), None);
    }

    #[test]
    fn test_query_payload_accessor() {
        let err = ServiceError::query_execution_with_query(
            "Array cannot have a null element",
            "SELECT ARRAY[1, NULL, 3] AS numbers",
        );
        assert_eq!(err.query(), Some("SELECT ARRAY[1, NULL, 3] AS numbers"));
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
        assert_eq!(Severity::Critical.to_string(), "CRITICAL");
    }
}

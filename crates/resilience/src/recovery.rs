//! Recovery decision layer
//!
//! Turns a classified failure into an actionable, bounded next step: retry
//! now, retry later, degrade, ask the caller, or give up. Decisions are
//! produced fresh per call and never mutate the failed operation directly;
//! the one active transformation is the query rewrite for known-fixable
//! warehouse failures, surfaced to the caller as an [`InputAdjustment`].

use std::time::Duration;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::classifier::{ErrorCategory, ErrorClassifier};
use crate::error::ServiceError;

/// Attempt bound for immediate retries
const IMMEDIATE_RETRY_LIMIT: u32 = 3;
/// Delay between immediate retries
const IMMEDIATE_RETRY_DELAY: Duration = Duration::from_millis(100);
/// Attempt bound for exponential backoff
const BACKOFF_RETRY_LIMIT: u32 = 5;
/// Cap on the backoff delay in seconds
const BACKOFF_DELAY_CAP_SECS: u64 = 10;
/// Chunk size signalled for simplified processing
const DEGRADED_CHUNK_SIZE: usize = 100;

/// The five recovery strategy families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum RecoveryStrategyKind {
    /// Retry promptly (sub-second delay)
    ImmediateRetry,
    /// Retry with growing delays (1-10 seconds)
    ExponentialBackoff,
    /// Convert the failure into a degraded but usable outcome
    GracefulDegradation,
    /// Stop and ask the caller for guidance
    UserGuided,
    /// Terminal, nothing to be done
    NoRecovery,
}

/// How the failed input should change before the next attempt.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub enum InputAdjustment {
    /// Re-run with this rewritten query instead of the original
    RewrittenQuery(String),
    /// Route the request to the fallback provider
    FallbackProvider,
    /// Process in smaller pieces to reduce resource pressure
    SimplifiedProcessing { chunk_size: usize },
    /// Serve cached results where available
    CachedFallback,
}

/// The engine's verdict on a failure. Immutable once produced.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RecoveryDecision {
    /// Stable label identifying the handler outcome (e.g.
    /// `"exponential_backoff"`, `"immediate_retry_exhausted"`)
    pub strategy: &'static str,
    pub should_retry: bool,
    pub retry_delay: Duration,
    pub max_retries_remaining: u32,
    /// Operator-facing description for logs
    pub message: String,
    /// End-user-safe sentence, when one applies
    pub user_message: Option<String>,
    /// Degradation mode or rewritten input, when recovery changes the input
    pub adjusted_input: Option<InputAdjustment>,
}

static ARRAY_AGG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)ARRAY_AGG\s*\(\s*([^)]+?)\s*\)").expect("array_agg pattern compiles")
});
static ARRAY_LITERAL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)ARRAY\s*\[\s*([^\]]+?)\s*\]").expect("array literal pattern compiles")
});
static ARRAY_CTOR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)ARRAY\s*\(\s*([^)]+?)\s*\)").expect("array constructor pattern compiles")
});
static DEGRADATION_HINT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"model|memory|resource|disk").expect("hint pattern compiles"));

/// Neutralize null elements in array expressions of a failed query.
///
/// `ARRAY_AGG(x)` gains `IGNORE NULLS`; `ARRAY[...]` literals are wrapped in
/// a null-filtering `UNNEST` subselect. The bare `ARRAY(...)` constructor is
/// only rewritten when no other pattern matched, so the filter is not applied
/// to its own output. Returns `None` when nothing matched.
fn rewrite_null_array_query(query: &str) -> Option<String> {
    let mut rewritten = ARRAY_AGG_RE.replace_all(query, "ARRAY_AGG($1 IGNORE NULLS)").into_owned();
    rewritten = ARRAY_LITERAL_RE
        .replace_all(&rewritten, "ARRAY(SELECT x FROM UNNEST([$1]) AS x WHERE x IS NOT NULL)")
        .into_owned();
    if rewritten == query {
        rewritten = ARRAY_CTOR_RE
            .replace_all(&rewritten, "ARRAY(SELECT x FROM UNNEST([$1]) AS x WHERE x IS NOT NULL)")
            .into_owned();
    }
    (rewritten != query).then_some(rewritten)
}

/// Composes the classifier with per-category recovery handlers and tracks
/// retry counts per operation id.
///
/// The counter map is the one piece of state intentionally shared across
/// calls with the same operation id; `DashMap` serializes updates per key, so
/// concurrent callers sharing an id cannot lose increments.
#[derive(Debug)]
pub struct RecoveryEngine {
    classifier: ErrorClassifier,
    retry_counts: DashMap<String, u32>,
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RecoveryEngine {
    pub fn new() -> Self {
        Self { classifier: ErrorClassifier::new(), retry_counts: DashMap::new() }
    }

    pub fn with_classifier(classifier: ErrorClassifier) -> Self {
        Self { classifier, retry_counts: DashMap::new() }
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    /// Decide how to recover from `error` for the given operation.
    pub fn handle_error(&self, error: &ServiceError, operation_id: &str) -> RecoveryDecision {
        let (category, _) = self.classifier.classify(error);
        let kind = Self::strategy_for(category, &error.message());

        let decision = match kind {
            RecoveryStrategyKind::ImmediateRetry => self.immediate_retry(error, operation_id),
            RecoveryStrategyKind::ExponentialBackoff => {
                self.exponential_backoff(error, operation_id)
            }
            RecoveryStrategyKind::GracefulDegradation => self.graceful_degradation(error),
            RecoveryStrategyKind::UserGuided => Self::user_guided(error),
            RecoveryStrategyKind::NoRecovery => self.no_recovery(error),
        };

        debug!(
            operation = operation_id,
            strategy = decision.strategy,
            should_retry = decision.should_retry,
            "recovery decision"
        );
        decision
    }

    /// Map a category (plus message content, for infrastructure failures) to
    /// a strategy family.
    fn strategy_for(category: ErrorCategory, message: &str) -> RecoveryStrategyKind {
        match category {
            ErrorCategory::Transient => RecoveryStrategyKind::ImmediateRetry,
            ErrorCategory::RateLimit => RecoveryStrategyKind::ExponentialBackoff,
            ErrorCategory::Infrastructure => {
                if DEGRADATION_HINT_RE.is_match(&message.to_lowercase()) {
                    RecoveryStrategyKind::GracefulDegradation
                } else {
                    RecoveryStrategyKind::ExponentialBackoff
                }
            }
            ErrorCategory::BusinessLogic => RecoveryStrategyKind::UserGuided,
            ErrorCategory::Permanent => RecoveryStrategyKind::NoRecovery,
        }
    }

    fn immediate_retry(&self, error: &ServiceError, operation_id: &str) -> RecoveryDecision {
        let mut count = self.retry_counts.entry(operation_id.to_string()).or_insert(0);
        if *count >= IMMEDIATE_RETRY_LIMIT {
            return RecoveryDecision {
                strategy: "immediate_retry_exhausted",
                should_retry: false,
                retry_delay: Duration::ZERO,
                max_retries_remaining: 0,
                message: format!("immediate retry failed after {IMMEDIATE_RETRY_LIMIT} attempts"),
                user_message: Some(
                    "Unable to complete the operation after multiple attempts.".to_string(),
                ),
                adjusted_input: None,
            };
        }

        let attempt = *count + 1;
        *count += 1;
        drop(count);

        // The one place recovery transforms the failed input: a null-valued
        // array expression is rewritten out of the attached query.
        let adjusted_input = if error.message().contains("Array cannot have a null element") {
            error.query().and_then(rewrite_null_array_query).map(InputAdjustment::RewrittenQuery)
        } else {
            None
        };

        RecoveryDecision {
            strategy: "immediate_retry",
            should_retry: true,
            retry_delay: IMMEDIATE_RETRY_DELAY,
            max_retries_remaining: IMMEDIATE_RETRY_LIMIT - attempt,
            message: format!("retrying immediately (attempt {attempt}/{IMMEDIATE_RETRY_LIMIT})"),
            user_message: Some(self.classifier.user_message(error)),
            adjusted_input,
        }
    }

    fn exponential_backoff(&self, error: &ServiceError, operation_id: &str) -> RecoveryDecision {
        let mut count = self.retry_counts.entry(operation_id.to_string()).or_insert(0);
        if *count >= BACKOFF_RETRY_LIMIT {
            return RecoveryDecision {
                strategy: "exponential_backoff_exhausted",
                should_retry: false,
                retry_delay: Duration::ZERO,
                max_retries_remaining: 0,
                message: format!("exponential backoff failed after {BACKOFF_RETRY_LIMIT} attempts"),
                user_message: Some(
                    "Service temporarily unavailable. Please try again later.".to_string(),
                ),
                adjusted_input: None,
            };
        }

        let attempt = *count;
        *count += 1;
        drop(count);

        let delay_secs = 2_u64.saturating_pow(attempt).min(BACKOFF_DELAY_CAP_SECS);
        RecoveryDecision {
            strategy: "exponential_backoff",
            should_retry: true,
            retry_delay: Duration::from_secs(delay_secs),
            max_retries_remaining: BACKOFF_RETRY_LIMIT - attempt - 1,
            message: format!(
                "retrying with backoff in {delay_secs}s (attempt {}/{BACKOFF_RETRY_LIMIT})",
                attempt + 1
            ),
            user_message: Some(self.classifier.user_message(error)),
            adjusted_input: None,
        }
    }

    fn graceful_degradation(&self, error: &ServiceError) -> RecoveryDecision {
        let message = error.message().to_lowercase();

        if message.contains("model") {
            return RecoveryDecision {
                strategy: "model_fallback",
                should_retry: true,
                retry_delay: Duration::ZERO,
                max_retries_remaining: 0,
                message: "falling back to the alternative provider".to_string(),
                user_message: Some("Using an alternative approach for your request...".to_string()),
                adjusted_input: Some(InputAdjustment::FallbackProvider),
            };
        }

        if message.contains("memory") || message.contains("resource") {
            return RecoveryDecision {
                strategy: "simplified_processing",
                should_retry: true,
                retry_delay: Duration::ZERO,
                max_retries_remaining: 0,
                message: "simplifying processing to reduce resource usage".to_string(),
                user_message: Some("Processing the request with reduced complexity...".to_string()),
                adjusted_input: Some(InputAdjustment::SimplifiedProcessing {
                    chunk_size: DEGRADED_CHUNK_SIZE,
                }),
            };
        }

        RecoveryDecision {
            strategy: "cached_fallback",
            should_retry: true,
            retry_delay: Duration::ZERO,
            max_retries_remaining: 0,
            message: "using cached results where available".to_string(),
            user_message: Some("Providing the best available results...".to_string()),
            adjusted_input: Some(InputAdjustment::CachedFallback),
        }
    }

    fn user_guided(error: &ServiceError) -> RecoveryDecision {
        let message = error.message().to_lowercase();

        if message.contains("syntax") || message.contains("sql") {
            return RecoveryDecision {
                strategy: "user_clarification",
                should_retry: false,
                retry_delay: Duration::ZERO,
                max_retries_remaining: 0,
                message: "SQL syntax error requires user clarification".to_string(),
                user_message: Some(
                    "Please rephrase your question or provide more specific details.".to_string(),
                ),
                adjusted_input: None,
            };
        }

        if message.contains("table") || message.contains("column") {
            return RecoveryDecision {
                strategy: "schema_guidance",
                should_retry: false,
                retry_delay: Duration::ZERO,
                max_retries_remaining: 0,
                message: "schema-related error needs user guidance".to_string(),
                user_message: Some(
                    "Please check the table or column names in your query.".to_string(),
                ),
                adjusted_input: None,
            };
        }

        RecoveryDecision {
            strategy: "general_user_guidance",
            should_retry: false,
            retry_delay: Duration::ZERO,
            max_retries_remaining: 0,
            message: "complex error requiring user intervention".to_string(),
            user_message: Some(
                "Unable to process the request automatically. Please try a different approach."
                    .to_string(),
            ),
            adjusted_input: None,
        }
    }

    fn no_recovery(&self, error: &ServiceError) -> RecoveryDecision {
        RecoveryDecision {
            strategy: "no_recovery",
            should_retry: false,
            retry_delay: Duration::ZERO,
            max_retries_remaining: 0,
            message: "error is not recoverable".to_string(),
            user_message: Some(self.classifier.user_message(error)),
            adjusted_input: None,
        }
    }

    /// Current retry count for an operation id
    pub fn retry_count(&self, operation_id: &str) -> u32 {
        self.retry_counts.get(operation_id).map_or(0, |count| *count)
    }

    /// Forget the retry count for an operation id, typically after a success
    pub fn reset_retry_count(&self, operation_id: &str) {
        self.retry_counts.remove(operation_id);
    }
}

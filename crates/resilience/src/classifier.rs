//! Error classification
//!
//! Maps any [`ServiceError`] to exactly one `(ErrorCategory, Severity)` pair.
//! Typed failures carry fixed categories; everything else is matched against
//! an ordered table of message patterns, most specific first. The table is
//! extensible at construction time so call sites can register
//! dependency-specific rows without touching the defaults.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Severity, ServiceError};

/// Total categorization of any failure, driving retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum ErrorCategory {
    /// Temporary failure, likely to succeed on a prompt retry
    Transient,
    /// Provider throttling, retry after a provider-aware delay
    RateLimit,
    /// Low-level infrastructure failure, retry with backoff or degrade
    Infrastructure,
    /// Will never succeed, do not retry
    Permanent,
    /// Needs a changed input or human guidance, not auto-retried blindly
    BusinessLogic,
}

impl ErrorCategory {
    /// Whether the retry executor may attempt this failure again.
    ///
    /// Only `Permanent` failures are excluded outright; `BusinessLogic`
    /// failures stay eligible because regenerating the input (a fresh LLM
    /// sample, a corrected query) can succeed where the original did not.
    pub fn is_retry_eligible(self) -> bool {
        !matches!(self, Self::Permanent)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::Infrastructure => write!(f, "infrastructure"),
            Self::Permanent => write!(f, "permanent"),
            Self::BusinessLogic => write!(f, "business_logic"),
        }
    }
}

/// One row of the classification table.
#[derive(Debug, Clone)]
struct PatternRule {
    pattern: Regex,
    category: ErrorCategory,
    severity: Severity,
}

/// Built-in classification rows, checked in order. Patterns are matched
/// against the lower-cased failure message, so they are written lower-case.
const BASE_RULES: &[(&str, ErrorCategory, Severity)] = &[
    // Security phrases first: most specific, never retried
    (
        r"permission.*denied|access.*denied|unauthorized|invalid.*api.*key|authentication.*failed|forbidden",
        ErrorCategory::Permanent,
        Severity::Critical,
    ),
    (r"timeout|connection.*reset|network.*error", ErrorCategory::Transient, Severity::Medium),
    (
        r"rate.*limit|quota.*exceeded|too.*many.*requests",
        ErrorCategory::RateLimit,
        Severity::Medium,
    ),
    // Warehouse-specific: fixable by a query rewrite, so retried promptly
    (r"array cannot have a null element", ErrorCategory::Transient, Severity::Medium),
    (r"dataset.*not.*found", ErrorCategory::Permanent, Severity::High),
    (r"model.*not.*found|model.*unavailable", ErrorCategory::Infrastructure, Severity::High),
    (r"syntax.*error|invalid.*sql|parse.*error", ErrorCategory::BusinessLogic, Severity::High),
    (
        r"type.*mismatch|timestamp.*vs.*date|data.*type.*mismatch",
        ErrorCategory::BusinessLogic,
        Severity::Medium,
    ),
    (r"table.*not.*found|column.*not.*found", ErrorCategory::BusinessLogic, Severity::Medium),
    (
        r"forbidden.*table|not.*in.*allowed.*tables|security.*violation",
        ErrorCategory::Permanent,
        Severity::Critical,
    ),
    (r"out.*of.*memory|disk.*full", ErrorCategory::Infrastructure, Severity::High),
    (r"internal.*server.*error", ErrorCategory::Infrastructure, Severity::Medium),
];

static COMPILED_BASE_RULES: Lazy<Vec<PatternRule>> = Lazy::new(|| {
    BASE_RULES
        .iter()
        .map(|(pattern, category, severity)| PatternRule {
            pattern: Regex::new(pattern).expect("built-in classifier pattern compiles"),
            category: *category,
            severity: *severity,
        })
        .collect()
});

/// Phrases that identify a security failure regardless of classification row.
static SECURITY_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"permission.*denied|access.*denied|unauthorized|invalid.*api.*key|authentication.*failed|forbidden",
    )
    .expect("security pattern compiles")
});

/// Classifies failures into `(ErrorCategory, Severity)` pairs.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    rules: Vec<PatternRule>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self { rules: COMPILED_BASE_RULES.clone() }
    }
}

impl ErrorClassifier {
    /// Create a classifier with the built-in rule table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an additional classification row, checked after the built-in
    /// table. The pattern is matched against the lower-cased message.
    pub fn with_pattern(
        mut self,
        pattern: &str,
        category: ErrorCategory,
        severity: Severity,
    ) -> Result<Self, regex::Error> {
        self.rules.push(PatternRule { pattern: Regex::new(pattern)?, category, severity });
        Ok(self)
    }

    /// Classify a failure.
    ///
    /// Typed failures take precedence over message patterns; warehouse
    /// execution errors and bare messages fall through to the pattern table.
    pub fn classify(&self, error: &ServiceError) -> (ErrorCategory, Severity) {
        match error {
            ServiceError::Timeout { .. } | ServiceError::CircuitOpen { .. } => {
                (ErrorCategory::Infrastructure, Severity::Medium)
            }
            ServiceError::SqlGeneration { .. } => (ErrorCategory::BusinessLogic, Severity::High),
            ServiceError::RateLimited { .. } => (ErrorCategory::RateLimit, Severity::Medium),
            ServiceError::QueryExecution { message, .. } => self.classify_message(message),
            ServiceError::Message(message) => self.classify_message(message),
        }
    }

    /// Classify a bare message string against the pattern table.
    pub fn classify_message(&self, message: &str) -> (ErrorCategory, Severity) {
        let message = message.to_lowercase();
        for rule in &self.rules {
            if rule.pattern.is_match(&message) {
                return (rule.category, rule.severity);
            }
        }
        (ErrorCategory::BusinessLogic, Severity::Medium)
    }

    /// Whether the failure is likely to succeed if simply attempted again
    pub fn is_transient(&self, error: &ServiceError) -> bool {
        matches!(
            self.classify(error).0,
            ErrorCategory::Transient | ErrorCategory::RateLimit | ErrorCategory::Infrastructure
        )
    }

    /// Whether the failure is security-related (never retried, never detailed
    /// back to the user)
    pub fn is_security_error(&self, error: &ServiceError) -> bool {
        SECURITY_PATTERN.is_match(&error.message().to_lowercase())
    }

    /// A templated, end-user-safe sentence describing the failure.
    ///
    /// Never echoes raw error internals. Security failures always map to the
    /// same generic sentence so nothing about the underlying denial leaks.
    pub fn user_message(&self, error: &ServiceError) -> String {
        if self.is_security_error(error) {
            return "Access denied. Please check your permissions and credentials.".to_string();
        }

        let message = error.message().to_lowercase();

        if message.contains("array cannot have a null element") {
            return "Data processing issue detected. Automatically applying a fix...".to_string();
        }
        if message.contains("timeout") || message.contains("timed out") {
            return "The operation took longer than expected. Retrying...".to_string();
        }
        if message.contains("rate limit") || message.contains("quota") {
            return "Service temporarily unavailable due to usage limits. Retrying shortly..."
                .to_string();
        }
        if message.contains("table not found") || message.contains("column not found") {
            return "Unable to complete the request. Please check your table or column names."
                .to_string();
        }

        match self.classify(error).1 {
            Severity::Critical => "Critical system error. Please contact support.".to_string(),
            Severity::High => {
                "Unable to complete the request. Please try a different approach.".to_string()
            }
            Severity::Low | Severity::Medium => {
                "Temporary issue encountered. Retrying automatically...".to_string()
            }
        }
    }
}

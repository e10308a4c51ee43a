//! Engine configuration
//!
//! All knobs have sane defaults and can be overridden per process through
//! `TIDEGATE_*` environment variables. An invalid override is never fatal: it
//! is logged and the default is kept, so a typo in a deployment manifest
//! cannot take the service down. `TIDEGATE_RESILIENCE_ENABLED=false` is the
//! global kill switch that turns every wrapped call into a direct
//! passthrough.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::retry::RetryStrategy;

/// Validation error for engine configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {message}")]
    Invalid { message: String },
}

impl ConfigError {
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::Invalid { message: message.into() }
    }
}

const ENV_ENABLED: &str = "TIDEGATE_RESILIENCE_ENABLED";
const ENV_MAX_ATTEMPTS: &str = "TIDEGATE_MAX_ATTEMPTS";
const ENV_BASE_DELAY_MS: &str = "TIDEGATE_BASE_DELAY_MS";
const ENV_MAX_DELAY_MS: &str = "TIDEGATE_MAX_DELAY_MS";
const ENV_BACKOFF_MULTIPLIER: &str = "TIDEGATE_BACKOFF_MULTIPLIER";
const ENV_JITTER: &str = "TIDEGATE_JITTER";
const ENV_TIMEOUT_MS: &str = "TIDEGATE_TIMEOUT_MS";

/// Tunable parameters for one resilience engine instance.
#[derive(Debug, Clone)]
pub struct ResilienceConfig {
    /// Global kill switch; when false every wrapped call passes straight
    /// through with no breaker, timeout or retry involvement
    pub enabled: bool,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
    /// Wall-clock budget applied to each wrapped call
    pub default_timeout: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
            default_timeout: Duration::from_secs(300),
        }
    }
}

impl ResilienceConfig {
    /// Build a configuration from process environment variables, keeping the
    /// default for anything unset or unparseable.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup. Exists so tests
    /// can exercise override handling without mutating process environment.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let max_attempts = parse_or(&lookup, ENV_MAX_ATTEMPTS, defaults.max_attempts);
        let base_delay_ms = parse_or(&lookup, ENV_BASE_DELAY_MS, defaults.base_delay.as_millis() as u64);
        let max_delay_ms = parse_or(&lookup, ENV_MAX_DELAY_MS, defaults.max_delay.as_millis() as u64);
        let timeout_ms =
            parse_or(&lookup, ENV_TIMEOUT_MS, defaults.default_timeout.as_millis() as u64);

        Self {
            enabled: flag_or(&lookup, ENV_ENABLED, defaults.enabled),
            max_attempts,
            base_delay: Duration::from_millis(base_delay_ms),
            max_delay: Duration::from_millis(max_delay_ms),
            backoff_multiplier: parse_or(
                &lookup,
                ENV_BACKOFF_MULTIPLIER,
                defaults.backoff_multiplier,
            ),
            jitter: flag_or(&lookup, ENV_JITTER, defaults.jitter),
            default_timeout: Duration::from_millis(timeout_ms),
        }
    }

    /// The retry strategy this configuration describes
    pub fn strategy(&self) -> RetryStrategy {
        RetryStrategy {
            max_attempts: self.max_attempts,
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            backoff_multiplier: self.backoff_multiplier,
            jitter: self.jitter,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.strategy().validate()?;
        if self.default_timeout.is_zero() {
            return Err(ConfigError::invalid("default_timeout must be greater than zero"));
        }
        Ok(())
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Display + Copy,
{
    match lookup(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = %raw, default = %default, "unparseable override, keeping default");
                default
            }
        },
        None => default,
    }
}

fn flag_or<F>(lookup: &F, key: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => match raw.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" => true,
            "false" | "0" | "no" => false,
            _ => {
                warn!(key, value = %raw, default, "unparseable flag override, keeping default");
                default
            }
        },
        None => default,
    }
}

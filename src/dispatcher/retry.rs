//! Retry bookkeeping for broadcast attempts.
//!
//! Separates the retry loop (a pure state machine over attempt-count and
//! delay) from circuit-breaker bookkeeping, per the redesign note in the
//! spec: "Circuit breaker + retry in the same function" gets split into two
//! independently testable pieces. See [`super::circuit`] for the breaker.

use std::time::Duration;

/// Retry policy for a single broadcast attempt chain.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first.
    pub max_retries: u32,
    /// Base backoff; exponential with attempt (`base * 2^attempt`).
    pub base_backoff: Duration,
    /// Hard cap on any computed backoff.
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    /// Backoff for a given attempt (0-indexed), capped at `max_backoff`.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let base_secs = self.base_backoff.as_secs_f64();
        let backoff_secs = base_secs * 2f64.powi(attempt as i32);
        let capped = backoff_secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Dispatcher-level error classification (spec §4.3, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network reset, timeout, 5xx-class status — retried up to max_retries.
    Retryable,
    /// Malformed tx, auth failure, permanent policy rejection — surfaced immediately.
    NonRetryable,
}

/// Classify a raw transport error string into the dispatcher's retry taxonomy.
///
/// Transport implementations return free-form error text (HTTP status lines,
/// connector errors); this keeps the classification independent of any one
/// transport's error type, mirroring how the rest of the corpus classifies
/// opaque upstream error strings rather than matching on transport-specific
/// error enums.
pub fn classify_error(error: &str) -> ErrorClass {
    let lower = error.to_lowercase();

    if lower.contains("malformed")
        || lower.contains("invalid transaction")
        || lower.contains("authentication")
        || lower.contains("unauthorized")
        || lower.contains("401")
        || lower.contains("403")
        || lower.contains("policy rejected")
        || lower.contains("permanently rejected")
    {
        return ErrorClass::NonRetryable;
    }

    if lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("connection reset")
        || lower.contains("connection refused")
        || lower.contains("network")
        || lower.contains("500")
        || lower.contains("502")
        || lower.contains("503")
        || lower.contains("504")
    {
        return ErrorClass::Retryable;
    }

    // Unknown errors default to retryable: a transient glitch wrongly
    // classified as permanent silently drops a payment; the reverse just
    // costs one extra attempt.
    ErrorClass::Retryable
}

/// Per-attempt-chain bookkeeping handed to the dispatcher's retry loop.
#[derive(Debug, Clone, Default)]
pub struct RetryContext {
    pub attempt: u32,
    pub errors: Vec<String>,
}

impl RetryContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_failure(&mut self, error: String) {
        self.attempt += 1;
        self.errors.push(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let config = RetryConfig {
            max_retries: 5,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
        };
        assert_eq!(config.backoff_for_attempt(0), Duration::from_millis(500));
        assert_eq!(config.backoff_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.backoff_for_attempt(2), Duration::from_secs(2));
        assert_eq!(config.backoff_for_attempt(3), Duration::from_secs(4));
        assert_eq!(config.backoff_for_attempt(4), Duration::from_secs(8));
        assert_eq!(config.backoff_for_attempt(5), Duration::from_secs(10)); // capped
    }

    #[test]
    fn should_retry_respects_max() {
        let config = RetryConfig::default();
        assert!(config.should_retry(0));
        assert!(config.should_retry(2));
        assert!(!config.should_retry(3));
    }

    #[test]
    fn classifies_network_errors_as_retryable() {
        assert_eq!(classify_error("connection reset by peer"), ErrorClass::Retryable);
        assert_eq!(classify_error("request timed out"), ErrorClass::Retryable);
        assert_eq!(classify_error("502 Bad Gateway"), ErrorClass::Retryable);
    }

    #[test]
    fn classifies_permanent_errors_as_non_retryable() {
        assert_eq!(classify_error("malformed transaction"), ErrorClass::NonRetryable);
        assert_eq!(classify_error("401 Unauthorized"), ErrorClass::NonRetryable);
        assert_eq!(
            classify_error("policy rejected: blacklisted address"),
            ErrorClass::NonRetryable
        );
    }

    #[test]
    fn retry_context_accumulates_errors() {
        let mut ctx = RetryContext::new();
        ctx.record_failure("timeout".into());
        ctx.record_failure("timeout".into());
        assert_eq!(ctx.attempt, 2);
        assert_eq!(ctx.errors.len(), 2);
    }
}

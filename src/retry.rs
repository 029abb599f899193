//! Resilient execution with exponential backoff and jitter
//!
//! Delay before retry `k` (1-based) is `min(cap, base * multiplier^(k-1))`
//! plus up to `jitter_ratio` of uniform jitter.
//!
//! ## Retryable failures
//!
//! Classification is closed and explicit (see [`FailureClass`]):
//!
//! - connection / network failures
//! - transient datastore codes: 1205 (lock wait timeout), 1213 (deadlock),
//!   2006 (server gone away), 2013 (connection lost), SQLSTATE 40001, 08S01
//! - HTTP 408, 429, 500, 502, 503, 504
//!
//! Validation, authorization and internal errors are terminal and
//! propagate immediately without delay.

use crate::config::RetryConfig;
use crate::error::AuditError;
use rand::Rng;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// HTTP statuses worth retrying
pub const RETRYABLE_HTTP_STATUSES: &[u16] = &[408, 429, 500, 502, 503, 504];

/// Datastore error codes that indicate a transient condition
pub const TRANSIENT_DATASTORE_CODES: &[&str] = &["1205", "1213", "2006", "2013", "40001", "08S01"];

/// Closed classification of operation failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum FailureClass {
    /// Network or connection-level failure
    Connection,
    /// Datastore error carrying the driver code
    Datastore(String),
    /// HTTP response status
    Http(u16),
    Validation,
    Authorization,
    /// Programming or configuration error
    Internal,
}

impl FailureClass {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection => true,
            Self::Datastore(code) => TRANSIENT_DATASTORE_CODES.contains(&code.as_str()),
            Self::Http(status) => RETRYABLE_HTTP_STATUSES.contains(status),
            Self::Validation | Self::Authorization | Self::Internal => false,
        }
    }
}

/// Errors that can be classified for retry decisions
pub trait Classify {
    fn failure_class(&self) -> FailureClass;
}

impl Classify for AuditError {
    fn failure_class(&self) -> FailureClass {
        match self {
            AuditError::Connection(_) | AuditError::Dispatch { .. } => FailureClass::Connection,
            AuditError::Http { status, .. } => FailureClass::Http(*status),
            AuditError::Datastore { code, .. } => FailureClass::Datastore(code.clone()),
            AuditError::Validation(_) => FailureClass::Validation,
            AuditError::Authorization(_) => FailureClass::Authorization,
            _ => FailureClass::Internal,
        }
    }
}

/// State of one in-flight `execute_with_retry` call
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Retry number about to run (1-based)
    pub attempt: u32,
    pub last_error: FailureClass,
    pub delay: Duration,
}

#[derive(Debug, Default)]
struct RetryCounters {
    attempts: AtomicU64,
    retries: AtomicU64,
    recovered: AtomicU64,
    exhausted: AtomicU64,
    terminal: AtomicU64,
}

/// Point-in-time view of retry counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryStats {
    /// Every invocation of an operation, first tries included
    pub attempts: u64,
    /// Invocations that were retries
    pub retries: u64,
    /// Calls that succeeded after at least one retry
    pub recovered: u64,
    /// Calls that ran out of retries
    pub exhausted: u64,
    /// Calls that failed with a non-retryable error
    pub terminal: u64,
}

/// Runs fallible async operations with backoff
///
/// Cloning shares the counters.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
    counters: Arc<RetryCounters>,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            counters: Arc::new(RetryCounters::default()),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay before retry `attempt` (1-based), without jitter
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.config.base_delay_ms as f64 * self.config.multiplier.powi(exponent);
        let capped = raw.min(self.config.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Backoff delay plus uniform jitter in `[0, jitter_ratio * delay]`
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.backoff_delay(attempt);
        if self.config.jitter_ratio <= 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(0.0..=self.config.jitter_ratio);
        delay + delay.mul_f64(factor)
    }

    /// Run `operation`, retrying retryable failures
    ///
    /// `max_retries` overrides the configured limit. When retries run out
    /// the last error is returned; terminal errors are returned at once.
    /// Backoff suspends only the calling task.
    pub async fn execute_with_retry<T, E, F, Fut>(
        &self,
        mut operation: F,
        max_retries: Option<u32>,
    ) -> std::result::Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Classify + std::fmt::Display,
    {
        let max_retries = max_retries.unwrap_or(self.config.max_retries);
        let mut retries_done = 0u32;

        loop {
            self.counters.attempts.fetch_add(1, Ordering::Relaxed);

            let err = match operation().await {
                Ok(value) => {
                    if retries_done > 0 {
                        self.counters.recovered.fetch_add(1, Ordering::Relaxed);
                        tracing::info!(retries = retries_done, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            let class = err.failure_class();
            if !class.is_retryable() {
                self.counters.terminal.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(class = ?class, error = %err, "Non-retryable failure");
                return Err(err);
            }

            if retries_done >= max_retries {
                self.counters.exhausted.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    attempts = retries_done + 1,
                    class = ?class,
                    error = %err,
                    "Retries exhausted"
                );
                return Err(err);
            }

            retries_done += 1;
            let context = RetryContext {
                attempt: retries_done,
                delay: self.jittered_delay(retries_done),
                last_error: class,
            };
            self.counters.retries.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                attempt = context.attempt,
                max_retries,
                delay_ms = context.delay.as_millis() as u64,
                class = ?context.last_error,
                error = %err,
                "Retrying after transient failure"
            );

            tokio::time::sleep(context.delay).await;
        }
    }

    pub fn stats(&self) -> RetryStats {
        RetryStats {
            attempts: self.counters.attempts.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            recovered: self.counters.recovered.load(Ordering::Relaxed),
            exhausted: self.counters.exhausted.load(Ordering::Relaxed),
            terminal: self.counters.terminal.load(Ordering::Relaxed),
        }
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

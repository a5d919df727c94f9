//! Bounded retry with an optional overall timeout.
//!
//! Provisioning actions (plan, apply, destroy) are retried a fixed number of
//! times back to back; API reads sleep a fixed delay between attempts. There is
//! no backoff. Attempts after the first can ask the underlying tool for
//! trace-level output via [`with_verbose_logging`].

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::env::{with_verbose_logging, EnvOverlay};

/// Fixed retry policy for one call site.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of invocations (values below 1 are treated as 1)
    pub max_attempts: u32,
    /// Request trace-level logging on attempts after the first
    pub escalate_verbosity: bool,
    /// Wall-clock limit across all attempts
    pub overall_timeout: Option<Duration>,
    /// Sleep between a failed attempt and the next one
    pub delay: Duration,
}

impl RetryPolicy {
    /// Retry up to `max_attempts` times with no timeout and no escalation
    pub const fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            escalate_verbosity: false,
            overall_timeout: None,
            delay: Duration::ZERO,
        }
    }

    /// Request verbose tool output on retries
    pub const fn with_verbose_retries(mut self) -> Self {
        self.escalate_verbosity = true;
        self
    }

    /// Bound all attempts by `timeout`
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.overall_timeout = Some(timeout);
        self
    }

    /// Sleep `delay` before each retry
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Why a retried operation gave up
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed; carries the error of the final attempt
    Exhausted {
        /// Operation name used in logs
        operation: String,
        /// Attempts made
        attempts: u32,
        /// Error returned by the final attempt
        last: E,
    },

    /// The overall timeout elapsed; the in-flight attempt was abandoned
    TimedOut {
        /// Operation name used in logs
        operation: String,
        /// The timeout that elapsed
        timeout: Duration,
        /// Attempts started, including the abandoned one
        attempts: u32,
        /// Error of the last attempt that completed, if any
        last: Option<E>,
    },
}

impl<E> RetryError<E> {
    /// Number of attempts started
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } | Self::TimedOut { attempts, .. } => *attempts,
        }
    }

    /// Whether the overall timeout ended the operation
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }

    /// Error of the last completed attempt
    pub fn last_error(&self) -> Option<&E> {
        match self {
            Self::Exhausted { last, .. } => Some(last),
            Self::TimedOut { last, .. } => last.as_ref(),
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted {
                operation,
                attempts,
                last,
            } => write!(f, "{} failed after {} attempts: {}", operation, attempts, last),
            Self::TimedOut {
                operation,
                timeout,
                attempts,
                last: Some(last),
            } => write!(
                f,
                "{} timed out after {:?} ({} attempts, last error: {})",
                operation, timeout, attempts, last
            ),
            Self::TimedOut {
                operation,
                timeout,
                attempts,
                last: None,
            } => write!(
                f,
                "{} timed out after {:?} ({} attempts)",
                operation, timeout, attempts
            ),
        }
    }
}

impl<E> std::error::Error for RetryError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.last_error()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Run `action` until it succeeds, `policy.max_attempts` is reached, or the
/// overall timeout elapses.
///
/// `action` receives the environment for the attempt: `base_env` on the first
/// attempt, and the verbose variant on later ones when the policy escalates.
pub async fn run_with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    base_env: &EnvOverlay,
    mut action: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(EnvOverlay) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let mut attempts = 0u32;
    let mut last_error = None;

    let outcome = {
        let attempt_loop = attempt_all(
            policy,
            operation,
            base_env,
            &mut action,
            &mut attempts,
            &mut last_error,
        );
        match policy.overall_timeout {
            Some(limit) => tokio::time::timeout(limit, attempt_loop).await.ok(),
            None => Some(attempt_loop.await),
        }
    };

    match outcome {
        Some(result) => result,
        None => {
            let timeout = policy.overall_timeout.unwrap_or_default();
            error!(
                operation = %operation,
                attempts,
                timeout_secs = timeout.as_secs(),
                "Operation timed out"
            );
            Err(RetryError::TimedOut {
                operation: operation.to_string(),
                timeout,
                attempts,
                last: last_error,
            })
        }
    }
}

async fn attempt_all<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    base_env: &EnvOverlay,
    action: &mut F,
    attempts: &mut u32,
    last_error: &mut Option<E>,
) -> Result<T, RetryError<E>>
where
    F: FnMut(EnvOverlay) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        *attempts = attempt + 1;
        let env = if policy.escalate_verbosity {
            with_verbose_logging(base_env, attempt)
        } else {
            base_env.clone()
        };

        match action(env).await {
            Ok(value) => {
                if attempt > 0 {
                    info!(operation = %operation, attempt = attempt + 1, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if attempt + 1 >= max_attempts => {
                error!(
                    operation = %operation,
                    attempt = attempt + 1,
                    error = %e,
                    "Operation failed after max retries"
                );
                return Err(RetryError::Exhausted {
                    operation: operation.to_string(),
                    attempts: attempt + 1,
                    last: e,
                });
            }
            Err(e) => {
                warn!(
                    operation = %operation,
                    attempt = attempt + 1,
                    max_attempts,
                    error = %e,
                    "Operation failed, retrying"
                );
                *last_error = Some(e);
            }
        }

        if !policy.delay.is_zero() {
            tokio::time::sleep(policy.delay).await;
        }

        attempt += 1;
    }
}

//! Poll-until-condition-or-deadline primitive
//!
//! Every wait in the lifecycle (bootstrap markers, API liveness, node health)
//! goes through [`poll_until`]. The check decides whether to keep going; the
//! policy decides when to give up.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

/// Result type for polling check functions.
///
/// - `Ok(Some(value))` - Condition met, return the value
/// - `Ok(None)` - Condition not met yet, keep polling
/// - `Err(e)` - Fatal error, stop polling immediately
pub type PollResult<T> = std::result::Result<Option<T>, String>;

/// Cadence and ceiling for a polling loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollPolicy {
    /// Sleep between two checks
    pub interval: Duration,
    /// Wall-clock ceiling measured from the first check
    pub ceiling: Duration,
    /// Optional cap on the number of checks
    pub max_polls: Option<u32>,
}

impl PollPolicy {
    /// Poll every `interval` until `ceiling` has elapsed
    pub const fn new(interval: Duration, ceiling: Duration) -> Self {
        Self {
            interval,
            ceiling,
            max_polls: None,
        }
    }

    /// Additionally stop after `max_polls` checks
    pub const fn with_max_polls(mut self, max_polls: u32) -> Self {
        self.max_polls = Some(max_polls);
        self
    }
}

/// Why a polling loop stopped without a value
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PollError {
    /// The ceiling or the poll budget ran out
    #[error("timed out after {elapsed:?} ({polls} polls) waiting for {description}")]
    Exhausted {
        /// What was being waited for
        description: String,
        /// Number of checks performed
        polls: u32,
        /// Time spent polling
        elapsed: Duration,
    },

    /// The check reported a fatal error
    #[error("error waiting for {description}: {message}")]
    Failed {
        /// What was being waited for
        description: String,
        /// Error reported by the check
        message: String,
    },
}

/// Poll `check` until it yields a value, fails, or `policy` runs out.
///
/// The loop never sleeps after the final check, so it returns within the
/// ceiling plus at most one interval and one check.
pub async fn poll_until<T, F, Fut>(
    policy: &PollPolicy,
    description: &str,
    mut check: F,
) -> Result<T, PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PollResult<T>>,
{
    let start = Instant::now();
    let mut polls = 0u32;

    loop {
        polls += 1;

        match check().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => trace!(description, polls, "Condition not met yet"),
            Err(message) => {
                return Err(PollError::Failed {
                    description: description.to_string(),
                    message,
                })
            }
        }

        let elapsed = start.elapsed();
        let out_of_polls = policy.max_polls.is_some_and(|max| polls >= max);
        if out_of_polls || elapsed >= policy.ceiling {
            return Err(PollError::Exhausted {
                description: description.to_string(),
                polls,
                elapsed,
            });
        }

        tokio::time::sleep(policy.interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn returns_value_once_condition_holds() {
        let policy = PollPolicy::new(Duration::from_secs(10), Duration::from_secs(600));
        let mut calls = 0;

        let result = poll_until(&policy, "counter", || {
            calls += 1;
            let current = calls;
            async move { Ok((current == 4).then_some(current)) }
        })
        .await;

        assert_eq!(result, Ok(4));
    }

    #[tokio::test(start_paused = true)]
    async fn never_true_condition_stops_within_one_interval_of_ceiling() {
        let interval = Duration::from_secs(10);
        let ceiling = Duration::from_secs(60);
        let policy = PollPolicy::new(interval, ceiling);
        let start = Instant::now();

        let result: Result<(), _> = poll_until(&policy, "never", || async { Ok(None) }).await;

        let waited = start.elapsed();
        assert!(waited >= ceiling, "gave up early after {:?}", waited);
        assert!(waited <= ceiling + interval, "overran ceiling: {:?}", waited);
        match result {
            Err(PollError::Exhausted { polls, .. }) => assert_eq!(polls, 7),
            other => panic!("expected exhaustion, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn poll_budget_caps_checks() {
        let policy = PollPolicy::new(Duration::from_secs(10), Duration::from_secs(1800))
            .with_max_polls(180);
        let mut calls = 0u32;

        let result: Result<(), _> = poll_until(&policy, "marker", || {
            calls += 1;
            async { Ok(None) }
        })
        .await;

        assert_eq!(calls, 180);
        assert!(matches!(result, Err(PollError::Exhausted { polls: 180, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_check_error_stops_immediately() {
        let policy = PollPolicy::new(Duration::from_secs(10), Duration::from_secs(600));
        let mut calls = 0;

        let result: Result<(), _> = poll_until(&policy, "api", || {
            calls += 1;
            async { Err("forbidden".to_string()) }
        })
        .await;

        assert_eq!(calls, 1);
        assert_eq!(
            result,
            Err(PollError::Failed {
                description: "api".to_string(),
                message: "forbidden".to_string(),
            })
        );
    }
}

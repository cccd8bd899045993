//! Retry and convergence primitives.
//!
//! Remote compute APIs are eventually consistent: a volume reported as
//! attached may still refuse a detach for a short grace period, a copied
//! image stays `pending` for minutes. This library provides the two
//! helpers every caller uses to absorb that:
//!
//! - [`with_retry`]: re-run an operation while it fails with a retryable error.
//! - [`await_state`]: poll a resource until it reaches a target state.
//!
//! # Invariants
//!
//! - Non-retryable errors are returned immediately, without sleeping
//! - On exhaustion the last error is returned unchanged
//! - Every wait is bounded by [`RetryPolicy::max_attempts`]

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

/// Default attempt budget for remote operations.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 20;

/// Default delay before the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Ceiling applied to the exponential delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Exponential backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,

    /// Delay after the first failed attempt.
    pub base: Duration,

    /// Maximum delay between attempts.
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base: DEFAULT_BASE_DELAY,
            max: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the given attempt budget and delay bounds.
    pub fn new(max_attempts: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base,
            max,
        }
    }

    /// Delay to sleep after failed attempt number `attempt` (1-based).
    ///
    /// `min(base * 2^(attempt-1), max)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

/// Errors from [`await_state`].
#[derive(Debug, Error)]
pub enum WaitError<E> {
    /// The resource never reached the target state.
    #[error("timed out after {attempts} attempts waiting for {resource} to become {target}")]
    Timeout {
        resource: String,
        target: String,
        attempts: u32,
    },

    /// Polling itself failed.
    #[error(transparent)]
    Poll(E),
}

/// Run `operation` until it succeeds, fails with an error `is_retryable`
/// rejects, or the policy's attempt budget is spent.
pub async fn with_retry<T, E, F, Fut, R>(
    policy: &RetryPolicy,
    operation: &str,
    is_retryable: R,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: Display,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.max_attempts && is_retryable(&err) => {
                let delay = policy.delay(attempt);
                debug!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retryable failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                if attempt > 1 {
                    warn!(operation, attempts = attempt, error = %err, "Giving up");
                }
                return Err(err);
            }
        }
    }
}

/// Poll `poll` until `target` accepts the observed value.
///
/// The first poll happens immediately. Poll errors abort the wait; callers
/// that expect transient lookup failures should map them to a value the
/// predicate rejects.
pub async fn await_state<T, E, F, Fut, P>(
    resource: &str,
    target_name: &str,
    policy: &RetryPolicy,
    mut poll: F,
    target: P,
) -> Result<T, WaitError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&T) -> bool,
{
    for attempt in 1..=policy.max_attempts {
        let observed = poll().await.map_err(WaitError::Poll)?;
        if target(&observed) {
            debug!(resource, target = target_name, attempt, "Reached target state");
            return Ok(observed);
        }
        if attempt < policy.max_attempts {
            tokio::time::sleep(policy.delay(attempt)).await;
        }
    }

    warn!(resource, target = target_name, "Timed out waiting for state");
    Err(WaitError::Timeout {
        resource: resource.to_string(),
        target: target_name.to_string(),
        attempts: policy.max_attempts,
    })
}

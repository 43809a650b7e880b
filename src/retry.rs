//! Bounded exponential backoff.
//!
//! FreeIPA replicas behind a load balancer may not have a freshly added host
//! yet, so the read that follows a create is retried. Every error is retried;
//! the loop is bounded only by [`RetryPolicy::max_attempts`].

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Default delay before the second attempt.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Default total number of attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 8;

/// How often, and how patiently, an operation is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay after the first failure; doubled after each further failure.
    pub initial_delay: Duration,
    /// Total attempts including the first one. Zero is treated as one.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    /// Create a policy.
    pub fn new(initial_delay: Duration, max_attempts: u32) -> Self {
        Self {
            initial_delay,
            max_attempts,
        }
    }

    /// The worst-case time spent sleeping before giving up.
    pub fn max_total_delay(&self) -> Duration {
        let mut total = Duration::ZERO;
        let mut delay = self.initial_delay;
        for _ in 1..self.max_attempts.max(1) {
            total = total.saturating_add(delay);
            delay = delay.saturating_mul(2);
        }
        total
    }
}

/// Returned when every attempt failed.
#[derive(Debug)]
pub struct Exhausted<E> {
    /// Number of attempts made.
    pub attempts: u32,
    /// Error from the last attempt.
    pub last_error: E,
}

/// Run `op` until it succeeds or the policy runs out of attempts.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, Exhausted<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut delay = policy.initial_delay;
    let mut attempt = 0;

    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= max_attempts => {
                return Err(Exhausted {
                    attempts: attempt,
                    last_error: err,
                })
            },
            Err(err) => {
                debug!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            },
        }
    }
}

//! Bounded retry with exponential backoff.

use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Attempt budget and backoff curve for one kind of operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            attempts: 0,
            deadline: None,
        }
    }
}

/// Retry state: failed attempts so far, plus an optional wall-clock deadline.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempts: u32,
    deadline: Option<Instant>,
}

impl Backoff {
    /// Stop retrying once waiting would cross `deadline`.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Record a failed attempt and return how long to wait before the next
    /// one, or `None` when the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts >= self.policy.max_attempts {
            return None;
        }

        let exponent = (self.attempts - 1).min(31);
        let base = self
            .policy
            .initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.policy.max_backoff);
        let delay = (base + random_jitter(base / 4)).min(self.policy.max_backoff);

        match self.deadline {
            Some(deadline) if Instant::now() + delay > deadline => None,
            _ => Some(delay),
        }
    }

    /// Failed attempts recorded so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

/// Uniform random duration in `[0, max)`.
pub fn random_jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms > 0 {
        Duration::from_millis(rand::rng().random_range(0..max_ms))
    } else {
        Duration::ZERO
    }
}

/// Run `connect` until it succeeds or the policy is exhausted.
pub async fn connect_with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    endpoint: &str,
    mut connect: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut backoff = policy.backoff();
    loop {
        match connect().await {
            Ok(value) => {
                if backoff.attempts() > 0 {
                    info!(endpoint, retries = backoff.attempts(), "Connected after retrying");
                }
                return Ok(value);
            }
            Err(e) => match backoff.next_delay() {
                Some(delay) => {
                    warn!(
                        endpoint,
                        attempt = backoff.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Connection failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    error!(endpoint, attempts = backoff.attempts(), error = %e, "Giving up on connection");
                    return Err(e);
                }
            },
        }
    }
}

//! Retry policy applied around a single upstream page request.
//!
//! Two independent budgets are tracked per call:
//! - transient failures consume attempts and back off exponentially
//!   (`base_delay * 2^(attempt - 1)`, capped at `max_delay`);
//! - rate-limit responses wait for the server-suggested duration (or a default)
//!   and retry the same request without consuming an attempt. A separate cap
//!   keeps a permanently throttled upstream from stalling a run forever.

use crate::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time;
use tracing::{debug, warn};

/// How a failed attempt should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Cooperative wait, optionally with a server-provided duration.
    RateLimited(Option<Duration>),
    /// Transient failure: back off and try again while attempts remain.
    Retry,
    /// Permanent failure: surface immediately.
    Fail,
}

/// Classifies errors for [`RetryPolicy::run`].
pub trait Retryable {
    fn disposition(&self) -> Disposition;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts allowed for transient failures, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Wait used when a 429 carries no usable `Retry-After`.
    pub default_rate_limit_wait: Duration,
    /// Ceiling applied to any single rate-limit wait.
    pub max_rate_limit_wait: Duration,
    /// Rate-limit waits tolerated per call before giving up.
    pub max_rate_limit_waits: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            default_rate_limit_wait: Duration::from_secs(60),
            max_rate_limit_wait: Duration::from_secs(5 * 60),
            max_rate_limit_waits: 10,
        }
    }
}

impl RetryPolicy {
    /// Delay after the `failures`-th transient failure (1-based).
    pub fn backoff(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Wait before retrying a rate-limited request.
    pub fn rate_limit_wait(&self, hint: Option<Duration>) -> Duration {
        hint.unwrap_or(self.default_rate_limit_wait)
            .min(self.max_rate_limit_wait)
    }

    /// Run `operation` until it succeeds, fails permanently, or exhausts a budget.
    ///
    /// On exhaustion the last error is returned.
    pub async fn run<T, E, F, Fut>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + std::fmt::Display,
    {
        let mut failures = 0u32;
        let mut rate_limit_waits = 0u32;

        loop {
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            match err.disposition() {
                Disposition::Fail => return Err(err),
                Disposition::RateLimited(hint) => {
                    if rate_limit_waits >= self.max_rate_limit_waits {
                        warn!(
                            rate_limit_waits,
                            "Still rate limited after maximum waits, giving up"
                        );
                        return Err(err);
                    }
                    rate_limit_waits += 1;
                    let wait = self.rate_limit_wait(hint);
                    warn!(
                        wait = fmt::duration(wait),
                        server_hint = hint.is_some(),
                        rate_limit_waits,
                        "Rate limited, waiting before retrying the same request"
                    );
                    time::sleep(wait).await;
                }
                Disposition::Retry => {
                    failures += 1;
                    if failures >= self.max_attempts {
                        debug!(attempts = failures, error = %err, "Retry attempts exhausted");
                        return Err(err);
                    }
                    let delay = self.backoff(failures);
                    warn!(
                        attempt = failures,
                        max_attempts = self.max_attempts,
                        delay = fmt::duration(delay),
                        error = %err,
                        "Request failed, retrying"
                    );
                    time::sleep(delay).await;
                }
            }
        }
    }
}

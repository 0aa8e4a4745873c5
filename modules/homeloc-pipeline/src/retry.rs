use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use homeloc_common::RetrySettings;

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Give up and return the error.
    Fail,
    /// Sleep on the backoff schedule and try again; consumes an attempt.
    Backoff,
    /// Sleep exactly this long and try again; does not consume an attempt.
    WaitFor(Duration),
}

/// Bounded retry with exponential backoff: `base * factor^attempt + jitter`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub factor: u32,
    pub max_jitter: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            factor: 1,
            max_jitter: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt + 1` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let backoff = self.base_delay * self.factor.saturating_pow(attempt);
        let jitter_ms = self.max_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return backoff;
        }
        backoff + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }

    /// Run `op` until it succeeds, `classify` says to fail, or attempts run out.
    pub async fn run<T, E, F, Fut, C>(&self, label: &str, mut op: F, classify: C) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> RetryAction,
        E: Display,
    {
        let mut attempt = 0u32;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            match classify(&err) {
                RetryAction::Fail => return Err(err),
                RetryAction::WaitFor(wait) => {
                    warn!(label, wait_secs = wait.as_secs(), error = %err, "Rate limited, waiting");
                    tokio::time::sleep(wait).await;
                }
                RetryAction::Backoff => {
                    if attempt + 1 >= self.max_attempts {
                        return Err(err);
                    }
                    let delay = self.delay_for(attempt);
                    debug!(
                        label,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(s: &RetrySettings) -> Self {
        Self {
            max_attempts: s.max_attempts.max(1),
            base_delay: s.base_delay(),
            factor: s.factor,
            max_jitter: s.max_jitter(),
        }
    }
}

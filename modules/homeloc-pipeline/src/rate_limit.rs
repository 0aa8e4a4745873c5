use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Global minimum spacing between request starts, shared by every worker.
///
/// A token bucket of size one: request N+1 may not start earlier than
/// `min_interval` after request N started, regardless of which worker issued
/// either request.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_start: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_start: Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wait for this caller's slot. The lock is held across the sleep so
    /// waiters are released one at a time, in arrival order.
    pub async fn acquire(&self) {
        let mut last = self.last_start.lock().await;
        if let Some(prev) = *last {
            tokio::time::sleep_until(prev + self.min_interval).await;
        }
        *last = Some(Instant::now());
    }
}

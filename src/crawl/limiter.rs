//! Pool-wide rate limiting.
//!
//! One window for the whole fetcher pool, not per host: every fetcher
//! funnels through a mutex around the last-issue timestamp, sleeping as
//! long as it takes to keep the configured spacing. With jitter enabled,
//! each acquisition scales the delay by a factor drawn from the
//! configured range before entering the critical section.

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant, sleep};
use tracing::debug;

use crate::config::RandomDelay;

/// Enforces a minimum spacing between fetch starts across all fetchers.
pub(crate) struct RateLimiter {
    delay: Duration,
    random: RandomDelay,
    last_issue: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub(crate) fn new(delay: Duration, random: RandomDelay) -> Self {
        Self {
            delay,
            random,
            last_issue: Mutex::new(None),
        }
    }

    /// A limiter that never delays; used when no download delay is
    /// configured.
    pub(crate) fn disabled() -> Self {
        Self::new(Duration::ZERO, RandomDelay::Off)
    }

    pub(crate) fn is_disabled(&self) -> bool {
        self.delay.is_zero()
    }

    /// Waits until this fetcher may start its fetch, then stamps the
    /// window. The first acquisition goes through immediately.
    pub(crate) async fn acquire(&self) {
        if self.is_disabled() {
            return;
        }

        let delay = self.jittered();
        let mut last_issue = self.last_issue.lock().await;
        if let Some(last) = *last_issue {
            let elapsed = last.elapsed();
            if elapsed < delay {
                let wait = delay - elapsed;
                debug!(wait_ms = wait.as_millis(), "rate limit");
                sleep(wait).await;
            }
        }
        *last_issue = Some(Instant::now());
    }

    /// The delay for one acquisition, scaled by the jitter factor when
    /// jitter is enabled.
    fn jittered(&self) -> Duration {
        match self.random.bounds() {
            None => self.delay,
            Some((low, high)) => {
                let factor = rand::thread_rng().gen_range(low..=high);
                self.delay.mul_f64(factor)
            }
        }
    }
}

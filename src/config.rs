//! Crawl configuration and validation.
//!
//! A [`Config`] is supplied per spider through [`Spider::config`] and
//! validated once when the [`Crawler`] is constructed. Invalid knobs are
//! construction errors, not runtime surprises.
//!
//! [`Spider::config`]: crate::spider::Spider::config
//! [`Crawler`]: crate::crawl::Crawler

use std::collections::HashSet;
use std::time::Duration;

use reqwest::ClientBuilder;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue, USER_AGENT};
use thiserror::Error;

/// Default total request timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of retries for a transient download failure.
const DEFAULT_RETRY_TIMES: u32 = 3;

/// Default delay before a retryable request is re-enqueued.
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Default capacity of the request queue.
const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Status codes retried by default.
pub const DEFAULT_RETRY_CODES: [u16; 6] = [500, 502, 503, 504, 408, 429];

/// Default jitter bounds applied to the download delay.
const DEFAULT_JITTER: (f64, f64) = (0.5, 1.5);

/// Request timeout, either one overall budget or a connect/read split.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Timeout {
    /// One budget covering the whole request.
    Total(Duration),
    /// Separate connect and read budgets.
    ConnectRead(Duration, Duration),
}

impl Timeout {
    /// Applies this timeout to a client under construction. The connect
    /// timeout is a client-level knob in the HTTP client, which is why the
    /// split form cannot be overridden per request.
    pub(crate) fn apply(&self, builder: ClientBuilder) -> ClientBuilder {
        match *self {
            Self::Total(d) => builder.timeout(d),
            Self::ConnectRead(connect, read) => {
                builder.connect_timeout(connect).read_timeout(read)
            }
        }
    }

    fn is_positive(&self) -> bool {
        match *self {
            Self::Total(d) => !d.is_zero(),
            Self::ConnectRead(c, r) => !c.is_zero() && !r.is_zero(),
        }
    }
}

/// Jitter applied to the download delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RandomDelay {
    /// No jitter; every fetch waits exactly the configured delay.
    Off,
    /// Jitter with the stock bounds (0.5 to 1.5 times the delay).
    On,
    /// Jitter with explicit bounds.
    Range(f64, f64),
}

impl RandomDelay {
    /// The multiplier bounds, or `None` when jitter is off.
    pub(crate) fn bounds(&self) -> Option<(f64, f64)> {
        match *self {
            Self::Off => None,
            Self::On => Some(DEFAULT_JITTER),
            Self::Range(low, high) => Some(if low > high { (high, low) } else { (low, high) }),
        }
    }
}

/// Error type for configuration validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The fetcher pool must have at least one worker.
    #[error("workers must be at least 1")]
    InvalidWorkers,

    /// Timeouts must be positive.
    #[error("timeout must be positive")]
    InvalidTimeout,

    /// A retry code outside the HTTP error range.
    #[error("retry code {code} is outside [400, 600)")]
    InvalidRetryCode {
        /// The offending code.
        code: u16,
    },

    /// The request queue needs room for at least one request.
    #[error("request queue capacity must be at least 1")]
    InvalidQueueCapacity,

    /// Jitter bounds must be positive numbers.
    #[error("random delay bounds must be positive, got ({low}, {high})")]
    InvalidDelayRange {
        low: f64,
        high: f64,
    },
}

/// Tunable knobs of a crawl.
#[derive(Debug, Clone)]
pub struct Config {
    /// Size of the concurrent fetcher pool.
    pub workers: usize,
    /// HTTP timeout applied to every request unless overridden.
    pub timeout: Timeout,
    /// Minimum spacing between fetches across the whole pool. Zero
    /// disables rate limiting.
    pub download_delay: Duration,
    /// Jitter applied to `download_delay`.
    pub random_delay: RandomDelay,
    /// How many times a transient download failure is re-attempted.
    pub retry_times: u32,
    /// Status codes treated as transient failures.
    pub retry_codes: HashSet<u16>,
    /// Delay before a retried request re-enters the queue.
    pub retry_delay: Duration,
    /// Capacity of the bounded request queue.
    pub queue_capacity: usize,
    /// Headers merged into every request without overwriting user values.
    pub default_headers: HeaderMap,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            timeout: Timeout::Total(DEFAULT_TIMEOUT),
            download_delay: Duration::ZERO,
            random_delay: RandomDelay::On,
            retry_times: DEFAULT_RETRY_TIMES,
            retry_codes: DEFAULT_RETRY_CODES.into_iter().collect(),
            retry_delay: DEFAULT_RETRY_DELAY,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            default_headers: default_headers(),
        }
    }
}

impl Config {
    /// Checks every knob against its constraint.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::InvalidWorkers);
        }
        if !self.timeout.is_positive() {
            return Err(ConfigError::InvalidTimeout);
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidQueueCapacity);
        }
        for &code in &self.retry_codes {
            if !(400..600).contains(&code) {
                return Err(ConfigError::InvalidRetryCode { code });
            }
        }
        if let Some((low, high)) = self.random_delay.bounds() {
            if low <= 0.0 || high <= 0.0 {
                return Err(ConfigError::InvalidDelayRange { low, high });
            }
        }
        Ok(())
    }
}

/// Twice the available parallelism, the conventional size for an
/// IO-bound worker pool.
fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZero::get)
        .unwrap_or(4)
        * 2
}

fn default_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_static(concat!("spinneret/", env!("CARGO_PKG_VERSION"))),
    );
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
    );
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en"));
    headers
}

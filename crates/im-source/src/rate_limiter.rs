use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors that can occur when acquiring a token from the limiter.
///
/// # Examples
///
/// ```rust
/// use im_source::rate_limiter::{RateLimiter, RateLimitConfig, RateLimitError};
///
/// let limiter = RateLimiter::new(RateLimitConfig::per_second(10));
/// match limiter.try_acquire() {
///     Err(RateLimitError::Exceeded { retry_after }) => {
///         println!("bucket empty, retry after {retry_after:?}");
///     }
///     Err(RateLimitError::Cancelled) => unreachable!(),
///     Ok(()) => {}
/// }
/// ```
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    /// The bucket had no token for a non-blocking acquisition.
    #[error("rate limit exceeded – retry after {retry_after:?}")]
    Exceeded {
        /// Duration until the next token becomes available.
        retry_after: Duration,
    },

    /// The caller's cancellation token fired while waiting for a token.
    /// No token was consumed.
    #[error("cancelled while waiting for a rate-limit token")]
    Cancelled,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Tokens added per second (sustained rate).
    pub tokens_per_second: f64,
    /// Maximum burst size (bucket capacity).
    pub max_burst: f64,
}

impl RateLimitConfig {
    /// Allow `count` requests per second with an equal burst.
    pub fn per_second(count: u64) -> Self {
        Self {
            tokens_per_second: count as f64,
            max_burst: count as f64,
        }
    }

    /// Override the max burst capacity.
    pub fn with_burst(mut self, burst: u64) -> Self {
        self.max_burst = burst as f64;
        self
    }
}

impl Default for RateLimitConfig {
    /// 10 requests per second, burst of 20.
    fn default() -> Self {
        Self::per_second(10).with_burst(20)
    }
}

impl From<&im_core::config::RateLimitSettings> for RateLimitConfig {
    fn from(settings: &im_core::config::RateLimitSettings) -> Self {
        Self {
            tokens_per_second: settings.requests_per_second,
            max_burst: f64::from(settings.burst),
        }
    }
}

// ---------------------------------------------------------------------------
// Bucket
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(max_burst: f64) -> Self {
        Self {
            tokens: max_burst,
            last_refill: Instant::now(),
        }
    }

    /// Refill tokens based on elapsed time, capped at `max_burst`.
    fn refill(&mut self, tokens_per_second: f64, max_burst: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * tokens_per_second).min(max_burst);
        self.last_refill = now;
    }

    /// Try to consume one token. Returns the wait until one is available
    /// otherwise.
    fn try_consume(&mut self, tokens_per_second: f64, max_burst: f64) -> Result<(), Duration> {
        self.refill(tokens_per_second, max_burst);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(deficit / tokens_per_second))
        }
    }
}

// ---------------------------------------------------------------------------
// RateLimiter
// ---------------------------------------------------------------------------

/// Single-bucket limiter shared by every call of one source client.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let bucket = Mutex::new(TokenBucket::new(config.max_burst));
        Self { config, bucket }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Wait until a token is available, or fail with
    /// [`RateLimitError::Cancelled`] once `cancel` fires.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), RateLimitError> {
        loop {
            if cancel.is_cancelled() {
                return Err(RateLimitError::Cancelled);
            }

            let wait = {
                let mut bucket = self.bucket.lock().await;
                match bucket.try_consume(self.config.tokens_per_second, self.config.max_burst) {
                    Ok(()) => return Ok(()),
                    Err(wait) => wait,
                }
            };

            debug!(?wait, "rate limiter waiting for token");
            tokio::select! {
                _ = cancel.cancelled() => return Err(RateLimitError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Non-blocking variant of [`acquire`](Self::acquire).
    pub fn try_acquire(&self) -> Result<(), RateLimitError> {
        let mut bucket = self
            .bucket
            .try_lock()
            .map_err(|_| RateLimitError::Exceeded {
                retry_after: Duration::ZERO,
            })?;
        bucket
            .try_consume(self.config.tokens_per_second, self.config.max_burst)
            .map_err(|retry_after| RateLimitError::Exceeded { retry_after })
    }

    /// Approximate number of tokens currently available.
    pub async fn remaining(&self) -> f64 {
        let bucket = self.bucket.lock().await;
        let elapsed = bucket.last_refill.elapsed().as_secs_f64();
        (bucket.tokens + elapsed * self.config.tokens_per_second).min(self.config.max_burst)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

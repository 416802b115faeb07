//! Sign-in attempt throttling
//!
//! Counts attempts per client in a fixed window. When the limiter itself is
//! unreachable the attempt is let through: a Redis outage must not lock every
//! user out.

use async_trait::async_trait;
use redis::RedisResult;
use redis_utils::{RateLimitWindow, RateLimiter};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::RateLimitSettings;
use crate::error::{IdentityError, Result};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AttemptLimiter: Send + Sync {
    /// Count one attempt against `key` and report the window it landed in.
    async fn record_attempt(&self, key: &str, window: Duration) -> RedisResult<RateLimitWindow>;
}

#[async_trait]
impl AttemptLimiter for RateLimiter {
    async fn record_attempt(&self, key: &str, window: Duration) -> RedisResult<RateLimitWindow> {
        self.increment(key, window).await
    }
}

#[derive(Clone)]
pub struct SignInThrottle {
    limiter: Arc<dyn AttemptLimiter>,
    limit: u64,
    window: Duration,
}

impl SignInThrottle {
    pub fn new(limiter: Arc<dyn AttemptLimiter>, limit: u64, window: Duration) -> Self {
        Self {
            limiter,
            limit,
            window,
        }
    }

    pub fn from_settings(limiter: Arc<dyn AttemptLimiter>, settings: &RateLimitSettings) -> Self {
        Self::new(limiter, settings.sign_in_limit, settings.sign_in_window())
    }

    /// Record an attempt for `client_key`, failing with `RateLimited` once
    /// the window's budget is spent.
    pub async fn check(&self, client_key: &str) -> Result<()> {
        let key = throttle_key(client_key);

        match self.limiter.record_attempt(&key, self.window).await {
            Ok(window) if window.exceeds(self.limit) => {
                let retry_after_secs = retry_after_secs(window.remaining);
                warn!(
                    client = client_key,
                    attempts = window.count,
                    retry_after_secs,
                    "Sign-in rate limit exceeded"
                );
                Err(IdentityError::RateLimited { retry_after_secs })
            }
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(client = client_key, error = %e, "Sign-in rate limiter unavailable; allowing attempt");
                Ok(())
            }
        }
    }
}

fn throttle_key(client_key: &str) -> String {
    format!("signin:{}", client_key)
}

// Whole seconds, rounded up, never zero.
fn retry_after_secs(remaining: Duration) -> u64 {
    let secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
    secs.max(1)
}

//! Fixed-window request counters.
//!
//! Increment, first-hit expiry and the remaining-TTL read run as one Lua
//! script, so concurrent callers never race between `INCR` and `PEXPIRE`
//! and the reset time comes from the same round trip as the count.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use redis::{AsyncCommands, RedisResult, Script};
use std::time::Duration;
use tracing::debug;

use crate::{connection, with_timeout, SharedConnectionManager, DEFAULT_OPERATION_TIMEOUT};

const INCREMENT_SCRIPT: &str = r#"
local current = redis.call('INCR', KEYS[1])
if current == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
local ttl = redis.call('PTTL', KEYS[1])
return {current, ttl}
"#;

static INCREMENT: Lazy<Script> = Lazy::new(|| Script::new(INCREMENT_SCRIPT));

/// State of one counter right after an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitWindow {
    pub count: u64,
    /// Time left in the current window.
    pub remaining: Duration,
    pub reset_at: DateTime<Utc>,
}

impl RateLimitWindow {
    pub fn exceeds(&self, limit: u64) -> bool {
        self.count > limit
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    redis: SharedConnectionManager,
    prefix: String,
    op_timeout: Duration,
}

impl RateLimiter {
    /// Counters live under `{namespace}:ratelimit:{key}`.
    pub fn new(redis: SharedConnectionManager, namespace: &str) -> Self {
        Self {
            redis,
            prefix: format!("{}:ratelimit", namespace),
            op_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    pub fn with_op_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }

    /// Count one hit against `key`. The first hit opens a window of length `window`.
    pub async fn increment(&self, key: &str, window: Duration) -> RedisResult<RateLimitWindow> {
        let redis_key = self.key(key);
        let window_ms = window.as_millis().max(1) as u64;
        let mut conn = connection(&self.redis).await;

        let (count, ttl_ms): (i64, i64) = with_timeout(
            self.op_timeout,
            INCREMENT.key(&redis_key).arg(window_ms).invoke_async(&mut conn),
        )
        .await?;

        // PTTL is negative only if the key lost its expiry outside this script.
        let remaining = Duration::from_millis(ttl_ms.max(0) as u64);
        let reset_at = Utc::now()
            + chrono::Duration::from_std(remaining).unwrap_or_else(|_| chrono::Duration::zero());

        debug!(key = %redis_key, count, ttl_ms, "rate limit counter incremented");

        Ok(RateLimitWindow {
            count: count.max(0) as u64,
            remaining,
            reset_at,
        })
    }

    /// Current count for `key`. A missing key means no hits in the current window.
    pub async fn get_count(&self, key: &str) -> RedisResult<u64> {
        let mut conn = connection(&self.redis).await;
        let count: Option<u64> = with_timeout(self.op_timeout, conn.get(self.key(key))).await?;
        Ok(count.unwrap_or(0))
    }

    pub async fn reset(&self, key: &str) -> RedisResult<()> {
        let mut conn = connection(&self.redis).await;
        with_timeout(self.op_timeout, conn.del(self.key(key))).await
    }
}

//! Token blacklist using Redis
//!
//! Blocks individual token ids (`jti`) that were revoked before their natural
//! expiry. Each entry lives exactly as long as the token it blocks, so the
//! blacklist never grows past the set of still-valid revoked tokens.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use redis_utils::{with_timeout, DEFAULT_OPERATION_TIMEOUT};
use std::time::Duration;
use tracing::{debug, info};

/// Floor for entry lifetimes; a shorter PX is indistinguishable from a race with expiry.
pub const MIN_BLACKLIST_TTL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlacklistOutcome {
    Added { ttl: Duration },
    /// The token already expired on its own; nothing was written.
    AlreadyExpired,
}

/// Token blacklist manager using Redis
#[derive(Clone)]
pub struct TokenBlacklist {
    redis: ConnectionManager,
    prefix: String,
    op_timeout: Duration,
}

impl TokenBlacklist {
    /// Entries live under `{namespace}:blacklist:{jti}`.
    pub fn new(redis: ConnectionManager, namespace: &str) -> Self {
        Self {
            redis,
            prefix: format!("{}:blacklist", namespace),
            op_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    pub fn with_op_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    fn key(&self, jti: &str) -> String {
        format!("{}:{}", self.prefix, jti)
    }

    /// Block `jti` until `expires_at`.
    pub async fn blacklist(&self, jti: &str, expires_at: DateTime<Utc>) -> Result<BlacklistOutcome> {
        let remaining = expires_at - Utc::now();
        let Ok(remaining) = remaining.to_std() else {
            debug!(jti = %jti, "Token already expired, skipping blacklist entry");
            return Ok(BlacklistOutcome::AlreadyExpired);
        };
        if remaining.is_zero() {
            return Ok(BlacklistOutcome::AlreadyExpired);
        }

        let ttl = remaining.max(MIN_BLACKLIST_TTL);
        let mut conn = self.redis.clone();
        let _: () = with_timeout(
            self.op_timeout,
            conn.pset_ex(self.key(jti), 1u8, ttl.as_millis() as u64),
        )
        .await
        .context("Failed to add token to blacklist in Redis")?;

        info!(jti = %jti, ttl_ms = ttl.as_millis() as u64, "Token added to blacklist");
        Ok(BlacklistOutcome::Added { ttl })
    }

    pub async fn is_blacklisted(&self, jti: &str) -> Result<bool> {
        let mut conn = self.redis.clone();
        let exists: bool = with_timeout(self.op_timeout, conn.exists(self.key(jti)))
            .await
            .context("Failed to check token blacklist in Redis")?;
        Ok(exists)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis_utils::test_utils::{get_test_redis_connection, unique_namespace};

    async fn setup_test_blacklist() -> Option<TokenBlacklist> {
        match get_test_redis_connection().await {
            Ok(manager) => Some(TokenBlacklist::new(manager, &unique_namespace("blacklist"))),
            Err(e) => {
                eprintln!("Skipping test - Redis not available: {}", e);
                None
            }
        }
    }

    #[tokio::test]
    async fn test_blacklist_until_expiry() {
        let Some(blacklist) = setup_test_blacklist().await else {
            return;
        };

        let outcome = blacklist
            .blacklist("jti-live", Utc::now() + chrono::Duration::seconds(60))
            .await
            .unwrap();
        match outcome {
            BlacklistOutcome::Added { ttl } => {
                assert!(ttl > Duration::from_secs(55) && ttl <= Duration::from_secs(60))
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(blacklist.is_blacklisted("jti-live").await.unwrap());

        let mut conn = blacklist.redis.clone();
        let pttl: i64 = conn.pttl(blacklist.key("jti-live")).await.unwrap();
        assert!(pttl > 0 && pttl <= 60_000);
    }

    #[tokio::test]
    async fn test_expired_token_is_not_written() {
        let Some(blacklist) = setup_test_blacklist().await else {
            return;
        };

        let outcome = blacklist
            .blacklist("jti-dead", Utc::now() - chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(outcome, BlacklistOutcome::AlreadyExpired);
        assert!(!blacklist.is_blacklisted("jti-dead").await.unwrap());
    }

    #[tokio::test]
    async fn test_short_ttl_is_clamped() {
        let Some(blacklist) = setup_test_blacklist().await else {
            return;
        };

        let outcome = blacklist
            .blacklist("jti-short", Utc::now() + chrono::Duration::milliseconds(20))
            .await
            .unwrap();
        // Either clamped up to the floor or already past expiry by the time we computed it.
        if let BlacklistOutcome::Added { ttl } = outcome {
            assert!(ttl >= MIN_BLACKLIST_TTL);
        }
    }
}

//! Ephemeral session index (Redis)
//!
//! Two kinds of entries, both expiring with the token they describe:
//!
//! - refresh mirrors at `{namespace}:refresh:{user_id}:{token_id}`, holding
//!   the token digest, so all of a user's sessions can be swept by prefix
//! - blacklisted token ids at `{namespace}:blacklist:{jti}`
//!
//! The durable store stays authoritative. Losing this index costs latency,
//! never correctness.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jwt_security::TokenBlacklist;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use redis_utils::scan::{DEFAULT_MAX_SCAN_ITERATIONS, DEFAULT_SCAN_BATCH_SIZE};
use redis_utils::{
    with_timeout, KeySweep, SweepControl, SweepError, SweepReport, DEFAULT_OPERATION_TIMEOUT,
};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::RedisSettings;

/// Mirrors closer than this to expiry are refused.
pub const MIN_MIRROR_TTL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum SessionIndexError {
    #[error("token expires in {remaining_ms}ms, too close to expiry to index")]
    TokenNearExpiry { remaining_ms: i64 },

    #[error("session sweep exceeded {limit} scan iterations after deleting {deleted} keys")]
    ScanIterationLimitExceeded { limit: u32, deleted: u64 },

    #[error("session sweep cancelled after deleting {deleted} keys")]
    Cancelled { deleted: u64 },

    #[error("session sweep deadline exceeded after deleting {deleted} keys")]
    DeadlineExceeded { deleted: u64 },

    #[error("redis error: {0}")]
    Redis(String),
}

impl From<redis::RedisError> for SessionIndexError {
    fn from(err: redis::RedisError) -> Self {
        SessionIndexError::Redis(err.to_string())
    }
}

impl From<anyhow::Error> for SessionIndexError {
    fn from(err: anyhow::Error) -> Self {
        SessionIndexError::Redis(format!("{:#}", err))
    }
}

impl From<SweepError> for SessionIndexError {
    fn from(err: SweepError) -> Self {
        match err {
            SweepError::Redis(e) => SessionIndexError::Redis(e.to_string()),
            SweepError::Cancelled(report) => SessionIndexError::Cancelled {
                deleted: report.deleted,
            },
            SweepError::DeadlineExceeded(report) => SessionIndexError::DeadlineExceeded {
                deleted: report.deleted,
            },
            SweepError::IterationLimitExceeded { limit, report } => {
                SessionIndexError::ScanIterationLimitExceeded {
                    limit,
                    deleted: report.deleted,
                }
            }
        }
    }
}

#[async_trait]
pub trait SessionIndex: Send + Sync {
    /// Mirror a live refresh token until `expires_at`.
    async fn store_refresh_mirror(
        &self,
        user_id: Uuid,
        token_id: &str,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), SessionIndexError>;

    /// Digest stored for the token, if the mirror is still present.
    async fn get_refresh_mirror(
        &self,
        user_id: Uuid,
        token_id: &str,
    ) -> Result<Option<String>, SessionIndexError>;

    async fn remove_refresh_mirror(&self, user_id: Uuid, token_id: &str)
        -> Result<(), SessionIndexError>;

    /// Block `token_id` until `expires_at`. Already expired ids are a no-op.
    async fn blacklist(&self, token_id: &str, expires_at: DateTime<Utc>)
        -> Result<(), SessionIndexError>;

    async fn is_blacklisted(&self, token_id: &str) -> Result<bool, SessionIndexError>;

    /// Delete every refresh mirror of `user_id`, batch by batch, stopping
    /// early when `control` says so.
    async fn delete_all_for_user(
        &self,
        user_id: Uuid,
        control: &SweepControl,
    ) -> Result<SweepReport, SessionIndexError>;
}

#[derive(Clone)]
pub struct EphemeralSessionIndex {
    redis: ConnectionManager,
    refresh_prefix: String,
    blacklist: TokenBlacklist,
    scan_batch_size: usize,
    scan_max_iterations: u32,
    op_timeout: Duration,
}

impl EphemeralSessionIndex {
    pub fn new(redis: ConnectionManager, namespace: &str) -> Self {
        Self {
            blacklist: TokenBlacklist::new(redis.clone(), namespace),
            redis,
            refresh_prefix: format!("{}:refresh", namespace),
            scan_batch_size: DEFAULT_SCAN_BATCH_SIZE,
            scan_max_iterations: DEFAULT_MAX_SCAN_ITERATIONS,
            op_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    pub fn from_settings(redis: ConnectionManager, settings: &RedisSettings) -> Self {
        Self::new(redis, &settings.namespace)
            .with_scan_limits(settings.scan_batch_size, settings.scan_max_iterations)
            .with_op_timeout(settings.op_timeout())
    }

    pub fn with_scan_limits(mut self, batch_size: usize, max_iterations: u32) -> Self {
        self.scan_batch_size = batch_size.max(1);
        self.scan_max_iterations = max_iterations.max(1);
        self
    }

    pub fn with_op_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self.blacklist = self.blacklist.with_op_timeout(op_timeout);
        self
    }

    fn mirror_key(&self, user_id: Uuid, token_id: &str) -> String {
        mirror_key(&self.refresh_prefix, user_id, token_id)
    }
}

fn mirror_key(prefix: &str, user_id: Uuid, token_id: &str) -> String {
    format!("{}:{}:{}", prefix, user_id, token_id)
}

fn user_prefix(prefix: &str, user_id: Uuid) -> String {
    format!("{}:{}:", prefix, user_id)
}

/// Milliseconds until `expires_at`, or `TokenNearExpiry` when under the floor.
fn mirror_ttl_ms(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64, SessionIndexError> {
    let remaining_ms = (expires_at - now).num_milliseconds();
    if remaining_ms < MIN_MIRROR_TTL.as_millis() as i64 {
        return Err(SessionIndexError::TokenNearExpiry { remaining_ms });
    }
    Ok(remaining_ms as u64)
}

#[async_trait]
impl SessionIndex for EphemeralSessionIndex {
    async fn store_refresh_mirror(
        &self,
        user_id: Uuid,
        token_id: &str,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), SessionIndexError> {
        let ttl_ms = mirror_ttl_ms(expires_at, Utc::now())?;
        let key = self.mirror_key(user_id, token_id);
        let mut conn = self.redis.clone();

        with_timeout(self.op_timeout, conn.pset_ex::<_, _, ()>(&key, token_hash, ttl_ms)).await?;

        debug!(user_id = %user_id, token_id, ttl_ms, "Stored refresh token mirror");
        Ok(())
    }

    async fn get_refresh_mirror(
        &self,
        user_id: Uuid,
        token_id: &str,
    ) -> Result<Option<String>, SessionIndexError> {
        let key = self.mirror_key(user_id, token_id);
        let mut conn = self.redis.clone();

        let digest: Option<String> = with_timeout(self.op_timeout, conn.get(&key)).await?;
        Ok(digest)
    }

    async fn remove_refresh_mirror(
        &self,
        user_id: Uuid,
        token_id: &str,
    ) -> Result<(), SessionIndexError> {
        let key = self.mirror_key(user_id, token_id);
        let mut conn = self.redis.clone();

        with_timeout(self.op_timeout, conn.del::<_, ()>(&key)).await?;
        Ok(())
    }

    async fn blacklist(
        &self,
        token_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), SessionIndexError> {
        self.blacklist.blacklist(token_id, expires_at).await?;
        Ok(())
    }

    async fn is_blacklisted(&self, token_id: &str) -> Result<bool, SessionIndexError> {
        Ok(self.blacklist.is_blacklisted(token_id).await?)
    }

    async fn delete_all_for_user(
        &self,
        user_id: Uuid,
        control: &SweepControl,
    ) -> Result<SweepReport, SessionIndexError> {
        let mut sweep = KeySweep::for_prefix(&user_prefix(&self.refresh_prefix, user_id))
            .batch_size(self.scan_batch_size)
            .max_iterations(self.scan_max_iterations)
            .op_timeout(self.op_timeout);
        let mut conn = self.redis.clone();

        let report = sweep.run(&mut conn, control).await?;

        info!(
            user_id = %user_id,
            deleted = report.deleted,
            iterations = report.iterations,
            "Deleted refresh token mirrors for user"
        );
        Ok(report)
    }
}

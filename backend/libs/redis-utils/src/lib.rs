//! Shared Redis plumbing for the session services.
//!
//! - [`RedisPool`]: a single multiplexed [`ConnectionManager`] shared behind a Tokio mutex
//! - [`with_timeout`]: bounds every round trip so a stalled server surfaces as an error
//! - [`scan::KeySweep`]: resumable cursor sweep for prefix deletes
//! - [`rate_limit::RateLimiter`]: atomic fixed-window counters backed by a Lua script

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::{Client, ErrorKind, RedisError, RedisResult};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Duration;
use tracing::info;

pub mod rate_limit;
pub mod scan;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use rate_limit::{RateLimitWindow, RateLimiter};
pub use scan::{KeySweep, SweepControl, SweepError, SweepReport};

/// Default bound for a single Redis round trip.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(3);

/// Shared Redis connection manager guarded by a Tokio mutex.
pub type SharedConnectionManager = Arc<Mutex<ConnectionManager>>;

/// Redis connection pool.
///
/// `ConnectionManager` multiplexes over one connection and reconnects on its
/// own, so callers clone it out of the mutex instead of holding the lock
/// across commands.
pub struct RedisPool {
    manager: SharedConnectionManager,
}

impl RedisPool {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url).context("failed to parse REDIS_URL connection string")?;
        let connection_manager = ConnectionManager::new(client)
            .await
            .context("failed to initialize Redis connection manager")?;

        info!("Redis connection manager initialized");

        Ok(Self {
            manager: Arc::new(Mutex::new(connection_manager)),
        })
    }

    pub fn from_manager(manager: ConnectionManager) -> Self {
        Self {
            manager: Arc::new(Mutex::new(manager)),
        }
    }

    pub fn manager(&self) -> SharedConnectionManager {
        self.manager.clone()
    }
}

/// Clone a connection handle out of the shared manager.
pub async fn connection(manager: &SharedConnectionManager) -> ConnectionManager {
    manager.lock().await.clone()
}

/// Run a Redis future with an upper bound on its latency.
///
/// Elapsed deadlines come back as an `IoError`-kind [`RedisError`] so callers
/// keep a single error type for "Redis did not answer".
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> RedisResult<T>
where
    F: Future<Output = RedisResult<T>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(timeout_error(duration)),
    }
}

fn timeout_error(duration: Duration) -> RedisError {
    RedisError::from((
        ErrorKind::IoError,
        "redis operation timed out",
        format!("no reply within {}ms", duration.as_millis()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn with_timeout_passes_through_result() {
        let value = with_timeout(Duration::from_secs(1), async { Ok::<_, RedisError>(7u64) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn with_timeout_reports_elapsed_as_io_error() {
        let result: RedisResult<()> = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IoError);
        assert!(err.to_string().contains("timed out"));
    }
}

//! Test utilities for Redis-backed components
//!
//! Tests that need a live server call [`get_test_redis_connection`] and skip
//! themselves when it fails.

use anyhow::Result;
use redis::aio::ConnectionManager;
use redis::Client;
use std::env;

/// Get Redis connection for testing
///
/// Uses REDIS_TEST_URL environment variable or defaults to localhost
pub async fn get_test_redis_connection() -> Result<ConnectionManager> {
    let redis_url =
        env::var("REDIS_TEST_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());

    let client = Client::open(redis_url)
        .map_err(|e| anyhow::anyhow!("Failed to create Redis client: {}", e))?;

    let manager = tokio::time::timeout(
        std::time::Duration::from_secs(2),
        ConnectionManager::new(client),
    )
    .await
    .map_err(|_| anyhow::anyhow!("Timed out connecting to Redis"))?
    .map_err(|e| anyhow::anyhow!("Failed to connect to Redis: {}", e))?;

    Ok(manager)
}

/// Unique key namespace so concurrent test runs never collide.
pub fn unique_namespace(label: &str) -> String {
    format!("test:{}:{}", label, uuid::Uuid::new_v4().simple())
}

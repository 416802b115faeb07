/// Background cleanup of expired refresh-token records
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::config::MaintenanceSettings;
use crate::db::SessionStore;

#[derive(Debug, Clone)]
pub struct TokenCleanupConfig {
    pub interval: Duration,
}

impl Default for TokenCleanupConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
        }
    }
}

impl From<&MaintenanceSettings> for TokenCleanupConfig {
    fn from(settings: &MaintenanceSettings) -> Self {
        Self {
            interval: Duration::from_secs(settings.cleanup_interval_secs.max(1)),
        }
    }
}

/// Delete expired refresh records every `config.interval` until `shutdown`
/// flips to `true` or its sender is dropped.
pub fn spawn_token_cleanup(
    sessions: Arc<dyn SessionStore>,
    config: TokenCleanupConfig,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    info!(
        interval_secs = config.interval.as_secs(),
        "Starting refresh token cleanup task"
    );

    tokio::spawn(async move {
        let mut ticker = interval(config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match sessions.cleanup_expired().await {
                        Ok(0) => debug!("No expired refresh tokens to clean up"),
                        Ok(deleted) => info!(deleted, "Cleaned up expired refresh tokens"),
                        Err(e) => error!(error = %e, "Refresh token cleanup failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Refresh token cleanup task stopping");
                        break;
                    }
                }
            }
        }
    })
}

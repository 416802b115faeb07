/// Identity Service Main Entry Point
///
/// Prepares the shared state the session lifecycle depends on and keeps it
/// healthy:
/// - PostgreSQL connection pool and schema migrations
/// - Redis connection manager
/// - Auth service wiring: token issuer, provider verifiers, session index
/// - Expired refresh-token cleanup (background task)
use anyhow::{Context, Result};
use identity_service::{
    config::Settings,
    providers::IdentityProvider,
    services::{spawn_token_cleanup, AuthService, TokenCleanupConfig},
};
use redis_utils::RedisPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,identity_service=debug")),
        )
        .with_target(false)
        .json()
        .init();

    info!("Starting Identity Service");

    let settings = Settings::load().context("Failed to load configuration")?;
    info!("Configuration loaded successfully");

    let db_pool = PgPoolOptions::new()
        .max_connections(settings.database.max_connections)
        .min_connections(settings.database.min_connections)
        .acquire_timeout(Duration::from_secs(settings.database.acquire_timeout_secs))
        .connect(&settings.database.url)
        .await
        .context("Failed to connect to PostgreSQL")?;

    info!(
        "Database pool initialized with {} max connections",
        settings.database.max_connections
    );

    sqlx::migrate!("./migrations")
        .run(&db_pool)
        .await
        .context("Failed to run database migrations")?;
    info!("Database migrations completed");

    let redis_pool = RedisPool::connect(&settings.redis.url)
        .await
        .context("Failed to connect to Redis")?;
    let mut redis = redis_utils::connection(&redis_pool.manager()).await;
    let _: String = redis_utils::with_timeout(
        settings.redis.op_timeout(),
        redis::cmd("PING").query_async(&mut redis),
    )
    .await
    .context("Redis did not answer PING")?;
    info!(namespace = %settings.redis.namespace, "Redis connection manager initialized");

    let auth = AuthService::from_settings(&settings, db_pool.clone(), redis_pool.manager())
        .await
        .context("Failed to initialize auth service")?;
    info!(
        algorithm = ?auth.issuer().algorithm(),
        issuer = auth.issuer().issuer(),
        "Session token issuer initialized"
    );
    for provider in [IdentityProvider::Apple, IdentityProvider::Google] {
        if auth.enabled_providers().contains(&provider) {
            info!(provider = %provider, "Identity provider enabled");
        } else {
            warn!(provider = %provider, "Identity provider not configured; sign-in disabled");
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let cleanup = spawn_token_cleanup(
        auth.session_store(),
        TokenCleanupConfig::from(&settings.maintenance),
        shutdown_rx,
    );

    shutdown_signal().await;

    let _ = shutdown_tx.send(true);
    if let Err(e) = cleanup.await {
        warn!(error = %e, "Cleanup task ended abnormally");
    }
    db_pool.close().await;

    info!("Identity service shutdown complete");

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }

    info!("Shutting down gracefully...");
}

//! Configuration management for Identity Service
//!
//! Loads settings from environment variables, with a `.env` file picked up in
//! debug builds. Every knob except `DATABASE_URL` and the signing key has a
//! default suitable for local development.
//!
//! # Example
//!
//! ```no_run
//! use identity_service::config::Settings;
//!
//! fn main() -> anyhow::Result<()> {
//!     let settings = Settings::load()?;
//!     println!("JWT issuer: {}", settings.jwt.issuer);
//!     Ok(())
//! }
//! ```

use anyhow::{bail, Context, Result};
use jwt_security::{IssuerConfig, TokenIssuer};
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Application settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub redis: RedisSettings,
    pub jwt: JwtSettings,
    pub oauth: OAuthSettings,
    pub rate_limit: RateLimitSettings,
    pub maintenance: MaintenanceSettings,
}

impl Settings {
    pub fn load() -> Result<Self> {
        if cfg!(debug_assertions) {
            dotenvy::dotenv().ok();
            info!("Loaded .env file for development");
        }

        Ok(Settings {
            database: DatabaseSettings::from_env()?,
            redis: RedisSettings::from_env()?,
            jwt: JwtSettings::from_env()?,
            oauth: OAuthSettings::from_env()?,
            rate_limit: RateLimitSettings::from_env()?,
            maintenance: MaintenanceSettings::from_env()?,
        })
    }
}

fn parse_env<T>(key: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .with_context(|| format!("Invalid {}", key))
}

/// Database connection settings
#[derive(Clone)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    /// Upper bound for a single session/user store call
    pub query_timeout_ms: u64,
}

impl DatabaseSettings {
    fn from_env() -> Result<Self> {
        Ok(Self {
            url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            max_connections: parse_env("DATABASE_MAX_CONNECTIONS", "10")?,
            min_connections: parse_env("DATABASE_MIN_CONNECTIONS", "1")?,
            acquire_timeout_secs: parse_env("DATABASE_ACQUIRE_TIMEOUT", "10")?,
            query_timeout_ms: parse_env("DATABASE_QUERY_TIMEOUT_MS", "5000")?,
        })
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

impl fmt::Debug for DatabaseSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseSettings")
            .field("url", &"<redacted>")
            .field("max_connections", &self.max_connections)
            .field("min_connections", &self.min_connections)
            .field("acquire_timeout_secs", &self.acquire_timeout_secs)
            .field("query_timeout_ms", &self.query_timeout_ms)
            .finish()
    }
}

/// Redis settings for the session index and rate limiter
#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub url: String,
    /// Prefix for every key this service writes
    pub namespace: String,
    pub op_timeout_ms: u64,
    pub scan_batch_size: usize,
    pub scan_max_iterations: u32,
    /// Upper bound for one revoke-all mirror sweep
    pub sweep_timeout_ms: u64,
}

impl RedisSettings {
    fn from_env() -> Result<Self> {
        let settings = Self {
            url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            namespace: env::var("REDIS_NAMESPACE").unwrap_or_else(|_| "nova:session".to_string()),
            op_timeout_ms: parse_env("REDIS_OP_TIMEOUT_MS", "3000")?,
            scan_batch_size: parse_env("REDIS_SCAN_BATCH_SIZE", "50")?,
            scan_max_iterations: parse_env("REDIS_SCAN_MAX_ITERATIONS", "1000")?,
            sweep_timeout_ms: parse_env("REDIS_SWEEP_TIMEOUT_MS", "10000")?,
        };

        if settings.scan_batch_size == 0 || settings.scan_max_iterations == 0 {
            bail!("REDIS_SCAN_BATCH_SIZE and REDIS_SCAN_MAX_ITERATIONS must be positive");
        }
        Ok(settings)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    pub fn sweep_timeout(&self) -> Duration {
        Duration::from_millis(self.sweep_timeout_ms)
    }
}

/// Session token signing settings
#[derive(Clone)]
pub struct JwtSettings {
    /// "HS256" or "RS256"
    pub algorithm: String,
    /// HS256 secret or RS256 private key PEM
    pub signing_key: String,
    /// RS256 public key PEM
    pub validation_key: Option<String>,
    pub issuer: String,
    pub access_ttl_secs: u64,
    pub refresh_ttl_secs: u64,
}

impl JwtSettings {
    fn from_env() -> Result<Self> {
        let issuer = env::var("JWT_ISSUER")
            .unwrap_or_else(|_| jwt_security::DEFAULT_ISSUER.to_string());
        let access_ttl_secs = parse_env(
            "JWT_ACCESS_TTL_SECS",
            &jwt_security::DEFAULT_ACCESS_TTL_SECS.to_string(),
        )?;
        let refresh_ttl_secs = parse_env(
            "JWT_REFRESH_TTL_SECS",
            &jwt_security::DEFAULT_REFRESH_TTL_SECS.to_string(),
        )?;

        // Prefer PEM-based RSA keys when available.
        if let Ok(private_pem) = env::var("JWT_PRIVATE_KEY_PEM") {
            let public_pem = env::var("JWT_PUBLIC_KEY_PEM")
                .context("JWT_PUBLIC_KEY_PEM must be set alongside JWT_PRIVATE_KEY_PEM")?;
            return Ok(Self {
                algorithm: "RS256".to_string(),
                signing_key: private_pem,
                validation_key: Some(public_pem),
                issuer,
                access_ttl_secs,
                refresh_ttl_secs,
            });
        }

        let signing_key = env::var("JWT_SECRET")
            .context("JWT_SECRET must be set when no PEM keys are configured")?;
        let algorithm = env::var("JWT_ALGORITHM").unwrap_or_else(|_| "HS256".to_string());

        Ok(Self {
            algorithm,
            signing_key,
            validation_key: None,
            issuer,
            access_ttl_secs,
            refresh_ttl_secs,
        })
    }

    pub fn issuer_config(&self) -> IssuerConfig {
        IssuerConfig {
            issuer: self.issuer.clone(),
            access_ttl: Duration::from_secs(self.access_ttl_secs),
            refresh_ttl: Duration::from_secs(self.refresh_ttl_secs),
        }
    }

    pub fn build_issuer(&self) -> Result<TokenIssuer> {
        let issuer = match self.algorithm.to_ascii_uppercase().as_str() {
            "HS256" => TokenIssuer::hs256(self.signing_key.clone(), self.issuer_config())?,
            "RS256" => {
                let public_pem = self
                    .validation_key
                    .as_deref()
                    .context("RS256 requires a public key")?;
                TokenIssuer::rs256(&self.signing_key, public_pem, self.issuer_config())?
            }
            other => bail!("Unsupported JWT_ALGORITHM: {}", other),
        };
        Ok(issuer)
    }
}

impl fmt::Debug for JwtSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtSettings")
            .field("algorithm", &self.algorithm)
            .field("signing_key", &"<redacted>")
            .field("validation_key", &self.validation_key.as_ref().map(|_| "<pem>"))
            .field("issuer", &self.issuer)
            .field("access_ttl_secs", &self.access_ttl_secs)
            .field("refresh_ttl_secs", &self.refresh_ttl_secs)
            .finish()
    }
}

/// Identity provider settings (Apple and Google)
#[derive(Debug, Clone)]
pub struct OAuthSettings {
    pub apple_client_id: Option<String>,
    pub google_client_id: Option<String>,
    pub key_fetch_timeout_secs: u64,
    pub max_key_set_bytes: usize,
    pub key_set_max_age_secs: u64,
}

impl OAuthSettings {
    fn from_env() -> Result<Self> {
        Ok(Self {
            apple_client_id: non_empty_env("APPLE_CLIENT_ID"),
            google_client_id: non_empty_env("GOOGLE_CLIENT_ID"),
            key_fetch_timeout_secs: parse_env("OAUTH_KEY_FETCH_TIMEOUT_SECS", "10")?,
            max_key_set_bytes: parse_env("OAUTH_MAX_KEY_SET_BYTES", "1048576")?,
            key_set_max_age_secs: parse_env("OAUTH_KEY_SET_MAX_AGE_SECS", "86400")?,
        })
    }

    pub fn key_fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.key_fetch_timeout_secs)
    }

    pub fn key_set_max_age(&self) -> Duration {
        Duration::from_secs(self.key_set_max_age_secs)
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Sign-in throttling
#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub sign_in_limit: u64,
    pub sign_in_window_secs: u64,
}

impl RateLimitSettings {
    fn from_env() -> Result<Self> {
        Ok(Self {
            sign_in_limit: parse_env("SIGNIN_RATE_LIMIT", "10")?,
            sign_in_window_secs: parse_env("SIGNIN_RATE_WINDOW_SECS", "60")?,
        })
    }

    pub fn sign_in_window(&self) -> Duration {
        Duration::from_secs(self.sign_in_window_secs)
    }
}

/// Background maintenance
#[derive(Debug, Clone)]
pub struct MaintenanceSettings {
    pub cleanup_interval_secs: u64,
}

impl MaintenanceSettings {
    fn from_env() -> Result<Self> {
        Ok(Self {
            cleanup_interval_secs: parse_env("TOKEN_CLEANUP_INTERVAL_SECS", "3600")?,
        })
    }
}

use std::time::Duration;

use jwt_security::TokenError;
use thiserror::Error;
use tonic::{Code, Status};
use tracing::{error, warn};

use crate::db::SessionStoreError;
use crate::providers::{AssertionError, IdentityProvider, VerificationError};
use crate::security::SessionIndexError;

pub type Result<T> = std::result::Result<T, IdentityError>;

/// Message returned to clients for every authentication failure, whatever
/// the underlying cause.
pub const AUTHENTICATION_FAILED: &str = "Authentication failed";

/// Message returned when a verified identity fails local input rules.
pub const INVALID_IDENTITY: &str = "Identity could not be accepted";

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Identity assertion rejected: {0}")]
    AssertionRejected(#[from] VerificationError),

    #[error("Identity provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Identity provider not configured: {0}")]
    ProviderNotConfigured(IdentityProvider),

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token expired")]
    TokenExpired,

    #[error("Refresh token reuse detected")]
    TokenReuseDetected,

    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Account conflict: {0}")]
    AccountConflict(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Redis error: {0}")]
    Redis(String),

    #[error("Storage timed out after {0:?}")]
    StorageTimeout(Duration),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl IdentityError {
    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IdentityError::ProviderUnavailable(_)
                | IdentityError::Database(_)
                | IdentityError::Redis(_)
                | IdentityError::StorageTimeout(_)
        )
    }

    /// Client-facing message. Never reveals which check failed.
    pub fn client_message(&self) -> String {
        match self {
            IdentityError::AssertionRejected(_)
            | IdentityError::InvalidToken
            | IdentityError::TokenExpired
            | IdentityError::TokenReuseDetected
            | IdentityError::AccountConflict(_) => AUTHENTICATION_FAILED.to_string(),
            IdentityError::ProviderUnavailable(_) => {
                "Identity provider temporarily unavailable".to_string()
            }
            IdentityError::ProviderNotConfigured(provider) => {
                format!("Sign in with {} is not available", provider)
            }
            IdentityError::RateLimited { retry_after_secs } => {
                format!("Too many attempts, retry after {}s", retry_after_secs)
            }
            IdentityError::Validation(_) => INVALID_IDENTITY.to_string(),
            IdentityError::Database(_)
            | IdentityError::Redis(_)
            | IdentityError::StorageTimeout(_)
            | IdentityError::Internal(_) => "Internal server error".to_string(),
        }
    }

    /// Convert to gRPC Status for wire protocol
    pub fn to_status(&self) -> Status {
        let code = match self {
            IdentityError::AssertionRejected(_)
            | IdentityError::InvalidToken
            | IdentityError::TokenExpired
            | IdentityError::TokenReuseDetected
            | IdentityError::AccountConflict(_) => Code::Unauthenticated,
            IdentityError::ProviderUnavailable(_) | IdentityError::StorageTimeout(_) => {
                Code::Unavailable
            }
            IdentityError::ProviderNotConfigured(_) => Code::FailedPrecondition,
            IdentityError::RateLimited { .. } => Code::ResourceExhausted,
            IdentityError::Validation(_) => Code::InvalidArgument,
            IdentityError::Database(_) | IdentityError::Redis(_) | IdentityError::Internal(_) => {
                Code::Internal
            }
        };
        Status::new(code, self.client_message())
    }
}

impl From<IdentityError> for Status {
    fn from(err: IdentityError) -> Self {
        err.to_status()
    }
}

impl From<AssertionError> for IdentityError {
    fn from(err: AssertionError) -> Self {
        match err {
            AssertionError::Rejected(reason) => IdentityError::AssertionRejected(reason),
            AssertionError::ProviderUnavailable(fetch) => {
                warn!(error = %fetch, "Identity provider key set unavailable");
                IdentityError::ProviderUnavailable(fetch.to_string())
            }
        }
    }
}

impl From<TokenError> for IdentityError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Expired => IdentityError::TokenExpired,
            TokenError::Malformed(_) | TokenError::BadSignature | TokenError::WrongKind { .. } => {
                IdentityError::InvalidToken
            }
            TokenError::InvalidKey(msg) | TokenError::Signing(msg) => {
                error!(error = %msg, "Token signing failed");
                IdentityError::Internal(msg)
            }
        }
    }
}

impl From<SessionStoreError> for IdentityError {
    fn from(err: SessionStoreError) -> Self {
        match err {
            SessionStoreError::NotFound | SessionStoreError::NotFoundOrAlreadyRevoked => {
                IdentityError::InvalidToken
            }
            SessionStoreError::Revoked | SessionStoreError::FamilyRevoked => {
                IdentityError::TokenReuseDetected
            }
            SessionStoreError::Expired | SessionStoreError::AlreadyExpired => {
                IdentityError::TokenExpired
            }
            SessionStoreError::Duplicate => {
                IdentityError::Internal("duplicate refresh token record".to_string())
            }
            SessionStoreError::Storage(msg) => {
                error!(error = %msg, "Session store failure");
                IdentityError::Database(msg)
            }
            SessionStoreError::Timeout(limit) => IdentityError::StorageTimeout(limit),
        }
    }
}

impl From<SessionIndexError> for IdentityError {
    fn from(err: SessionIndexError) -> Self {
        match err {
            SessionIndexError::TokenNearExpiry { .. } => IdentityError::TokenExpired,
            other => IdentityError::Redis(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for IdentityError {
    fn from(err: sqlx::Error) -> Self {
        IdentityError::Database(err.to_string())
    }
}

impl From<redis::RedisError> for IdentityError {
    fn from(err: redis::RedisError) -> Self {
        IdentityError::Redis(err.to_string())
    }
}

impl From<anyhow::Error> for IdentityError {
    fn from(err: anyhow::Error) -> Self {
        IdentityError::Internal(format!("{:#}", err))
    }
}

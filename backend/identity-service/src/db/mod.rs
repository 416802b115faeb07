//! Durable storage: accounts and refresh-token records in PostgreSQL
//!
//! The [`SessionStore`] is the source of truth for whether a refresh token
//! may still be used. Redis only mirrors it (see `security::session_index`).

pub mod refresh_tokens;
pub mod users;

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::error::{IdentityError, Result};
use crate::models::{NewRefreshRecord, ProviderIdentity, RefreshRecord, RevokedToken, User};

pub use refresh_tokens::PgSessionStore;
pub use users::PgUserStore;

pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionStoreError {
    #[error("refresh token is already expired")]
    AlreadyExpired,

    #[error("refresh token record already exists")]
    Duplicate,

    #[error("refresh token not found")]
    NotFound,

    #[error("refresh token has been revoked")]
    Revoked,

    #[error("refresh token has expired")]
    Expired,

    /// The token's rotation family was revoked after reuse; it accepts no new tokens.
    #[error("refresh token family has been revoked")]
    FamilyRevoked,

    #[error("refresh token not found or already revoked")]
    NotFoundOrAlreadyRevoked,

    #[error("session storage error: {0}")]
    Storage(String),

    #[error("session storage timed out after {0:?}")]
    Timeout(Duration),
}

/// Durable refresh-token records keyed by the token's SHA-256 digest.
///
/// Implementations hash the raw token themselves; raw tokens never reach
/// storage.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist a newly issued refresh token. Fails with `AlreadyExpired` when
    /// `expires_at` is not in the future and with `FamilyRevoked` once
    /// `revoke_family` has run for its family.
    async fn store_refresh(&self, record: NewRefreshRecord) -> std::result::Result<(), SessionStoreError>;

    /// Look up a presented refresh token and stamp `last_used_at`.
    async fn validate_refresh(&self, token: &str) -> std::result::Result<RefreshRecord, SessionStoreError>;

    /// Revoke a single token. Exactly one of any number of concurrent callers
    /// succeeds; the rest get `NotFoundOrAlreadyRevoked`.
    async fn revoke_refresh(&self, token: &str) -> std::result::Result<(), SessionStoreError>;

    async fn revoke_all(&self, user_id: Uuid) -> std::result::Result<Vec<RevokedToken>, SessionStoreError>;

    /// Revoke every token in a family and close it to new tokens. A
    /// concurrent `store_refresh` into the family is either refused or
    /// included in the returned list.
    async fn revoke_family(
        &self,
        family_id: Uuid,
    ) -> std::result::Result<Vec<RevokedToken>, SessionStoreError>;

    /// Delete records past their expiry. Returns the number removed.
    async fn cleanup_expired(&self) -> std::result::Result<u64, SessionStoreError>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Find or create the account for a verified provider identity, linking
    /// the provider subject to an existing account with the same email.
    async fn upsert_identity(&self, identity: &ProviderIdentity) -> Result<User>;

    async fn find_by_id(&self, user_id: Uuid) -> Result<Option<User>>;
}

/// A query that failed or ran past its deadline
#[derive(Debug)]
pub(crate) enum QueryFailure {
    Timeout(Duration),
    Sqlx(sqlx::Error),
}

impl QueryFailure {
    pub(crate) fn is_unique_violation(&self) -> bool {
        matches!(self, QueryFailure::Sqlx(sqlx::Error::Database(db)) if db.is_unique_violation())
    }
}

/// Run a query under `limit`.
pub(crate) async fn bounded<T, F>(limit: Duration, query: F) -> std::result::Result<T, QueryFailure>
where
    F: Future<Output = std::result::Result<T, sqlx::Error>>,
{
    match tokio::time::timeout(limit, query).await {
        Ok(result) => result.map_err(QueryFailure::Sqlx),
        Err(_) => Err(QueryFailure::Timeout(limit)),
    }
}

impl From<QueryFailure> for SessionStoreError {
    fn from(failure: QueryFailure) -> Self {
        match failure {
            QueryFailure::Timeout(limit) => SessionStoreError::Timeout(limit),
            QueryFailure::Sqlx(e) => SessionStoreError::Storage(e.to_string()),
        }
    }
}

impl From<QueryFailure> for IdentityError {
    fn from(failure: QueryFailure) -> Self {
        match failure {
            QueryFailure::Timeout(limit) => IdentityError::StorageTimeout(limit),
            QueryFailure::Sqlx(e) => IdentityError::Database(e.to_string()),
        }
    }
}

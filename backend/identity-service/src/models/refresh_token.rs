use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

/// Durable record of an issued refresh token. Only the SHA-256 digest of
/// the token is stored.
#[derive(Debug, Clone, FromRow)]
pub struct RefreshRecord {
    pub token_hash: String,
    pub token_id: String,
    pub family_id: Uuid,
    pub user_id: Uuid,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl RefreshRecord {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone)]
pub struct NewRefreshRecord {
    pub token_hash: String,
    pub token_id: String,
    pub family_id: Uuid,
    pub user_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// Identifies a record revoked in bulk, so callers can blacklist its id
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct RevokedToken {
    pub token_id: String,
    pub user_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// Refresh-token records (PostgreSQL)
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{bounded, SessionStore, SessionStoreError, DEFAULT_QUERY_TIMEOUT};
use crate::models::{NewRefreshRecord, RefreshRecord, RevokedToken};
use crate::security::hash_token;

type StoreResult<T> = std::result::Result<T, SessionStoreError>;

#[derive(Clone)]
pub struct PgSessionStore {
    pool: PgPool,
    query_timeout: Duration,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    pub fn with_query_timeout(mut self, query_timeout: Duration) -> Self {
        self.query_timeout = query_timeout;
        self
    }

    async fn find_by_hash(&self, token_hash: &str) -> StoreResult<Option<RefreshRecord>> {
        let record = bounded(
            self.query_timeout,
            sqlx::query_as::<_, RefreshRecord>(
                r#"
                SELECT token_hash, token_id, family_id, user_id, expires_at,
                       created_at, revoked_at, last_used_at
                FROM refresh_tokens
                WHERE token_hash = $1
                "#,
            )
            .bind(token_hash)
            .fetch_optional(&self.pool),
        )
        .await?;

        Ok(record)
    }

    /// Insert `record` unless its family is revoked. Returns `false` when
    /// refused. The family row is held `FOR SHARE` until commit, so a
    /// concurrent `revoke_family` either refuses this insert or revokes it.
    async fn insert_in_live_family(&self, record: &NewRefreshRecord) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO token_families (family_id, user_id)
            VALUES ($1, $2)
            ON CONFLICT (family_id) DO NOTHING
            "#,
        )
        .bind(record.family_id)
        .bind(record.user_id)
        .execute(&mut *tx)
        .await?;

        let family_revoked_at = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            "SELECT revoked_at FROM token_families WHERE family_id = $1 FOR SHARE",
        )
        .bind(record.family_id)
        .fetch_one(&mut *tx)
        .await?;

        if family_revoked_at.is_some() {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO refresh_tokens (token_hash, token_id, family_id, user_id, expires_at, created_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            "#,
        )
        .bind(&record.token_hash)
        .bind(&record.token_id)
        .bind(record.family_id)
        .bind(record.user_id)
        .bind(record.expires_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn revoke_family_tx(&self, family_id: Uuid) -> Result<Vec<RevokedToken>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        // Waits for in-flight inserts holding the family row
        sqlx::query(
            "UPDATE token_families SET revoked_at = COALESCE(revoked_at, NOW()) WHERE family_id = $1",
        )
        .bind(family_id)
        .execute(&mut *tx)
        .await?;

        let revoked = sqlx::query_as::<_, RevokedToken>(
            r#"
            UPDATE refresh_tokens
            SET revoked_at = NOW()
            WHERE family_id = $1 AND revoked_at IS NULL
            RETURNING token_id, user_id, expires_at
            "#,
        )
        .bind(family_id)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(revoked)
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn store_refresh(&self, record: NewRefreshRecord) -> StoreResult<()> {
        if record.expires_at <= Utc::now() {
            return Err(SessionStoreError::AlreadyExpired);
        }

        let inserted = bounded(self.query_timeout, self.insert_in_live_family(&record)).await;

        match inserted {
            Ok(true) => {
                debug!(
                    user_id = %record.user_id,
                    family_id = %record.family_id,
                    token_id = %record.token_id,
                    "Stored refresh token record"
                );
                Ok(())
            }
            Ok(false) => {
                warn!(
                    user_id = %record.user_id,
                    family_id = %record.family_id,
                    "Refused refresh token for a revoked family"
                );
                Err(SessionStoreError::FamilyRevoked)
            }
            Err(failure) if failure.is_unique_violation() => Err(SessionStoreError::Duplicate),
            Err(failure) => Err(failure.into()),
        }
    }

    async fn validate_refresh(&self, token: &str) -> StoreResult<RefreshRecord> {
        let token_hash = hash_token(token);

        let usable = bounded(
            self.query_timeout,
            sqlx::query_as::<_, RefreshRecord>(
                r#"
                UPDATE refresh_tokens
                SET last_used_at = NOW()
                WHERE token_hash = $1
                  AND revoked_at IS NULL
                  AND expires_at > NOW()
                RETURNING token_hash, token_id, family_id, user_id, expires_at,
                          created_at, revoked_at, last_used_at
                "#,
            )
            .bind(&token_hash)
            .fetch_optional(&self.pool),
        )
        .await?;

        if let Some(record) = usable {
            return Ok(record);
        }

        // A revoked record reports Revoked even once it has also expired.
        match self.find_by_hash(&token_hash).await? {
            None => Err(SessionStoreError::NotFound),
            Some(record) if record.is_revoked() => Err(SessionStoreError::Revoked),
            Some(_) => Err(SessionStoreError::Expired),
        }
    }

    async fn revoke_refresh(&self, token: &str) -> StoreResult<()> {
        let token_hash = hash_token(token);

        let result = bounded(
            self.query_timeout,
            sqlx::query(
                r#"
                UPDATE refresh_tokens
                SET revoked_at = NOW()
                WHERE token_hash = $1 AND revoked_at IS NULL
                "#,
            )
            .bind(&token_hash)
            .execute(&self.pool),
        )
        .await?;

        if result.rows_affected() == 0 {
            return Err(SessionStoreError::NotFoundOrAlreadyRevoked);
        }

        Ok(())
    }

    async fn revoke_all(&self, user_id: Uuid) -> StoreResult<Vec<RevokedToken>> {
        let revoked = bounded(
            self.query_timeout,
            sqlx::query_as::<_, RevokedToken>(
                r#"
                UPDATE refresh_tokens
                SET revoked_at = NOW()
                WHERE user_id = $1 AND revoked_at IS NULL
                RETURNING token_id, user_id, expires_at
                "#,
            )
            .bind(user_id)
            .fetch_all(&self.pool),
        )
        .await?;

        info!(user_id = %user_id, revoked = revoked.len(), "Revoked all refresh tokens for user");
        Ok(revoked)
    }

    async fn revoke_family(&self, family_id: Uuid) -> StoreResult<Vec<RevokedToken>> {
        let revoked = bounded(self.query_timeout, self.revoke_family_tx(family_id)).await?;

        info!(family_id = %family_id, revoked = revoked.len(), "Revoked refresh token family");
        Ok(revoked)
    }

    async fn cleanup_expired(&self) -> StoreResult<u64> {
        let result = bounded(
            self.query_timeout,
            sqlx::query("DELETE FROM refresh_tokens WHERE expires_at < NOW()").execute(&self.pool),
        )
        .await?;

        // Families with no records left can no longer be extended
        let families = bounded(
            self.query_timeout,
            sqlx::query(
                r#"
                DELETE FROM token_families f
                WHERE NOT EXISTS (SELECT 1 FROM refresh_tokens t WHERE t.family_id = f.family_id)
                  AND f.created_at < NOW() - INTERVAL '1 hour'
                "#,
            )
            .execute(&self.pool),
        )
        .await?;
        debug!(families = families.rows_affected(), "Removed empty token families");

        Ok(result.rows_affected())
    }
}

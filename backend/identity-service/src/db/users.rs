/// Account lookup and provider linking (PostgreSQL)
use async_trait::async_trait;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use super::{bounded, UserStore, DEFAULT_QUERY_TIMEOUT};
use crate::error::{IdentityError, Result};
use crate::models::{ProviderIdentity, User};
use crate::providers::IdentityProvider;

#[derive(Clone)]
pub struct PgUserStore {
    pool: PgPool,
    query_timeout: Duration,
}

// Column holding the provider subject. Never derived from input.
fn subject_column(provider: IdentityProvider) -> &'static str {
    match provider {
        IdentityProvider::Apple => "apple_id",
        IdentityProvider::Google => "google_id",
    }
}

impl PgUserStore {
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

    /// Returning user: touch and return the account already linked to this subject.
    async fn touch_linked(&self, identity: &ProviderIdentity) -> Result<Option<User>> {
        let sql = format!(
            r#"
            UPDATE users
            SET updated_at = NOW()
            WHERE {} = $1
            RETURNING id, email, apple_id, google_id, created_at, updated_at
            "#,
            subject_column(identity.provider)
        );

        let user = bounded(
            self.query_timeout,
            sqlx::query_as::<_, User>(&sql)
                .bind(&identity.subject)
                .fetch_optional(&self.pool),
        )
        .await?;

        Ok(user)
    }

    /// Create the account, or link the subject to the account owning the email.
    /// An already linked subject on that account is left untouched.
    async fn upsert_by_email(&self, identity: &ProviderIdentity) -> Result<User> {
        let (apple_id, google_id) = match identity.provider {
            IdentityProvider::Apple => (Some(identity.subject.as_str()), None),
            IdentityProvider::Google => (None, Some(identity.subject.as_str())),
        };

        let result = bounded(
            self.query_timeout,
            sqlx::query_as::<_, User>(
                r#"
                INSERT INTO users (id, email, apple_id, google_id, created_at, updated_at)
                VALUES ($1, $2, $3, $4, NOW(), NOW())
                ON CONFLICT (email) DO UPDATE SET
                    apple_id = COALESCE(users.apple_id, EXCLUDED.apple_id),
                    google_id = COALESCE(users.google_id, EXCLUDED.google_id),
                    updated_at = NOW()
                RETURNING id, email, apple_id, google_id, created_at, updated_at
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(&identity.email)
            .bind(apple_id)
            .bind(google_id)
            .fetch_one(&self.pool),
        )
        .await;

        match result {
            Ok(user) => Ok(user),
            // Another request linked this subject first, under a different email
            Err(failure) if failure.is_unique_violation() => self
                .touch_linked(identity)
                .await?
                .ok_or_else(|| IdentityError::Database("account vanished during linking".into())),
            Err(failure) => Err(failure.into()),
        }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn upsert_identity(&self, identity: &ProviderIdentity) -> Result<User> {
        if let Some(user) = self.touch_linked(identity).await? {
            return Ok(user);
        }

        let user = self.upsert_by_email(identity).await?;

        match user.provider_subject(identity.provider) {
            Some(subject) if subject == identity.subject => {
                info!(
                    user_id = %user.id,
                    provider = %identity.provider,
                    "Linked provider identity to account"
                );
                Ok(user)
            }
            _ => {
                warn!(
                    user_id = %user.id,
                    provider = %identity.provider,
                    "Email already linked to a different provider subject"
                );
                Err(IdentityError::AccountConflict(format!(
                    "email is linked to another {} account",
                    identity.provider
                )))
            }
        }
    }

    async fn find_by_id(&self, user_id: Uuid) -> Result<Option<User>> {
        let user = bounded(
            self.query_timeout,
            sqlx::query_as::<_, User>(
                r#"
                SELECT id, email, apple_id, google_id, created_at, updated_at
                FROM users
                WHERE id = $1
                "#,
            )
            .bind(user_id)
            .fetch_optional(&self.pool),
        )
        .await?;

        Ok(user)
    }
}

//! Session lifecycle orchestration
//!
//! ## Refresh rotation
//!
//! Every refresh revokes the presented token in the durable store before a
//! new pair is minted, so there is no moment where both tokens validate.
//! Presenting a token that was already rotated is treated as theft: the
//! whole rotation family is revoked and blacklisted.
//!
//! The Redis index is written on a best-effort basis. Failures there are
//! logged and never fail the request.

use anyhow::Context;
use chrono::{DateTime, Utc};
use jwt_security::{IssuedPair, SessionClaims, TokenIssuer, TokenSubject};
use redis_utils::{RateLimiter, SharedConnectionManager, SweepControl};
use sqlx::PgPool;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::config::Settings;
use crate::db::{PgSessionStore, PgUserStore, SessionStore, SessionStoreError, UserStore};
use crate::error::{IdentityError, Result};
use crate::models::{NewRefreshRecord, ProviderIdentity, RevokedToken};
use crate::providers::{HttpKeySetFetcher, IdentityProvider, IdentityVerifiers};
use crate::security::{hash_token, EphemeralSessionIndex, SessionIndex, SignInThrottle};

/// Upper bound on the mirror sweep run by `revoke_all_sessions`.
pub const DEFAULT_SWEEP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct SignInRequest {
    pub provider: IdentityProvider,
    pub id_token: String,
    pub nonce: Option<String>,
    /// Caller identity for throttling, usually the client IP.
    pub client_key: Option<String>,
}

/// Token pair handed back to the client
#[derive(Clone)]
pub struct SessionTokens {
    pub user_id: Uuid,
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
}

impl fmt::Debug for SessionTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionTokens")
            .field("user_id", &self.user_id)
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("access_expires_at", &self.access_expires_at)
            .field("refresh_expires_at", &self.refresh_expires_at)
            .finish()
    }
}

impl SessionTokens {
    fn new(user_id: Uuid, pair: IssuedPair) -> Self {
        Self {
            user_id,
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
            access_expires_at: pair.access_expires_at,
            refresh_expires_at: pair.refresh_expires_at,
        }
    }
}

#[derive(Clone)]
pub struct AuthService {
    verifiers: Arc<IdentityVerifiers>,
    issuer: Arc<TokenIssuer>,
    users: Arc<dyn UserStore>,
    sessions: Arc<dyn SessionStore>,
    index: Arc<dyn SessionIndex>,
    throttle: Option<SignInThrottle>,
    sweep_timeout: Duration,
}

impl AuthService {
    pub fn new(
        verifiers: Arc<IdentityVerifiers>,
        issuer: Arc<TokenIssuer>,
        users: Arc<dyn UserStore>,
        sessions: Arc<dyn SessionStore>,
        index: Arc<dyn SessionIndex>,
    ) -> Self {
        Self {
            verifiers,
            issuer,
            users,
            sessions,
            index,
            throttle: None,
            sweep_timeout: DEFAULT_SWEEP_TIMEOUT,
        }
    }

    /// Wire the production backends: PostgreSQL stores, the Redis session
    /// index and sign-in throttle, and HTTPS key-set fetching.
    pub async fn from_settings(
        settings: &Settings,
        db_pool: PgPool,
        redis: SharedConnectionManager,
    ) -> anyhow::Result<Self> {
        let issuer = settings
            .jwt
            .build_issuer()
            .context("Failed to initialize session token issuer")?;

        let fetcher = HttpKeySetFetcher::new(
            reqwest::Client::new(),
            settings.oauth.key_fetch_timeout(),
            settings.oauth.max_key_set_bytes,
        );
        let verifiers = IdentityVerifiers::from_settings(&settings.oauth, Arc::new(fetcher));

        let query_timeout = settings.database.query_timeout();
        let users = PgUserStore::new(db_pool.clone()).with_query_timeout(query_timeout);
        let sessions = PgSessionStore::new(db_pool).with_query_timeout(query_timeout);

        let index = EphemeralSessionIndex::from_settings(
            redis_utils::connection(&redis).await,
            &settings.redis,
        );
        let limiter = RateLimiter::new(redis, &settings.redis.namespace)
            .with_op_timeout(settings.redis.op_timeout());

        Ok(Self::new(
            Arc::new(verifiers),
            Arc::new(issuer),
            Arc::new(users),
            Arc::new(sessions),
            Arc::new(index),
        )
        .with_throttle(SignInThrottle::from_settings(
            Arc::new(limiter),
            &settings.rate_limit,
        ))
        .with_sweep_timeout(settings.redis.sweep_timeout()))
    }

    pub fn with_throttle(mut self, throttle: SignInThrottle) -> Self {
        self.throttle = Some(throttle);
        self
    }

    pub fn with_sweep_timeout(mut self, sweep_timeout: Duration) -> Self {
        self.sweep_timeout = sweep_timeout;
        self
    }

    pub fn enabled_providers(&self) -> Vec<IdentityProvider> {
        self.verifiers.enabled()
    }

    pub fn issuer(&self) -> &TokenIssuer {
        &self.issuer
    }

    pub fn session_store(&self) -> Arc<dyn SessionStore> {
        self.sessions.clone()
    }

    /// Exchange a provider ID token for a fresh session.
    pub async fn sign_in(&self, request: SignInRequest) -> Result<SessionTokens> {
        if let (Some(throttle), Some(client_key)) = (&self.throttle, request.client_key.as_deref()) {
            throttle.check(client_key).await?;
        }

        let verifier = self
            .verifiers
            .get(request.provider)
            .ok_or(IdentityError::ProviderNotConfigured(request.provider))?;

        let nonce = request.nonce.as_deref().filter(|n| !n.is_empty());
        let claims = verifier.verify(&request.id_token, nonce).await?;

        let identity = ProviderIdentity::from(&claims);
        identity
            .validate()
            .map_err(|e| {
                warn!(provider = %request.provider, error = %e, "Verified identity failed validation");
                IdentityError::Validation(e.to_string())
            })?;

        let user = self.users.upsert_identity(&identity).await?;

        let pair = self.issuer.issue_pair(&TokenSubject {
            user_id: user.id,
            provider_subject: identity.subject.clone(),
            email: user.email.clone(),
        })?;
        self.persist(user.id, &pair).await?;

        info!(
            user_id = %user.id,
            provider = %request.provider,
            family_id = %pair.family_id,
            "User signed in"
        );
        Ok(SessionTokens::new(user.id, pair))
    }

    /// Rotate a refresh token. The presented token is revoked before any
    /// result is returned, successful or not.
    pub async fn refresh_session(&self, refresh_token: &str) -> Result<SessionTokens> {
        let claims = self.issuer.validate_refresh(refresh_token)?;

        match self.index.is_blacklisted(&claims.jti).await {
            Ok(true) => return Err(self.contain_reuse(&claims).await),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "Blacklist check failed; relying on durable store"),
        }

        let record = match self.sessions.validate_refresh(refresh_token).await {
            Ok(record) => record,
            Err(SessionStoreError::Revoked) => return Err(self.contain_reuse(&claims).await),
            Err(e) => return Err(e.into()),
        };

        if record.user_id != claims.user_id || Some(record.family_id) != claims.family_id {
            warn!(
                user_id = %claims.user_id,
                token_id = %claims.jti,
                "Refresh token claims do not match the stored record"
            );
            return Err(IdentityError::InvalidToken);
        }

        match self.sessions.revoke_refresh(refresh_token).await {
            Ok(()) => {}
            // A concurrent refresh of the same token won the revoke
            Err(SessionStoreError::NotFoundOrAlreadyRevoked) => {
                return Err(self.contain_reuse(&claims).await)
            }
            Err(e) => return Err(e.into()),
        }

        self.forget(&RevokedToken {
            token_id: claims.jti.clone(),
            user_id: claims.user_id,
            expires_at: claims.expires_at(),
        })
        .await;

        let pair = self.issuer.rotate_pair(&claims)?;
        // A replay that revoked the family in the meantime makes this fail
        // with TokenReuseDetected.
        self.persist(claims.user_id, &pair).await?;

        debug!(
            user_id = %claims.user_id,
            family_id = %pair.family_id,
            "Refresh token rotated"
        );
        Ok(SessionTokens::new(claims.user_id, pair))
    }

    /// End the session behind `refresh_token`. Signing out twice is not an error.
    pub async fn sign_out(&self, refresh_token: &str) -> Result<()> {
        let claims = self.issuer.validate_refresh(refresh_token)?;

        match self.sessions.revoke_refresh(refresh_token).await {
            Ok(()) => info!(user_id = %claims.user_id, token_id = %claims.jti, "User signed out"),
            Err(SessionStoreError::NotFoundOrAlreadyRevoked) => {
                debug!(token_id = %claims.jti, "Sign-out for an already revoked token")
            }
            Err(e) => return Err(e.into()),
        }

        self.forget(&RevokedToken {
            token_id: claims.jti.clone(),
            user_id: claims.user_id,
            expires_at: claims.expires_at(),
        })
        .await;
        Ok(())
    }

    /// Revoke every refresh token of `user_id`. Returns the number of
    /// durable records revoked.
    pub async fn revoke_all_sessions(&self, user_id: Uuid) -> Result<u64> {
        let revoked = self.sessions.revoke_all(user_id).await?;

        for token in &revoked {
            if let Err(e) = self.index.blacklist(&token.token_id, token.expires_at).await {
                warn!(user_id = %user_id, token_id = %token.token_id, error = %e, "Failed to blacklist revoked token");
            }
        }

        let control = SweepControl::new().with_timeout(self.sweep_timeout);
        match self.index.delete_all_for_user(user_id, &control).await {
            Ok(report) => debug!(user_id = %user_id, deleted = report.deleted, "Session mirrors cleared"),
            // Leftover mirrors expire on their own and are no longer authoritative
            Err(e) => warn!(user_id = %user_id, error = %e, "Session mirror sweep incomplete"),
        }

        info!(user_id = %user_id, revoked = revoked.len(), "Revoked all sessions");
        Ok(revoked.len() as u64)
    }

    /// Store the new refresh token durably, then mirror it.
    async fn persist(&self, user_id: Uuid, pair: &IssuedPair) -> Result<()> {
        let token_hash = hash_token(&pair.refresh_token);

        self.sessions
            .store_refresh(NewRefreshRecord {
                token_hash: token_hash.clone(),
                token_id: pair.refresh_id.clone(),
                family_id: pair.family_id,
                user_id,
                expires_at: pair.refresh_expires_at,
            })
            .await?;

        if let Err(e) = self
            .index
            .store_refresh_mirror(user_id, &pair.refresh_id, &token_hash, pair.refresh_expires_at)
            .await
        {
            warn!(user_id = %user_id, token_id = %pair.refresh_id, error = %e, "Failed to mirror refresh token");
        }
        Ok(())
    }

    /// Blacklist a revoked token and drop its mirror. Best-effort.
    async fn forget(&self, token: &RevokedToken) {
        if let Err(e) = self.index.blacklist(&token.token_id, token.expires_at).await {
            warn!(token_id = %token.token_id, error = %e, "Failed to blacklist revoked token");
        }
        if let Err(e) = self
            .index
            .remove_refresh_mirror(token.user_id, &token.token_id)
            .await
        {
            warn!(token_id = %token.token_id, error = %e, "Failed to remove refresh token mirror");
        }
    }

    /// Revoke the family of a replayed token and return the error to surface.
    async fn contain_reuse(&self, claims: &SessionClaims) -> IdentityError {
        warn!(
            user_id = %claims.user_id,
            token_id = %claims.jti,
            family_id = ?claims.family_id,
            "Refresh token reuse detected; revoking token family"
        );

        let Some(family_id) = claims.family_id else {
            return IdentityError::TokenReuseDetected;
        };

        match self.sessions.revoke_family(family_id).await {
            Ok(revoked) => {
                for token in &revoked {
                    self.forget(token).await;
                }
                info!(
                    user_id = %claims.user_id,
                    family_id = %family_id,
                    revoked = revoked.len(),
                    "Token family revoked after reuse"
                );
            }
            Err(e) => {
                error!(family_id = %family_id, error = %e, "Failed to revoke token family after reuse")
            }
        }

        IdentityError::TokenReuseDetected
    }
}

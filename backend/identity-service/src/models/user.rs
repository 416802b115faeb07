use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

use crate::providers::{IdentityClaims, IdentityProvider};

/// Local account, linked to at most one subject per identity provider
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub apple_id: Option<String>,
    pub google_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Subject this account is linked to for `provider`, if any
    pub fn provider_subject(&self, provider: IdentityProvider) -> Option<&str> {
        match provider {
            IdentityProvider::Apple => self.apple_id.as_deref(),
            IdentityProvider::Google => self.google_id.as_deref(),
        }
    }
}

/// Verified provider identity to resolve into a local account
#[derive(Debug, Clone, PartialEq, Eq, Validate)]
pub struct ProviderIdentity {
    pub provider: IdentityProvider,
    #[validate(custom(function = "crate::validators::validate_provider_subject_validator"))]
    pub subject: String,
    #[validate(custom(function = "crate::validators::validate_email_validator"))]
    pub email: String,
}

impl From<&IdentityClaims> for ProviderIdentity {
    fn from(claims: &IdentityClaims) -> Self {
        Self {
            provider: claims.provider,
            subject: claims.subject.clone(),
            // Providers may vary the casing between sign-ins
            email: claims.email.trim().to_lowercase(),
        }
    }
}

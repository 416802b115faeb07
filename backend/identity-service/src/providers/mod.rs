//! Third-party identity assertion verification
//!
//! Mobile clients sign in with an ID token minted by Apple or Google. The
//! [`IdentityVerifier`] checks that token against the provider's published
//! keys and returns the [`IdentityClaims`] we are willing to trust.

pub mod apple;
pub mod google;
pub mod jwks;
mod verifier;

use chrono::{DateTime, Utc};
use jsonwebtoken::Algorithm;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::OAuthSettings;

pub use jwks::{HttpKeySetFetcher, Jwk, KeyFetchError, KeySetCache, KeySetFetcher, ProviderKey};
pub use verifier::IdentityVerifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentityProvider {
    Apple,
    Google,
}

impl IdentityProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityProvider::Apple => "apple",
            IdentityProvider::Google => "google",
        }
    }

    pub fn profile(&self) -> &'static ProviderProfile {
        match self {
            IdentityProvider::Apple => &apple::PROFILE,
            IdentityProvider::Google => &google::PROFILE,
        }
    }
}

impl fmt::Display for IdentityProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdentityProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "apple" => Ok(IdentityProvider::Apple),
            "google" => Ok(IdentityProvider::Google),
            other => Err(format!("unsupported identity provider: {}", other)),
        }
    }
}

/// Fixed facts about a provider's ID tokens
#[derive(Debug)]
pub struct ProviderProfile {
    pub provider: IdentityProvider,
    pub issuers: &'static [&'static str],
    pub keys_url: &'static str,
    /// The only algorithm the provider signs ID tokens with
    pub algorithm: Algorithm,
    /// Interprets the provider's `email_verified` claim
    pub email_verified: fn(&serde_json::Value) -> bool,
}

/// Identity attested by a verified assertion. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityClaims {
    pub provider: IdentityProvider,
    pub subject: String,
    pub email: String,
    pub email_verified: bool,
    pub issuer: String,
    pub audience: String,
    pub expires_at: DateTime<Utc>,
    pub nonce: Option<String>,
}

/// Why an assertion was rejected. Terminal; callers must not retry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationError {
    #[error("malformed identity token: {0}")]
    MalformedToken(String),

    #[error("no provider key for kid {0}")]
    UnknownSigningKey(String),

    #[error("identity token signature is invalid")]
    SignatureInvalid,

    #[error("identity token has expired")]
    Expired,

    #[error("identity token issuer mismatch")]
    IssuerMismatch,

    #[error("identity token audience mismatch")]
    AudienceMismatch,

    #[error("identity token nonce mismatch")]
    NonceMismatch,

    #[error("identity provider has not verified the email")]
    EmailUnverified,
}

#[derive(Debug, thiserror::Error)]
pub enum AssertionError {
    #[error(transparent)]
    Rejected(#[from] VerificationError),

    /// Key set could not be fetched; the whole sign-in may be retried.
    #[error("identity provider unavailable: {0}")]
    ProviderUnavailable(#[from] KeyFetchError),
}

/// Configured verifiers, one per enabled provider
#[derive(Default)]
pub struct IdentityVerifiers {
    verifiers: HashMap<IdentityProvider, IdentityVerifier>,
}

impl IdentityVerifiers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, verifier: IdentityVerifier) -> Self {
        self.verifiers.insert(verifier.provider(), verifier);
        self
    }

    /// Enable every provider that has a client id configured.
    pub fn from_settings(settings: &OAuthSettings, fetcher: Arc<dyn KeySetFetcher>) -> Self {
        let configured = [
            (IdentityProvider::Apple, &settings.apple_client_id),
            (IdentityProvider::Google, &settings.google_client_id),
        ];

        configured
            .into_iter()
            .filter_map(|(provider, client_id)| client_id.as_ref().map(|id| (provider, id)))
            .fold(Self::new(), |verifiers, (provider, client_id)| {
                let profile = provider.profile();
                let keys = KeySetCache::new(fetcher.clone(), profile.keys_url, profile.algorithm)
                    .with_max_age(settings.key_set_max_age());
                verifiers.with(IdentityVerifier::new(provider, client_id.clone(), keys))
            })
    }

    pub fn get(&self, provider: IdentityProvider) -> Option<&IdentityVerifier> {
        self.verifiers.get(&provider)
    }

    pub fn is_enabled(&self, provider: IdentityProvider) -> bool {
        self.verifiers.contains_key(&provider)
    }

    pub fn enabled(&self) -> Vec<IdentityProvider> {
        let mut providers: Vec<_> = self.verifiers.keys().copied().collect();
        providers.sort_by_key(|p| p.as_str());
        providers
    }
}

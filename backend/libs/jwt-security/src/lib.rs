//! Self-issued session tokens for the identity service
//!
//! **Token model**:
//! - Access tokens: short-lived, stateless, valid by signature and expiry alone
//! - Refresh tokens: long-lived, tracked durably, rotated on every use
//! - Every token carries a `token_kind` discriminant so one kind is never accepted as the other
//! - Every token carries a unique `jti`; refresh tokens also carry the rotation `family_id`
//!
//! The signing algorithm is pinned at construction (HS256 secret or RS256 PEM pair)
//! and validation accepts that algorithm only. Minting performs no I/O.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};
use uuid::Uuid;
use zeroize::Zeroize;

pub mod secret_validation;
pub mod token_blacklist;

pub use secret_validation::{validate_secret_strength, SecretIssue, SecretReport, SecretStrength};
pub use token_blacklist::TokenBlacklist;

const DEFAULT_VALIDATION_LEEWAY: u64 = 30; // 30 seconds clock skew tolerance
const MAX_IAT_FUTURE_SKEW_SECS: i64 = 300; // 5 minutes max future iat
const MIN_RSA_PEM_LENGTH: usize = 256;

pub const DEFAULT_ISSUER: &str = "nova-identity";
pub const DEFAULT_ACCESS_TTL_SECS: u64 = 60 * 60;
pub const DEFAULT_REFRESH_TTL_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("token signature is invalid")]
    BadSignature,

    #[error("token has expired")]
    Expired,

    #[error("expected {expected} token, got {actual}")]
    WrongKind { expected: TokenKind, actual: TokenKind },

    #[error("invalid signing key: {0}")]
    InvalidKey(String),

    #[error("failed to sign token: {0}")]
    Signing(String),
}

impl From<jsonwebtoken::errors::Error> for TokenError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => TokenError::BadSignature,
            ErrorKind::ExpiredSignature => TokenError::Expired,
            ErrorKind::InvalidIssuer => TokenError::Malformed("unexpected issuer".to_string()),
            ErrorKind::ImmatureSignature => TokenError::Malformed("token not yet valid".to_string()),
            _ => TokenError::Malformed(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Access => "access",
            TokenKind::Refresh => "refresh",
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a self-issued token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    pub user_id: Uuid,
    /// Subject assigned by the identity provider that authenticated the user
    pub provider_subject: String,
    pub email: String,
    pub token_kind: TokenKind,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    pub nbf: i64,
    pub iss: String,
    /// JWT ID, unique per token
    pub jti: String,
    /// Rotation chain this refresh token belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_id: Option<Uuid>,
}

impl SessionClaims {
    pub fn expires_at(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(self.exp, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// Identity a token pair is minted for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSubject {
    pub user_id: Uuid,
    pub provider_subject: String,
    pub email: String,
}

impl From<&SessionClaims> for TokenSubject {
    fn from(claims: &SessionClaims) -> Self {
        Self {
            user_id: claims.user_id,
            provider_subject: claims.provider_subject.clone(),
            email: claims.email.clone(),
        }
    }
}

/// Freshly minted access/refresh pair
#[derive(Clone)]
pub struct IssuedPair {
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
    pub access_id: String,
    pub refresh_id: String,
    pub family_id: Uuid,
}

impl fmt::Debug for IssuedPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("access_expires_at", &self.access_expires_at)
            .field("refresh_expires_at", &self.refresh_expires_at)
            .field("access_id", &self.access_id)
            .field("refresh_id", &self.refresh_id)
            .field("family_id", &self.family_id)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct IssuerConfig {
    pub issuer: String,
    pub access_ttl: std::time::Duration,
    pub refresh_ttl: std::time::Duration,
}

impl Default for IssuerConfig {
    fn default() -> Self {
        Self {
            issuer: DEFAULT_ISSUER.to_string(),
            access_ttl: std::time::Duration::from_secs(DEFAULT_ACCESS_TTL_SECS),
            refresh_ttl: std::time::Duration::from_secs(DEFAULT_REFRESH_TTL_SECS),
        }
    }
}

/// Mints and validates session tokens with one pinned algorithm
pub struct TokenIssuer {
    algorithm: Algorithm,
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenIssuer {
    /// HS256 issuer. Weak secrets are rejected outright.
    pub fn hs256(secret: impl Into<String>, config: IssuerConfig) -> Result<Self, TokenError> {
        let mut secret = secret.into();
        let report = validate_secret_strength(&secret);

        let result = match report.strength {
            SecretStrength::Weak => Err(TokenError::InvalidKey(format!(
                "HS256 secret rejected: {:?}",
                report.issues
            ))),
            strength => {
                if strength == SecretStrength::Acceptable {
                    warn!(
                        bits_per_byte = report.bits_per_byte,
                        "HS256 secret is acceptable but below the recommended strength"
                    );
                }
                let encoding = EncodingKey::from_secret(secret.as_bytes());
                let decoding = DecodingKey::from_secret(secret.as_bytes());
                Self::with_keys(Algorithm::HS256, encoding, decoding, config)
            }
        };

        secret.zeroize();
        result
    }

    /// RS256 issuer from a PEM encoded key pair.
    pub fn rs256(
        private_key_pem: &str,
        public_key_pem: &str,
        config: IssuerConfig,
    ) -> Result<Self, TokenError> {
        if private_key_pem.len() < MIN_RSA_PEM_LENGTH {
            return Err(TokenError::InvalidKey(format!(
                "private key too short - minimum {} characters required",
                MIN_RSA_PEM_LENGTH
            )));
        }

        let encoding = EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
            .map_err(|e| TokenError::InvalidKey(format!("invalid RSA private key: {}", e)))?;
        let decoding = DecodingKey::from_rsa_pem(public_key_pem.as_bytes())
            .map_err(|e| TokenError::InvalidKey(format!("invalid RSA public key: {}", e)))?;

        Self::with_keys(Algorithm::RS256, encoding, decoding, config)
    }

    fn with_keys(
        algorithm: Algorithm,
        encoding: EncodingKey,
        decoding: DecodingKey,
        config: IssuerConfig,
    ) -> Result<Self, TokenError> {
        let access_ttl = Duration::from_std(config.access_ttl)
            .map_err(|e| TokenError::InvalidKey(format!("access ttl out of range: {}", e)))?;
        let refresh_ttl = Duration::from_std(config.refresh_ttl)
            .map_err(|e| TokenError::InvalidKey(format!("refresh ttl out of range: {}", e)))?;

        if access_ttl <= Duration::zero() || refresh_ttl <= access_ttl {
            return Err(TokenError::InvalidKey(
                "refresh ttl must be longer than a non-zero access ttl".to_string(),
            ));
        }

        info!(
            algorithm = ?algorithm,
            issuer = %config.issuer,
            access_ttl_secs = access_ttl.num_seconds(),
            refresh_ttl_secs = refresh_ttl.num_seconds(),
            "token issuer initialized"
        );

        Ok(Self {
            algorithm,
            encoding,
            decoding,
            issuer: config.issuer,
            access_ttl,
            refresh_ttl,
        })
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Mint a pair that opens a new rotation family.
    pub fn issue_pair(&self, subject: &TokenSubject) -> Result<IssuedPair, TokenError> {
        self.mint_pair(subject, Uuid::new_v4())
    }

    /// Mint the successor of a validated refresh token, staying in its family.
    pub fn rotate_pair(&self, previous: &SessionClaims) -> Result<IssuedPair, TokenError> {
        if previous.token_kind != TokenKind::Refresh {
            return Err(TokenError::WrongKind {
                expected: TokenKind::Refresh,
                actual: previous.token_kind,
            });
        }
        let family_id = previous
            .family_id
            .ok_or_else(|| TokenError::Malformed("refresh token without family".to_string()))?;
        self.mint_pair(&TokenSubject::from(previous), family_id)
    }

    fn mint_pair(&self, subject: &TokenSubject, family_id: Uuid) -> Result<IssuedPair, TokenError> {
        let now = Utc::now();
        let access = self.claims(subject, TokenKind::Access, now, None);
        let refresh = self.claims(subject, TokenKind::Refresh, now, Some(family_id));

        Ok(IssuedPair {
            access_token: self.sign(&access)?,
            refresh_token: self.sign(&refresh)?,
            access_expires_at: now + self.access_ttl,
            refresh_expires_at: now + self.refresh_ttl,
            access_id: access.jti,
            refresh_id: refresh.jti,
            family_id,
        })
    }

    fn claims(
        &self,
        subject: &TokenSubject,
        kind: TokenKind,
        now: DateTime<Utc>,
        family_id: Option<Uuid>,
    ) -> SessionClaims {
        let ttl = match kind {
            TokenKind::Access => self.access_ttl,
            TokenKind::Refresh => self.refresh_ttl,
        };
        SessionClaims {
            user_id: subject.user_id,
            provider_subject: subject.provider_subject.clone(),
            email: subject.email.clone(),
            token_kind: kind,
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
            nbf: now.timestamp(),
            iss: self.issuer.clone(),
            jti: Uuid::new_v4().to_string(),
            family_id,
        }
    }

    fn sign(&self, claims: &SessionClaims) -> Result<String, TokenError> {
        encode(&Header::new(self.algorithm), claims, &self.encoding)
            .map_err(|e| TokenError::Signing(e.to_string()))
    }

    pub fn validate_access(&self, token: &str) -> Result<SessionClaims, TokenError> {
        self.validate(token, TokenKind::Access)
    }

    pub fn validate_refresh(&self, token: &str) -> Result<SessionClaims, TokenError> {
        self.validate(token, TokenKind::Refresh)
    }

    fn validate(&self, token: &str, expected: TokenKind) -> Result<SessionClaims, TokenError> {
        let mut validation = Validation::new(self.algorithm);
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.leeway = DEFAULT_VALIDATION_LEEWAY;
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "nbf"]);

        let claims = decode::<SessionClaims>(token, &self.decoding, &validation)?.claims;
        validate_claims(&claims)?;

        if claims.token_kind != expected {
            return Err(TokenError::WrongKind {
                expected,
                actual: claims.token_kind,
            });
        }
        if expected == TokenKind::Refresh && claims.family_id.is_none() {
            return Err(TokenError::Malformed("refresh token without family".to_string()));
        }

        Ok(claims)
    }
}

/// Checks that hold for every token regardless of kind
fn validate_claims(claims: &SessionClaims) -> Result<(), TokenError> {
    if claims.jti.trim().is_empty() {
        return Err(TokenError::Malformed("missing jti claim".to_string()));
    }

    let now = Utc::now().timestamp();
    if claims.iat > now + MAX_IAT_FUTURE_SKEW_SECS {
        return Err(TokenError::Malformed("token issued in the future".to_string()));
    }

    Ok(())
}

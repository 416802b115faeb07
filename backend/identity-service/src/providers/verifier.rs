use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, Validation};
use serde::Deserialize;
use std::str::FromStr;
use tracing::{debug, warn};

use super::{
    AssertionError, IdentityClaims, IdentityProvider, KeySetCache, ProviderProfile,
    VerificationError,
};

/// Header fields read before any key is chosen. `alg` stays a raw string so
/// that `"none"` and unknown names are rejected as signature failures.
#[derive(Debug, Deserialize)]
struct RawHeader {
    alg: String,
    #[serde(default)]
    kid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AssertionClaims {
    sub: String,
    iss: String,
    exp: i64,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    email_verified: Option<serde_json::Value>,
    #[serde(default)]
    nonce: Option<String>,
}

/// Verifies ID tokens for one provider and one client id
pub struct IdentityVerifier {
    profile: &'static ProviderProfile,
    client_id: String,
    keys: KeySetCache,
}

impl IdentityVerifier {
    pub fn new(provider: IdentityProvider, client_id: impl Into<String>, keys: KeySetCache) -> Self {
        Self {
            profile: provider.profile(),
            client_id: client_id.into(),
            keys,
        }
    }

    pub fn provider(&self) -> IdentityProvider {
        self.profile.provider
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Verify `raw_token` and return the identity it attests.
    ///
    /// When `expected_nonce` is given the token must carry exactly that nonce.
    pub async fn verify(
        &self,
        raw_token: &str,
        expected_nonce: Option<&str>,
    ) -> Result<IdentityClaims, AssertionError> {
        let result = self.verify_inner(raw_token, expected_nonce).await;
        if let Err(AssertionError::Rejected(reason)) = &result {
            warn!(provider = %self.provider(), reason = %reason, "Identity token rejected");
        }
        result
    }

    async fn verify_inner(
        &self,
        raw_token: &str,
        expected_nonce: Option<&str>,
    ) -> Result<IdentityClaims, AssertionError> {
        let header = peek_header(raw_token)?;

        match Algorithm::from_str(&header.alg) {
            Ok(alg) if alg == self.profile.algorithm => {}
            _ => return Err(VerificationError::SignatureInvalid.into()),
        }

        let kid = header
            .kid
            .filter(|kid| !kid.is_empty())
            .ok_or_else(|| VerificationError::MalformedToken("missing key id".to_string()))?;

        let key = self
            .keys
            .key(&kid)
            .await?
            .ok_or(VerificationError::UnknownSigningKey(kid))?;

        let mut validation = Validation::new(self.profile.algorithm);
        validation.leeway = 0;
        validation.validate_exp = true;
        validation.set_issuer(self.profile.issuers);
        validation.set_audience(&[self.client_id.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);

        let claims = decode::<AssertionClaims>(raw_token, &key.decoding, &validation)
            .map_err(classify_decode_error)?
            .claims;

        if let Some(expected) = expected_nonce {
            if claims.nonce.as_deref() != Some(expected) {
                return Err(VerificationError::NonceMismatch.into());
            }
        }

        let email_verified = claims
            .email_verified
            .as_ref()
            .is_some_and(self.profile.email_verified);
        let email = match claims.email {
            Some(email) if email_verified && !email.trim().is_empty() => email,
            _ => return Err(VerificationError::EmailUnverified.into()),
        };

        debug!(provider = %self.provider(), sub = %claims.sub, "Identity token verified");

        Ok(IdentityClaims {
            provider: self.provider(),
            subject: claims.sub,
            email,
            email_verified,
            issuer: claims.iss,
            audience: self.client_id.clone(),
            expires_at: DateTime::<Utc>::from_timestamp(claims.exp, 0)
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
            nonce: claims.nonce,
        })
    }
}

fn peek_header(token: &str) -> Result<RawHeader, VerificationError> {
    let mut segments = token.split('.');
    let (Some(header), Some(_), Some(_), None) =
        (segments.next(), segments.next(), segments.next(), segments.next())
    else {
        return Err(VerificationError::MalformedToken(
            "expected three segments".to_string(),
        ));
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(header)
        .map_err(|e| VerificationError::MalformedToken(format!("header encoding: {}", e)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| VerificationError::MalformedToken(format!("header json: {}", e)))
}

fn classify_decode_error(err: jsonwebtoken::errors::Error) -> VerificationError {
    match err.kind() {
        ErrorKind::InvalidSignature
        | ErrorKind::InvalidAlgorithm
        | ErrorKind::InvalidAlgorithmName
        | ErrorKind::InvalidKeyFormat
        | ErrorKind::InvalidRsaKey(_) => VerificationError::SignatureInvalid,
        ErrorKind::ExpiredSignature => VerificationError::Expired,
        ErrorKind::InvalidIssuer => VerificationError::IssuerMismatch,
        ErrorKind::InvalidAudience => VerificationError::AudienceMismatch,
        _ => VerificationError::MalformedToken(err.to_string()),
    }
}

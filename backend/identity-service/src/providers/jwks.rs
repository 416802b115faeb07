//! Provider public key sets (JWKS)
//!
//! Each provider gets its own [`KeySetCache`]. Keys are refetched as a whole
//! once the cached set is older than the staleness window; a key id that is
//! missing from a fresh set is reported as a miss and never triggers another
//! fetch, so an attacker cannot make us hammer the provider with random kids.

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_KEY_SET_BYTES: usize = 1024 * 1024;
pub const DEFAULT_KEY_SET_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum KeyFetchError {
    #[error("key set request failed: {0}")]
    Http(String),

    #[error("key set request timed out after {0:?}")]
    Timeout(Duration),

    #[error("key set endpoint returned status {0}")]
    Status(u16),

    #[error("key set response exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("key set response is not a valid JWKS document: {0}")]
    Decode(String),

    #[error("key set contains no usable keys")]
    Empty,
}

/// One entry of a published JWKS document
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Jwk {
    pub kty: String,
    #[serde(default)]
    pub kid: Option<String>,
    #[serde(default)]
    pub alg: Option<String>,
    /// RSA public key modulus (Base64URL encoded)
    #[serde(default)]
    pub n: Option<String>,
    /// RSA public key exponent (Base64URL encoded)
    #[serde(default)]
    pub e: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JwkSet {
    keys: Vec<Jwk>,
}

/// Source of raw key set documents
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeySetFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<Jwk>, KeyFetchError>;
}

/// Fetches JWKS documents over HTTPS with a bounded timeout and body size
#[derive(Clone)]
pub struct HttpKeySetFetcher {
    http: Client,
    timeout: Duration,
    max_body_bytes: usize,
}

impl HttpKeySetFetcher {
    pub fn new(http: Client, timeout: Duration, max_body_bytes: usize) -> Self {
        Self {
            http,
            timeout,
            max_body_bytes,
        }
    }

    fn request_error(&self, err: reqwest::Error) -> KeyFetchError {
        if err.is_timeout() {
            KeyFetchError::Timeout(self.timeout)
        } else {
            KeyFetchError::Http(err.to_string())
        }
    }
}

impl Default for HttpKeySetFetcher {
    fn default() -> Self {
        Self::new(Client::new(), DEFAULT_FETCH_TIMEOUT, DEFAULT_MAX_KEY_SET_BYTES)
    }
}

#[async_trait]
impl KeySetFetcher for HttpKeySetFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<Jwk>, KeyFetchError> {
        debug!("Fetching provider key set from {}", url);

        let mut response = self
            .http
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        let status = response.status();
        if !status.is_success() {
            error!(url = %url, status = %status, "Key set request failed");
            return Err(KeyFetchError::Status(status.as_u16()));
        }

        let limit = self.max_body_bytes;
        if response.content_length().is_some_and(|len| len > limit as u64) {
            return Err(KeyFetchError::TooLarge { limit });
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| self.request_error(e))? {
            if body.len() + chunk.len() > limit {
                return Err(KeyFetchError::TooLarge { limit });
            }
            body.extend_from_slice(&chunk);
        }

        let set: JwkSet =
            serde_json::from_slice(&body).map_err(|e| KeyFetchError::Decode(e.to_string()))?;
        Ok(set.keys)
    }
}

/// Verification key for one `kid`
#[derive(Clone)]
pub struct ProviderKey {
    pub kid: String,
    pub algorithm: Algorithm,
    pub decoding: DecodingKey,
}

impl fmt::Debug for ProviderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderKey")
            .field("kid", &self.kid)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// Keep only RSA keys usable with `algorithm`, indexed by kid.
fn usable_keys(documents: Vec<Jwk>, algorithm: Algorithm) -> HashMap<String, ProviderKey> {
    let expected_alg = format!("{:?}", algorithm);
    let mut keys = HashMap::with_capacity(documents.len());

    for jwk in documents {
        if jwk.kty != "RSA" {
            debug!(kty = %jwk.kty, "Skipping non-RSA key");
            continue;
        }
        if jwk.alg.as_deref().is_some_and(|alg| alg != expected_alg) {
            debug!(alg = ?jwk.alg, "Skipping key with unexpected algorithm");
            continue;
        }
        let (Some(kid), Some(n), Some(e)) = (jwk.kid, jwk.n, jwk.e) else {
            warn!("Skipping RSA key without kid or components");
            continue;
        };
        match DecodingKey::from_rsa_components(&n, &e) {
            Ok(decoding) => {
                keys.insert(
                    kid.clone(),
                    ProviderKey {
                        kid,
                        algorithm,
                        decoding,
                    },
                );
            }
            Err(err) => warn!(kid = %kid, error = %err, "Skipping undecodable RSA key"),
        }
    }

    keys
}

#[derive(Default)]
struct CachedKeys {
    keys: HashMap<String, ProviderKey>,
    fetched_at: Option<Instant>,
}

impl CachedKeys {
    fn is_fresh(&self, max_age: Duration) -> bool {
        self.fetched_at
            .is_some_and(|fetched_at| fetched_at.elapsed() < max_age)
    }
}

/// Per-provider key cache with double-checked refresh
pub struct KeySetCache {
    fetcher: Arc<dyn KeySetFetcher>,
    url: String,
    algorithm: Algorithm,
    max_age: Duration,
    state: RwLock<CachedKeys>,
}

impl KeySetCache {
    pub fn new(fetcher: Arc<dyn KeySetFetcher>, url: impl Into<String>, algorithm: Algorithm) -> Self {
        Self {
            fetcher,
            url: url.into(),
            algorithm,
            max_age: DEFAULT_KEY_SET_MAX_AGE,
            state: RwLock::new(CachedKeys::default()),
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Look up `kid`, refreshing the whole set first if it is stale.
    ///
    /// `Ok(None)` means the set is fresh and simply does not contain `kid`.
    pub async fn key(&self, kid: &str) -> Result<Option<ProviderKey>, KeyFetchError> {
        {
            let cached = self.state.read().await;
            if cached.is_fresh(self.max_age) {
                return Ok(cached.keys.get(kid).cloned());
            }
        }

        let mut cached = self.state.write().await;
        // Another caller may have refreshed while we waited for the write lock.
        if !cached.is_fresh(self.max_age) {
            let documents = self.fetcher.fetch(&self.url).await.map_err(|e| {
                error!(url = %self.url, error = %e, "Provider key set refresh failed");
                e
            })?;

            let keys = usable_keys(documents, self.algorithm);
            if keys.is_empty() {
                return Err(KeyFetchError::Empty);
            }

            info!(url = %self.url, count = keys.len(), "Provider key set refreshed");
            *cached = CachedKeys {
                keys,
                fetched_at: Some(Instant::now()),
            };
        }

        Ok(cached.keys.get(kid).cloned())
    }
}

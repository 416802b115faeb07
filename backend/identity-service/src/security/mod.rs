/// Security primitives for identity-service
///
/// - `session_index`: Redis mirror of live refresh tokens and the jti blacklist
/// - `sign_in_throttle`: per-client sign-in attempt limits
///
/// Token signing and validation live in the shared `jwt-security` crate.
use sha2::{Digest, Sha256};

pub mod session_index;
pub mod sign_in_throttle;

pub use session_index::{EphemeralSessionIndex, SessionIndex, SessionIndexError};
pub use sign_in_throttle::{AttemptLimiter, SignInThrottle};

/// SHA-256 digest of a raw token, hex encoded. Raw tokens are never stored.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

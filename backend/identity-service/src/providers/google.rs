//! Google Sign-In

use jsonwebtoken::Algorithm;
use serde_json::Value;

use super::{IdentityProvider, ProviderProfile};

pub const GOOGLE_ISSUERS: &[&str] = &["https://accounts.google.com", "accounts.google.com"];
pub const GOOGLE_KEYS_URL: &str = "https://www.googleapis.com/oauth2/v3/certs";

pub static PROFILE: ProviderProfile = ProviderProfile {
    provider: IdentityProvider::Google,
    issuers: GOOGLE_ISSUERS,
    keys_url: GOOGLE_KEYS_URL,
    algorithm: Algorithm::RS256,
    email_verified,
};

// Google always sends a JSON boolean.
fn email_verified(value: &Value) -> bool {
    value.as_bool().unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_email_verified_requires_bool() {
        assert!(email_verified(&json!(true)));
        assert!(!email_verified(&json!(false)));
        assert!(!email_verified(&json!("true")));
    }

    #[test]
    fn test_google_accepts_both_issuer_forms() {
        assert!(PROFILE.issuers.contains(&"https://accounts.google.com"));
        assert!(PROFILE.issuers.contains(&"accounts.google.com"));
    }
}

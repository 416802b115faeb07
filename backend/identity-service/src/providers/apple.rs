//! Sign in with Apple
//!
//! Apple encodes `email_verified` as either a JSON boolean or the strings
//! `"true"` / `"false"`, depending on the client SDK that requested the token.

use jsonwebtoken::Algorithm;
use serde_json::Value;

use super::{IdentityProvider, ProviderProfile};

pub const APPLE_ISSUER: &str = "https://appleid.apple.com";
pub const APPLE_KEYS_URL: &str = "https://appleid.apple.com/auth/keys";

pub static PROFILE: ProviderProfile = ProviderProfile {
    provider: IdentityProvider::Apple,
    issuers: &[APPLE_ISSUER],
    keys_url: APPLE_KEYS_URL,
    algorithm: Algorithm::RS256,
    email_verified,
};

fn email_verified(value: &Value) -> bool {
    match value {
        Value::Bool(verified) => *verified,
        Value::String(verified) => verified.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_email_verified_accepts_bool_and_string() {
        assert!(email_verified(&json!(true)));
        assert!(email_verified(&json!("true")));
        assert!(!email_verified(&json!(false)));
        assert!(!email_verified(&json!("false")));
        assert!(!email_verified(&json!(1)));
        assert!(!email_verified(&Value::Null));
    }

    #[test]
    fn test_apple_profile() {
        assert_eq!(PROFILE.issuers, &["https://appleid.apple.com"]);
        assert_eq!(PROFILE.keys_url, "https://appleid.apple.com/auth/keys");
    }
}

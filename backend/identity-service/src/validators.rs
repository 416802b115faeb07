use once_cell::sync::Lazy;
use regex::Regex;
use validator::ValidationError;

/// Input validation for identities asserted by third-party providers

// These patterns are hardcoded and always valid, so we use expect() with explicit reasoning
static EMAIL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$")
        .expect("hardcoded email regex is invalid - fix source code")
});

pub const MAX_EMAIL_LENGTH: usize = 254;
pub const MAX_SUBJECT_LENGTH: usize = 255;

/// Validate email format (RFC 5322 simplified)
pub fn validate_email(email: &str) -> bool {
    !email.is_empty() && email.len() <= MAX_EMAIL_LENGTH && EMAIL_REGEX.is_match(email)
}

/// Provider subjects are opaque, but must fit the account columns and
/// contain no whitespace or control characters.
pub fn validate_provider_subject(subject: &str) -> bool {
    !subject.is_empty()
        && subject.len() <= MAX_SUBJECT_LENGTH
        && !subject.chars().any(|c| c.is_whitespace() || c.is_control())
}

/// validator crate compatible custom validator for provider emails
pub fn validate_email_validator(email: &str) -> Result<(), ValidationError> {
    if validate_email(email) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_email"))
    }
}

/// validator crate compatible custom validator for provider subjects
pub fn validate_provider_subject_validator(subject: &str) -> Result<(), ValidationError> {
    if validate_provider_subject(subject) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_provider_subject"))
    }
}

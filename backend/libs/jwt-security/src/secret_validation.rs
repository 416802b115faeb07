//! Strength checks for HS256 signing secrets
//!
//! A shared-secret HMAC is only as strong as the secret, so the issuer
//! refuses to start with one that is short, low-entropy or patterned.

pub const MIN_SECRET_LENGTH: usize = 32;
const RECOMMENDED_SECRET_LENGTH: usize = 64;
const MIN_ENTROPY_BITS: f64 = 4.0;
const STRONG_ENTROPY_BITS: f64 = 5.0;
const MAX_RUN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretStrength {
    Weak,
    Acceptable,
    Strong,
}

/// Why a secret was classified as weak.
#[derive(Debug, Clone, PartialEq)]
pub enum SecretIssue {
    TooShort { length: usize },
    LowEntropy { bits_per_byte: f64 },
    RepeatedRun,
    SequentialRun,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SecretReport {
    pub strength: SecretStrength,
    pub bits_per_byte: f64,
    pub issues: Vec<SecretIssue>,
}

/// Classify an HS256 secret.
///
/// Weak: under 32 bytes, under 4 bits/byte of Shannon entropy, or a run of
/// 4 repeated or ascending bytes. Strong: 64+ bytes at 5+ bits/byte.
pub fn validate_secret_strength(secret: &str) -> SecretReport {
    let bytes = secret.as_bytes();
    let bits_per_byte = shannon_entropy(bytes);
    let mut issues = Vec::new();

    if bytes.len() < MIN_SECRET_LENGTH {
        issues.push(SecretIssue::TooShort {
            length: bytes.len(),
        });
    }
    if bits_per_byte < MIN_ENTROPY_BITS {
        issues.push(SecretIssue::LowEntropy { bits_per_byte });
    }
    if longest_run(bytes, |a, b| a == b) >= MAX_RUN {
        issues.push(SecretIssue::RepeatedRun);
    }
    if longest_run(bytes, |a, b| b as i16 - a as i16 == 1) >= MAX_RUN {
        issues.push(SecretIssue::SequentialRun);
    }

    let strength = if !issues.is_empty() {
        SecretStrength::Weak
    } else if bytes.len() >= RECOMMENDED_SECRET_LENGTH && bits_per_byte >= STRONG_ENTROPY_BITS {
        SecretStrength::Strong
    } else {
        SecretStrength::Acceptable
    };

    SecretReport {
        strength,
        bits_per_byte,
        issues,
    }
}

/// Shannon entropy in bits per byte (0..=8).
fn shannon_entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let mut freq = [0u32; 256];
    for &byte in data {
        freq[byte as usize] += 1;
    }
    let len = data.len() as f64;
    freq.iter()
        .filter(|&&count| count > 0)
        .map(|&count| {
            let p = count as f64 / len;
            -p * p.log2()
        })
        .sum()
}

fn longest_run(data: &[u8], linked: impl Fn(u8, u8) -> bool) -> usize {
    let mut longest = usize::from(!data.is_empty());
    let mut current = longest;
    for pair in data.windows(2) {
        if linked(pair[0], pair[1]) {
            current += 1;
            longest = longest.max(current);
        } else {
            current = 1;
        }
    }
    longest
}

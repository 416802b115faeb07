/// Identity Service Library
///
/// Mobile sign-in with Apple and Google identity tokens, and the lifecycle of
/// the session tokens we issue in exchange.
///
/// ## Modules
///
/// - `config`: Service configuration
/// - `db`: Durable stores (accounts, refresh-token records)
/// - `error`: Error types
/// - `models`: Data models
/// - `providers`: Apple/Google ID token verification
/// - `security`: Redis session index and sign-in throttling
/// - `services`: Session orchestration and maintenance tasks
/// - `validators`: Input validation
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod providers;
pub mod security;
pub mod services;
pub mod validators;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use error::{IdentityError, Result};
pub use services::{AuthService, SessionTokens, SignInRequest};

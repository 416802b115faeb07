/// Service layer for identity-service
///
/// - `auth`: sign-in, refresh rotation, sign-out and revoke-all
/// - `maintenance`: periodic cleanup of expired refresh records
pub mod auth;
pub mod maintenance;

pub use auth::{AuthService, SessionTokens, SignInRequest};
pub use maintenance::{spawn_token_cleanup, TokenCleanupConfig};

pub mod refresh_token;
pub mod user;

pub use refresh_token::{NewRefreshRecord, RefreshRecord, RevokedToken};
pub use user::{ProviderIdentity, User};

//! HTTP control plane and dispatch engine for scheduled transfers.

pub mod app;
mod dispatch;
pub mod error;
pub mod identity;
pub mod service;
mod sweeper;
#[cfg(test)]
mod test_support;

pub use app::{build_router, AppState};
pub use error::ServiceError;
pub use identity::{
    bearer_token, secrets_match, CurrentUser, IdentityProvider, StaticTokenIdentityProvider,
    StaticUser,
};
pub use service::{ServiceSettings, SweeperSettings, TransferService};

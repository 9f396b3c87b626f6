use blackraven_contract::FieldError;
use blackraven_delivery::DeliveryError;
use blackraven_storage::BlobError;
use blackraven_transfer::{HashError, ValidationError};
use thiserror::Error;

/// Request-level failure taxonomy. Every variant is turned into a JSON body
/// at the router boundary.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("validation failed")]
    Validation(Vec<FieldError>),
    #[error("authentication required")]
    Unauthenticated,
    /// Missing and not-owned look the same to the caller.
    #[error("transfer not found")]
    NotFound,
    #[error("precondition failed: {0}")]
    Conflict(String),
    #[error("operational error: {0:#}")]
    Operational(anyhow::Error),
}

impl ServiceError {
    pub fn conflict(reason: impl Into<String>) -> Self {
        Self::Conflict(reason.into())
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(error: anyhow::Error) -> Self {
        Self::Operational(error)
    }
}

impl From<ValidationError> for ServiceError {
    fn from(error: ValidationError) -> Self {
        Self::Validation(error.0)
    }
}

impl From<HashError> for ServiceError {
    fn from(error: HashError) -> Self {
        Self::Operational(error.into())
    }
}

impl From<BlobError> for ServiceError {
    fn from(error: BlobError) -> Self {
        Self::Operational(error.into())
    }
}

impl From<DeliveryError> for ServiceError {
    fn from(error: DeliveryError) -> Self {
        Self::Operational(error.into())
    }
}

use thiserror::Error;

use crate::{application::entity::ServiceError, infra::error::InfraError};

/// Top-level failure of one `sitecms` invocation.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    /// Short label for the failure class, used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Service(ServiceError::Validation(_)) => "validation",
            AppError::Service(ServiceError::NotFound) => "not_found",
            AppError::Service(ServiceError::InvalidId) => "invalid_id",
            AppError::Service(ServiceError::Backend(_)) => "backend",
            AppError::Unexpected(_) => "unexpected",
            AppError::Infra(
                InfraError::MissingStoreUrl
                | InfraError::InvalidStoreUrl { .. }
                | InfraError::InvalidApiKey,
            ) => "configuration",
            AppError::Infra(InfraError::ClientBuild(_)) => "store_client",
            AppError::Infra(InfraError::Telemetry(_)) => "telemetry",
            AppError::Infra(InfraError::Output(_)) => "output",
        }
    }
}

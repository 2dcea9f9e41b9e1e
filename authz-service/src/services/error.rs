use service_core::error::AppError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Consistency error: {0}")]
    Consistency(String),

    #[error("Database error: {0}")]
    Database(anyhow::Error),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<sqlx::Error> for ServiceError {
    fn from(err: sqlx::Error) -> Self {
        ServiceError::Database(anyhow::Error::new(err))
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Validation(e) => AppError::BadRequest(anyhow::anyhow!(e)),
            ServiceError::NotFound(e) => AppError::NotFound(anyhow::anyhow!(e)),
            ServiceError::Conflict(e) => AppError::Conflict(anyhow::anyhow!(e)),
            ServiceError::Consistency(e) => AppError::InternalError(anyhow::anyhow!(e)),
            ServiceError::Database(e) => AppError::DatabaseError(e),
            ServiceError::Internal(e) => AppError::InternalError(e),
        }
    }
}

/// Convenience alias for service results.
pub type ServiceResult<T> = Result<T, ServiceError>;

//! Service layer errors.

use service_core::error::{AppError, FieldError};
use thiserror::Error;

use super::idp::IdpError;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Identity provider error: {0}")]
    Idp(#[from] IdpError),

    #[error("Invalid credential")]
    InvalidCredential,

    #[error("Malformed subject: {0}")]
    MalformedSubject(String),

    #[error("Token expired")]
    TokenExpired,

    #[error("Malformed token")]
    TokenMalformed,

    #[error("Bad token signature")]
    BadSignature,

    #[error("token has been invalidated")]
    BlacklistedToken,

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("{0}")]
    Conflict(String),

    #[error("validation failed")]
    Validation(Vec<FieldError>),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Database(e) => AppError::Database(anyhow::anyhow!(e)),
            ServiceError::Cache(e) => AppError::Internal(anyhow::anyhow!(e)),
            ServiceError::Idp(IdpError::Unauthorized) => {
                AppError::Unauthorized(anyhow::anyhow!("invalid identity provider token"))
            }
            ServiceError::Idp(IdpError::NotFound(what)) => {
                AppError::NotFound(anyhow::anyhow!("{} not found", what))
            }
            ServiceError::Idp(e) => AppError::Dependency(anyhow::anyhow!(e)),
            ServiceError::InvalidCredential => {
                AppError::Unauthorized(anyhow::anyhow!("invalid credential"))
            }
            ServiceError::MalformedSubject(msg) => AppError::BadRequest(anyhow::anyhow!(msg)),
            ServiceError::TokenExpired => AppError::Unauthorized(anyhow::anyhow!("token expired")),
            ServiceError::TokenMalformed => {
                AppError::Unauthorized(anyhow::anyhow!("malformed token"))
            }
            ServiceError::BadSignature => {
                AppError::Unauthorized(anyhow::anyhow!("invalid token signature"))
            }
            ServiceError::BlacklistedToken => {
                AppError::Unauthorized(anyhow::anyhow!("token has been invalidated"))
            }
            ServiceError::AccessDenied(msg) => {
                AppError::Forbidden(anyhow::anyhow!("access denied: {}", msg))
            }
            ServiceError::NotFound(what) => {
                AppError::NotFound(anyhow::anyhow!("{} not found", what))
            }
            ServiceError::AlreadyExists(what) => {
                AppError::Conflict(anyhow::anyhow!("{} already exists", what))
            }
            ServiceError::Conflict(msg) => AppError::Conflict(anyhow::anyhow!(msg)),
            ServiceError::Validation(errors) => AppError::Validation(errors),
            ServiceError::Internal(e) => AppError::Internal(e),
        }
    }
}

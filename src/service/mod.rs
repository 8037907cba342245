//! Request-level business rules on top of the repository functions.
//!
//! Services log data-layer failures with context and collapse them into
//! `ServiceError::Database`, so callers never see SQL details.

pub mod comments;
pub mod posts;
pub mod users;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("user not found")]
    UserNotFound,
    #[error("user already exists")]
    UserAlreadyExists,
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("invalid refresh token")]
    InvalidRefreshToken,
    #[error("refresh token expired")]
    RefreshTokenExpired,
    #[error("weak password: {0}")]
    WeakPassword(String),
    #[error("token generation failed")]
    TokenGeneration,
    #[error("password hash failed")]
    PasswordHash,
    #[error("post not found")]
    PostNotFound,
    #[error("comment not found")]
    CommentNotFound,
    #[error("forbidden")]
    Forbidden,
    #[error("{0}")]
    Validation(&'static str),
    #[error("database error")]
    Database,
}

pub type ServiceResult<T> = Result<T, ServiceError>;

//! Authentication failure taxonomy

use super::jwt::JwtError;
use super::password::{PasswordError, PasswordValidationError};

/// Every way an auth operation can fail. Each variant is distinct so callers
/// can map them without string matching.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Unknown email or wrong password. Deliberately indistinguishable.
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("Account is not active")]
    AccountInactive,
    /// Bad signature, unknown token, or a refresh token that was already
    /// revoked or rotated
    #[error("Invalid token")]
    InvalidToken,
    #[error("Token has expired")]
    TokenExpired,
    #[error("Invalid or expired password reset token")]
    InvalidOrExpiredResetToken,
    #[error("Authentication required")]
    Unauthorized,
    #[error("Insufficient permissions")]
    Forbidden,
    #[error("{0}")]
    WeakPassword(#[from] PasswordValidationError),
    #[error(transparent)]
    Password(#[from] PasswordError),
    #[error("Token signing failed: {0}")]
    Signing(String),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl From<JwtError> for AuthError {
    fn from(err: JwtError) -> Self {
        match err {
            JwtError::Expired => AuthError::TokenExpired,
            JwtError::Invalid | JwtError::WrongTokenType => AuthError::InvalidToken,
            JwtError::Encoding(msg) => AuthError::Signing(msg),
        }
    }
}

/// Failures of the refresh-token store and user directory
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// Compare-and-set on an active refresh token lost: it was revoked or
    /// rotated by a concurrent request
    #[error("Refresh token already revoked")]
    AlreadyRevoked,
    #[error("Record not found")]
    NotFound,
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type AuthResult<T> = Result<T, AuthError>;

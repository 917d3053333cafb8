//! Error types for ASUBT request handlers.

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur while handling a request.
///
/// Every variant maps to one HTTP status through [`Error::status_code`]; the
/// message is what ends up in the `{"error": "..."}` body, except for the
/// variants that map to 500, whose details are only logged.
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Missing or malformed input
    #[error("{0}")]
    Validation(String),

    /// Bad credentials or token
    #[error("{0}")]
    Auth(String),

    /// Authenticated but not allowed (disabled account)
    #[error("{0}")]
    Forbidden(String),

    /// Entity id did not resolve
    #[error("{0}")]
    NotFound(String),

    /// Duplicate entity
    #[error("{0}")]
    Conflict(String),

    /// Method not supported by this handler
    #[error("Method not allowed")]
    MethodNotAllowed,

    /// Credential hashing failure
    #[error("Credential error: {0}")]
    Credential(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Get HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Validation(_) => 400,
            Error::Auth(_) => 401,
            Error::Forbidden(_) => 403,
            Error::NotFound(_) => 404,
            Error::MethodNotAllowed => 405,
            Error::Conflict(_) => 409,
            _ => 500,
        }
    }

    /// Message safe to return to the caller.
    pub fn public_message(&self) -> String {
        match self.status_code() {
            500 => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }

    /// True when the database rejected a write because of a unique constraint.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Error::Database(sqlx::Error::Database(db)) => db.is_unique_violation(),
            _ => false,
        }
    }
}

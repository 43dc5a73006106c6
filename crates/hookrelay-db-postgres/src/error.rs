//! Error types for the PostgreSQL storage backend.

use hookrelay_delivery::DeliveryError;
use sqlx_core::error::Error as SqlxError;

/// PostgreSQL error code for foreign key violations (23503).
pub const PG_FOREIGN_KEY_VIOLATION: &str = "23503";

/// Checks if a sqlx error has a specific PostgreSQL error code.
pub fn has_pg_error_code(err: &SqlxError, code: &str) -> bool {
    if let SqlxError::Database(db_err) = err {
        db_err.code().as_deref() == Some(code)
    } else {
        false
    }
}

/// Errors raised while setting up the PostgreSQL backend.
#[derive(Debug, thiserror::Error)]
pub enum PostgresError {
    #[error("Database connection error: {0}")]
    Connection(#[from] SqlxError),

    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl PostgresError {
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

impl From<PostgresError> for DeliveryError {
    fn from(err: PostgresError) -> Self {
        match err {
            PostgresError::Connection(e) => DeliveryError::Storage(e.to_string()),
            PostgresError::Config { message } => DeliveryError::InvalidConfig(message),
        }
    }
}

/// Maps a query failure into the delivery error space.
pub(crate) fn storage_error(err: SqlxError) -> DeliveryError {
    DeliveryError::Storage(err.to_string())
}

/// Result type alias for PostgreSQL setup operations.
pub type Result<T> = std::result::Result<T, PostgresError>;

//! Error types for the praxisdb data-access layer
//!
//! Provides a comprehensive error handling system with:
//! - Distinct error types for different failure modes
//! - Machine-readable error codes for callers
//! - Classification of driver constraint errors
//!
//! Errors are surfaced synchronously as the result of the failing call;
//! this layer performs no retries.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using DalError
pub type Result<T> = std::result::Result<T, DalError>;

/// Error codes for machine-readable error identification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors (1xxx)
    ValidationError,
    UnknownEntity,
    UnknownField,

    // Resource errors (4xxx)
    NotFound,

    // Constraint errors (5xxx)
    UniqueConstraintViolation,
    ForeignKeyViolation,

    // Database errors (7xxx)
    DatabaseError,
    ConnectionError,
    TransactionAborted,

    // Internal errors (9xxx)
    ConfigurationError,
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn as_code(&self) -> u16 {
        match self {
            // Validation (1xxx)
            ErrorCode::ValidationError => 1001,
            ErrorCode::UnknownEntity => 1002,
            ErrorCode::UnknownField => 1003,

            // Resources (4xxx)
            ErrorCode::NotFound => 4001,

            // Constraints (5xxx)
            ErrorCode::UniqueConstraintViolation => 5001,
            ErrorCode::ForeignKeyViolation => 5002,

            // Database (7xxx)
            ErrorCode::DatabaseError => 7001,
            ErrorCode::ConnectionError => 7002,
            ErrorCode::TransactionAborted => 7003,

            // Internal (9xxx)
            ErrorCode::ConfigurationError => 9002,
            ErrorCode::InternalError => 9001,
        }
    }
}

/// Data-access layer error types
#[derive(Error, Debug)]
pub enum DalError {
    // Validation errors
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("Unknown entity: {name}")]
    UnknownEntity { name: String },

    #[error("Unknown field {field} on entity {entity}")]
    UnknownField { entity: String, field: String },

    // Resource errors
    #[error("{entity} not found")]
    NotFound { entity: String },

    // Constraint errors
    #[error("Unique constraint violation: {message}")]
    UniqueConstraintViolation { message: String },

    #[error("Foreign key violation: {message}")]
    ForeignKeyViolation { message: String },

    // Transaction errors
    #[error("Transaction aborted: {reason}")]
    TransactionAborted { reason: String },

    // Database errors
    #[error("Database connection error: {message}")]
    Connection { message: String },

    #[error("Database error: {0}")]
    Database(sqlx::Error),

    // Internal errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    // Generic
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl DalError {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            DalError::Validation { .. } => ErrorCode::ValidationError,
            DalError::UnknownEntity { .. } => ErrorCode::UnknownEntity,
            DalError::UnknownField { .. } => ErrorCode::UnknownField,
            DalError::NotFound { .. } => ErrorCode::NotFound,
            DalError::UniqueConstraintViolation { .. } => ErrorCode::UniqueConstraintViolation,
            DalError::ForeignKeyViolation { .. } => ErrorCode::ForeignKeyViolation,
            DalError::TransactionAborted { .. } => ErrorCode::TransactionAborted,
            DalError::Connection { .. } => ErrorCode::ConnectionError,
            DalError::Database(_) => ErrorCode::DatabaseError,
            DalError::Configuration { .. } => ErrorCode::ConfigurationError,
            DalError::Other(_) => ErrorCode::InternalError,
        }
    }

    /// True for errors caused by the caller's request shape or data
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            DalError::Validation { .. }
                | DalError::UnknownEntity { .. }
                | DalError::UnknownField { .. }
                | DalError::NotFound { .. }
                | DalError::UniqueConstraintViolation { .. }
                | DalError::ForeignKeyViolation { .. }
        )
    }

    /// Shorthand for a validation error without a field
    pub fn validation(message: impl Into<String>) -> Self {
        DalError::Validation {
            message: message.into(),
            field: None,
        }
    }

    /// Shorthand for a validation error tied to a field
    pub fn validation_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        DalError::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

impl From<sqlx::Error> for DalError {
    fn from(err: sqlx::Error) -> Self {
        use sqlx::error::ErrorKind;

        match err {
            sqlx::Error::Database(db) => match db.kind() {
                ErrorKind::UniqueViolation => DalError::UniqueConstraintViolation {
                    message: db.message().to_string(),
                },
                ErrorKind::ForeignKeyViolation => DalError::ForeignKeyViolation {
                    message: db.message().to_string(),
                },
                ErrorKind::NotNullViolation | ErrorKind::CheckViolation => DalError::Validation {
                    message: db.message().to_string(),
                    field: None,
                },
                _ => DalError::Database(sqlx::Error::Database(db)),
            },
            e @ (sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)) => DalError::Connection {
                message: e.to_string(),
            },
            other => DalError::Database(other),
        }
    }
}

//! Error types for Quarry

use thiserror::Error;

/// Main error type for Quarry
#[derive(Error, Debug)]
pub enum QuarryError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Db error: {0}")]
    Db(#[from] DbError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// RESP framing errors. All of these are connection-fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Connection closed mid-frame")]
    UnexpectedEof,

    #[error("Invalid multibulk length")]
    InvalidMultibulk,

    #[error("Invalid bulk length")]
    InvalidBulkLength,

    #[error("Protocol line exceeds maximum length")]
    LineTooLong,

    #[error("Missing CRLF terminator")]
    MissingCrlf,
}

/// Data-layer errors. Each kind maps to a RESP reply (or to `nil`/`0`
/// per-command semantics) at the command boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DbError {
    #[error("key not found")]
    NotFound,

    #[error("operation against a key holding the wrong kind of value")]
    TypeMismatch,

    #[error("encoded object is truncated")]
    InvalidLength,

    #[error("value is not an integer or out of range")]
    BadInteger,

    #[error("value is not a valid float")]
    BadFloat,

    #[error("transaction conflict")]
    Retryable,

    #[error("kv store error: {0}")]
    Kv(String),
}

impl DbError {
    /// The error string sent to the client when the error escapes a handler.
    pub fn client_message(&self) -> String {
        match self {
            DbError::TypeMismatch => {
                "WRONGTYPE Operation against a key holding the wrong kind of value".to_string()
            }
            DbError::BadInteger => "ERR value is not an integer or out of range".to_string(),
            DbError::BadFloat => "ERR value is not a valid float".to_string(),
            DbError::Retryable => "ERR transaction conflict, please retry".to_string(),
            other => format!("ERR {other}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, QuarryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_messages() {
        assert_eq!(
            DbError::TypeMismatch.client_message(),
            "WRONGTYPE Operation against a key holding the wrong kind of value"
        );
        assert_eq!(
            DbError::BadFloat.client_message(),
            "ERR value is not a valid float"
        );
        assert!(DbError::Kv("boom".into()).client_message().starts_with("ERR "));
    }
}

//! Error types for AtlasMV
//!
//! Provides a unified error type for all operations. Store-level failures carry a
//! stable numeric [`ErrorCode`]; once such an error "panics" the store, the same
//! error value is handed to every later caller, which is why the type is `Clone`.

use std::fmt;
use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Result type alias using AtlasError
pub type Result<T> = std::result::Result<T, AtlasError>;

/// Stable numeric codes for store failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ReadingFailed,
    WritingFailed,
    Internal,
    Closed,
    UnsupportedFormat,
    FileCorrupt,
    FileLocked,
    Serialization,
    ChunkNotFound,
}

impl ErrorCode {
    /// The numeric value of this code
    pub fn code(self) -> u32 {
        match self {
            ErrorCode::ReadingFailed => 1,
            ErrorCode::WritingFailed => 2,
            ErrorCode::Internal => 3,
            ErrorCode::Closed => 4,
            ErrorCode::UnsupportedFormat => 5,
            ErrorCode::FileCorrupt => 6,
            ErrorCode::FileLocked => 7,
            ErrorCode::Serialization => 8,
            ErrorCode::ChunkNotFound => 9,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::ReadingFailed => "READING_FAILED",
            ErrorCode::WritingFailed => "WRITING_FAILED",
            ErrorCode::Internal => "INTERNAL",
            ErrorCode::Closed => "CLOSED",
            ErrorCode::UnsupportedFormat => "UNSUPPORTED_FORMAT",
            ErrorCode::FileCorrupt => "FILE_CORRUPT",
            ErrorCode::FileLocked => "FILE_LOCKED",
            ErrorCode::Serialization => "SERIALIZATION",
            ErrorCode::ChunkNotFound => "CHUNK_NOT_FOUND",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.code(), self.name())
    }
}

/// Unified error type for AtlasMV operations
#[derive(Debug, Clone, Error)]
pub enum AtlasError {
    // -------------------------------------------------------------------------
    // Store Errors
    // -------------------------------------------------------------------------
    #[error("{message} [{code}]")]
    Store {
        code: ErrorCode,
        message: String,
        #[source]
        source: Option<Arc<io::Error>>,
    },

    // -------------------------------------------------------------------------
    // Caller Errors
    // -------------------------------------------------------------------------
    #[error("Illegal argument: {0}")]
    IllegalArgument(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl AtlasError {
    /// Create a store error without an underlying cause
    pub fn store(code: ErrorCode, message: impl Into<String>) -> Self {
        AtlasError::Store {
            code,
            message: message.into(),
            source: None,
        }
    }

    /// Create a store error wrapping an I/O failure
    pub fn io(code: ErrorCode, message: impl Into<String>, err: io::Error) -> Self {
        AtlasError::Store {
            code,
            message: message.into(),
            source: Some(Arc::new(err)),
        }
    }

    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::store(ErrorCode::FileCorrupt, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::store(ErrorCode::Internal, message)
    }

    /// The store error code, if this is a store error
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            AtlasError::Store { code, .. } => Some(*code),
            AtlasError::Serialization(_) => Some(ErrorCode::Serialization),
            _ => None,
        }
    }

    /// Whether this error should stop the store (I/O or corruption)
    pub(crate) fn is_fatal(&self) -> bool {
        matches!(
            self.code(),
            Some(
                ErrorCode::ReadingFailed
                    | ErrorCode::WritingFailed
                    | ErrorCode::FileCorrupt
                    | ErrorCode::Internal
                    | ErrorCode::ChunkNotFound
            )
        )
    }
}

impl From<bincode::Error> for AtlasError {
    fn from(err: bincode::Error) -> Self {
        AtlasError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(ErrorCode::ReadingFailed.code(), 1);
        assert_eq!(ErrorCode::FileCorrupt.code(), 6);
        assert_eq!(ErrorCode::ChunkNotFound.code(), 9);
    }

    #[test]
    fn test_display_includes_code() {
        let err = AtlasError::store(ErrorCode::Closed, "This store is closed");
        assert_eq!(err.to_string(), "This store is closed [4/CLOSED]");
        assert_eq!(err.code(), Some(ErrorCode::Closed));
    }

    #[test]
    fn test_io_source_survives_clone() {
        let err = AtlasError::io(
            ErrorCode::ReadingFailed,
            "read failed",
            io::Error::new(io::ErrorKind::UnexpectedEof, "eof"),
        );
        let copy = err.clone();
        assert!(std::error::Error::source(&copy).is_some());
        assert!(copy.is_fatal());
    }
}

//! Error types for Quarry.

use thiserror::Error;

/// Result type alias using QuarryError.
pub type Result<T> = std::result::Result<T, QuarryError>;

/// Errors that can occur in Quarry storage operations.
#[derive(Debug, Error)]
pub enum QuarryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("buffer pool exhausted: no free or evictable frame")]
    BufferPoolExhausted,

    #[error("header page full, unable to register index {0}")]
    HeaderFull(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_io_error_conversion() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let err: QuarryError = io_err.into();
        assert!(matches!(err, QuarryError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_pool_exhausted_display() {
        let err = QuarryError::BufferPoolExhausted;
        assert_eq!(
            err.to_string(),
            "buffer pool exhausted: no free or evictable frame"
        );
    }

    #[test]
    fn test_header_full_display() {
        let err = QuarryError::HeaderFull("orders_pk".to_string());
        assert_eq!(
            err.to_string(),
            "header page full, unable to register index orders_pk"
        );
    }

    #[test]
    fn test_invalid_config_display() {
        let err = QuarryError::InvalidConfig("leaf_max_size too large".to_string());
        assert_eq!(
            err.to_string(),
            "invalid configuration: leaf_max_size too large"
        );
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(42)
        }

        fn returns_err() -> Result<i32> {
            Err(QuarryError::BufferPoolExhausted)
        }

        assert!(returns_ok().is_ok());
        assert!(returns_err().is_err());
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<QuarryError>();
    }
}

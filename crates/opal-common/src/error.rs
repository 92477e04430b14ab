//! Error types for OpalDB.

use thiserror::Error;

/// Result type alias using OpalError.
pub type Result<T> = std::result::Result<T, OpalError>;

/// Errors that can occur in OpalDB operations.
#[derive(Debug, Error)]
pub enum OpalError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Storage errors
    #[error("Page not found: {page_id}")]
    PageNotFound { page_id: u32 },

    #[error("Page corrupted: {page_id}, reason: {reason}")]
    PageCorrupted { page_id: u32, reason: String },

    #[error("Buffer pool full, unable to allocate frame")]
    BufferPoolFull,

    // Hash index errors
    #[error("Key not found")]
    KeyNotFound,

    #[error("Duplicate key")]
    DuplicateKey,

    #[error("Directory at maximum depth, bucket cannot split")]
    DirectoryFull,

    #[error("Key size mismatch: expected {expected} bytes, got {actual}")]
    KeySizeMismatch { expected: usize, actual: usize },

    #[error("Value size mismatch: expected {expected} bytes, got {actual}")]
    ValueSizeMismatch { expected: usize, actual: usize },

    #[error("Hash table corrupted: {0}")]
    HashTableCorrupted(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter { name: String, value: String },

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

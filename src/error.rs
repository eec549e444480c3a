//! Error types for flashkvs
//!
//! Provides a unified error type for all operations. The variants follow the
//! status taxonomy of the storage core: `NotFound` is an expected outcome,
//! `DataLoss` means bytes on flash can no longer be trusted, and
//! `ResourceExhausted` covers every capacity limit (cache, buffer, partition).

use thiserror::Error;

/// Result type alias using KvsError
pub type Result<T> = std::result::Result<T, KvsError>;

/// Unified error type for flashkvs operations
#[derive(Debug, Error)]
pub enum KvsError {
    // -------------------------------------------------------------------------
    // Lookup Outcomes
    // -------------------------------------------------------------------------
    /// Nothing was written at this location, or the key is absent.
    #[error("Not found")]
    NotFound,

    /// A different key shares the requested key's hash.
    #[error("Key hash collision")]
    AlreadyExists,

    // -------------------------------------------------------------------------
    // Integrity Errors
    // -------------------------------------------------------------------------
    #[error("Data loss: {0}")]
    DataLoss(String),

    // -------------------------------------------------------------------------
    // Capacity Errors
    // -------------------------------------------------------------------------
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Short read: the value did not fit. The buffer holds the first `copied` bytes.
    #[error("Resource exhausted: buffer holds {copied} of {value_size} value bytes")]
    BufferTooSmall { copied: usize, value_size: usize },

    #[error("Out of range: {0}")]
    OutOfRange(String),

    // -------------------------------------------------------------------------
    // Caller Errors
    // -------------------------------------------------------------------------
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("Internal error: {0}")]
    Internal(String),

    // -------------------------------------------------------------------------
    // Device Errors
    // -------------------------------------------------------------------------
    #[error("Flash error: {0}")]
    Flash(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl KvsError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, KvsError::NotFound)
    }

    pub fn is_data_loss(&self) -> bool {
        matches!(self, KvsError::DataLoss(_))
    }

    /// True for both the general capacity error and the short-read variant.
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(
            self,
            KvsError::ResourceExhausted(_) | KvsError::BufferTooSmall { .. }
        )
    }
}

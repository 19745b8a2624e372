//! Error types for extentdb
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using ExtentError
pub type Result<T> = std::result::Result<T, ExtentError>;

/// Unified error type for extentdb operations
#[derive(Debug, Error)]
pub enum ExtentError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // WAL Errors
    // -------------------------------------------------------------------------
    #[error("WAL corruption detected: {0}")]
    WalCorruption(String),

    #[error("WAL write failed: {0}")]
    WalWrite(String),

    // -------------------------------------------------------------------------
    // Storage Errors
    // -------------------------------------------------------------------------
    #[error("Storage error: {0}")]
    Storage(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Allocation Errors
    // -------------------------------------------------------------------------
    /// Reservation refused: not enough unreserved free space
    #[error("Capacity exceeded: requested {requested} bytes, {available} available")]
    CapacityExceeded { requested: u64, available: u64 },

    /// Free bytes exist but not as runs of at least one allocation unit
    #[error("Fragmentation failure: wanted {wanted} bytes, only {allocated} allocatable")]
    FragmentationFailure { wanted: u64, allocated: u64 },

    /// Double free, or allocation over space that is not free. Never retried.
    #[error("Consistency violation: {0}")]
    ConsistencyViolation(String),

    // -------------------------------------------------------------------------
    // Catalog Errors
    // -------------------------------------------------------------------------
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Object already exists: {0}")]
    AlreadyExists(String),

    /// Malformed or truncated record, or a merge operand of the wrong shape
    #[error("Corrupt record: {0}")]
    CorruptRecord(String),

    /// Commit-level failure; the effect of the commit may be ambiguous
    #[error("Transaction failed: {0}")]
    TransactionFailure(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),

    // -------------------------------------------------------------------------
    // Concurrency Errors
    // -------------------------------------------------------------------------
    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
}

impl From<bincode::Error> for ExtentError {
    fn from(e: bincode::Error) -> Self {
        ExtentError::Serialization(e.to_string())
    }
}

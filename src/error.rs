/// Typed error handling for mushd
///
/// Bad caller input (unknown IDs, protected entities) is never an error here:
/// the world answers with empty results or `false`. These variants cover the
/// failures that callers genuinely have to handle.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for mushd operations
#[derive(Error, Debug)]
pub enum MushError {
    // ========================================
    // Parse Errors
    // ========================================

    #[error("Invalid ID '{0}': expected '@' followed by a decimal number")]
    InvalidId(String),

    // ========================================
    // Persistence Errors
    // ========================================

    #[error("Snapshot I/O failed for {path}: {source}")]
    SnapshotIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode world snapshot: {0}")]
    SnapshotEncode(#[source] serde_json::Error),

    #[error("Failed to decode world snapshot {path}: {source}")]
    SnapshotDecode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    // ========================================
    // Concurrency Errors
    // ========================================

    #[error("World store is no longer running")]
    WorldStopped,

    #[error("Session registry has been shut down")]
    RegistryHalted,

    #[error("Session {0} is closed")]
    SessionClosed(String),

    // ========================================
    // Configuration Errors
    // ========================================

    #[error("Invalid configuration for '{field}': {reason}")]
    ConfigError {
        field: String,
        reason: String,
    },

    // ========================================
    // IO Errors
    // ========================================

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl MushError {
    /// True for errors raised by the persistence layer
    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            MushError::SnapshotIo { .. }
                | MushError::SnapshotEncode(_)
                | MushError::SnapshotDecode { .. }
        )
    }
}

/// Result type alias for mushd operations
pub type Result<T> = std::result::Result<T, MushError>;

// ========================================
// Unit Tests
// ========================================

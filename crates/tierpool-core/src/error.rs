//! Error types for the tiering engine.
//!
//! The first group of variants is the migration fault taxonomy: each one has a
//! fixed recovery policy (requeue, retry with backoff, surface to the
//! operator). The remaining variants carry ambient failures from the state
//! store, the filesystem and external tools.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for tierpool.
#[derive(Debug, Error)]
pub enum TierError {
    // Migration fault taxonomy
    #[error("Drive {drive_id} is unreachable: {message}")]
    DriveUnreachable { drive_id: String, message: String },

    #[error("Drive {drive_id} is busy: {message}")]
    DriveBusy { drive_id: String, message: String },

    #[error("Path is locked by another migration: {path}")]
    PathLocked { path: String },

    #[error("Verification failed for {path}: expected {expected}, got {actual}")]
    VerificationFailed {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Source of {path} changed during migration: {message}")]
    SourceChanged { path: String, message: String },

    #[error("Capacity exceeded on drive {drive_id}: need {needed} bytes, {available} available")]
    CapacityExceeded {
        drive_id: String,
        needed: u64,
        available: u64,
    },

    #[error("Migration of {path} exhausted after {attempts} attempts: {last_error}")]
    MigrationExhausted {
        path: String,
        attempts: u32,
        last_error: String,
    },

    // Lookup errors
    #[error("Drive not found: {0}")]
    DriveNotFound(String),

    #[error("Migration task not found: {0}")]
    TaskNotFound(String),

    #[error("Inconsistent placement for {path}: {message}")]
    InconsistentPlacement { path: String, message: String },

    // Database errors
    #[error("Database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // External tools
    #[error("Command `{command}` failed: {message}")]
    Command { command: String, message: String },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    // Validation errors
    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Operation cancelled")]
    Cancelled,

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for tierpool operations.
pub type Result<T> = std::result::Result<T, TierError>;

impl From<std::io::Error> for TierError {
    fn from(err: std::io::Error) -> Self {
        TierError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for TierError {
    fn from(err: serde_json::Error) -> Self {
        TierError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<rusqlite::Error> for TierError {
    fn from(err: rusqlite::Error) -> Self {
        TierError::Database {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl TierError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        TierError::Io {
            message: format!("{}: {}", path.display(), err),
            path: Some(path),
            source: Some(err),
        }
    }

    /// True when the underlying IO error is "not found".
    pub fn is_not_found(&self) -> bool {
        match self {
            TierError::Io {
                source: Some(source),
                ..
            } => source.kind() == std::io::ErrorKind::NotFound,
            TierError::DriveNotFound(_) | TierError::TaskNotFound(_) => true,
            _ => false,
        }
    }

    /// Transient faults are recovered locally by requeueing or retrying.
    ///
    /// Integrity and exhaustion faults are never transient.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TierError::DriveUnreachable { .. }
                | TierError::PathLocked { .. }
                | TierError::CapacityExceeded { .. }
                | TierError::Io { .. }
                | TierError::Command { .. }
        )
    }

    /// Convert to a JSON-RPC error code for the admin surface.
    ///
    /// Custom error codes (application-defined, -32000 to -32099):
    /// - -32000: Transient drive or capacity fault
    /// - -32001: Drive or task not found
    /// - -32002: Drive busy / path locked
    /// - -32003: Integrity fault or exhausted migration
    /// - -32005: Validation or configuration error
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            TierError::DriveUnreachable { .. } | TierError::CapacityExceeded { .. } => -32000,

            TierError::DriveNotFound(_) | TierError::TaskNotFound(_) => -32001,

            TierError::DriveBusy { .. } | TierError::PathLocked { .. } => -32002,

            TierError::VerificationFailed { .. }
            | TierError::SourceChanged { .. }
            | TierError::MigrationExhausted { .. }
            | TierError::InconsistentPlacement { .. } => -32003,

            TierError::Validation { .. } | TierError::Config { .. } => -32005,

            _ => -32603,
        }
    }
}

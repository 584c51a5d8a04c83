//! Error types for the distributed file store.
//!
//! All fallible operations return [`Result`], an alias over [`DfsError`].
//!
//! # Error Categories
//!
//! - **Integrity**: checksum mismatches and on-disk corruption
//! - **Lookup**: missing files or chunks
//! - **Transport**: connection failures and closed peers
//! - **Protocol**: unexpected message kinds and oversized frames
//! - **Replication**: chunks that cannot be repaired
//! - **Configuration**: invalid settings
//!
//! # Example
//!
//! ```rust
//! use dfs::error::{DfsError, Result};
//!
//! fn chunk_name(filename: &str, sequence_no: u32) -> Result<String> {
//!     if filename.is_empty() {
//!         return Err(DfsError::InvalidArgument("filename cannot be empty".into()));
//!     }
//!     Ok(format!("{}-chunk{}", filename, sequence_no))
//! }
//!
//! fn should_try_next_replica(err: &DfsError) -> bool {
//!     err.is_replica_failure()
//! }
//! ```

use std::io;
use thiserror::Error;

/// Main error type for file store operations.
#[derive(Error, Debug)]
pub enum DfsError {
    // Integrity errors
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Data corruption: {0}")]
    DataCorruption(String),

    // Lookup errors
    #[error("Chunk not found: {0}")]
    ChunkNotFound(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Chunk unavailable on {node}: {reason}")]
    ChunkUnavailable { node: String, reason: String },

    // Transport errors
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    // Protocol errors
    #[error("Unexpected response: expected {expected}, got {got}")]
    UnexpectedResponse { expected: String, got: String },

    #[error("Frame too large: {size} bytes exceeds limit of {limit}")]
    FrameTooLarge { size: usize, limit: usize },

    // Client orchestration errors
    #[error(
        "Couldn't retrieve a good copy of chunk #{sequence_no} of {filename} from any of: {}",
        .tried.join(", ")
    )]
    NoReplicaReachable {
        filename: String,
        sequence_no: u32,
        tried: Vec<String>,
    },

    #[error("No storage nodes online")]
    NoStorageNodes,

    // Replication errors
    #[error("Unrecoverable chunk: {0}")]
    Unrecoverable(String),

    // Configuration errors
    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // External errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Fatal: {0}")]
    Fatal(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DfsError {
    /// Whether a client should fail over to the next replica after this error.
    ///
    /// Transport failures, corruption and missing chunks all mean "this copy
    /// is no good"; anything else is a bug or a local problem that another
    /// replica will not fix.
    pub fn is_replica_failure(&self) -> bool {
        matches!(
            self,
            DfsError::ChecksumMismatch { .. }
                | DfsError::DataCorruption(_)
                | DfsError::ChunkUnavailable { .. }
                | DfsError::ConnectionFailed(_)
                | DfsError::ConnectionClosed
                | DfsError::Io(_)
                | DfsError::Serialization(_)
                | DfsError::FrameTooLarge { .. }
        )
    }

    /// Whether this error indicates corrupted data rather than unavailability.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            DfsError::ChecksumMismatch { .. } | DfsError::DataCorruption(_)
        )
    }
}

impl From<bincode::Error> for DfsError {
    fn from(e: bincode::Error) -> Self {
        DfsError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for DfsError {
    fn from(e: serde_json::Error) -> Self {
        DfsError::Serialization(e.to_string())
    }
}

/// Result type alias for file store operations.
pub type Result<T> = std::result::Result<T, DfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replica_failure_classification() {
        assert!(DfsError::ConnectionClosed.is_replica_failure());
        assert!(DfsError::ChecksumMismatch {
            expected: "a".into(),
            actual: "b".into()
        }
        .is_replica_failure());
        assert!(!DfsError::NoStorageNodes.is_replica_failure());
        assert!(!DfsError::UnexpectedResponse {
            expected: "StoreChunk".into(),
            got: "Heartbeat".into()
        }
        .is_replica_failure());
    }

    #[test]
    fn test_corruption_is_distinct_from_unavailability() {
        let mismatch = DfsError::ChecksumMismatch {
            expected: "a".into(),
            actual: "b".into(),
        };
        assert!(mismatch.is_corruption());
        assert!(!DfsError::ConnectionFailed("refused".into()).is_corruption());
    }

    #[test]
    fn test_no_replica_message_names_nodes() {
        let err = DfsError::NoReplicaReachable {
            filename: "movie.mp4".into(),
            sequence_no: 3,
            tried: vec!["a:1".into(), "b:2".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("#3"));
        assert!(msg.contains("movie.mp4"));
        assert!(msg.contains("a:1, b:2"));
    }
}

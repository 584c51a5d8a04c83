//! Core type definitions for the distributed file store.
//!
//! # Key Types
//!
//! - [`ComponentAddress`]: `(host, port)` identity of any node
//! - [`Chunk`]: one fixed-position slice of a file with its checksum
//! - [`ChunkKey`]: `(filename, sequence_no)` identity used in placement tables
//! - [`ChunkLocation`] / [`FileLocations`]: where replicas of a file live
//!
//! # Examples
//!
//! ```rust
//! use dfs::types::{checksum, Chunk, ComponentAddress};
//!
//! let node: ComponentAddress = "10.0.0.5:7000".parse().unwrap();
//! assert_eq!(node.port, 7000);
//!
//! let data = b"hello";
//! let chunk = Chunk::new("greeting.txt", 0, data.len() as u64, checksum(data));
//! assert_eq!(chunk.checksum, "5d41402abc4b2a76b9719d911017c592");
//! ```

use crate::error::DfsError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Zero-based position of a chunk within its file.
pub type SequenceNo = u32;

/// Per-node chunk inventory: filename to the sequence numbers held.
pub type Inventory = BTreeMap<String, BTreeSet<SequenceNo>>;

/// Compute the content checksum (lowercase MD5 hex) of a chunk's bytes.
pub fn checksum(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// Network identity of a storage node or controller.
///
/// Equality, ordering and hashing consider `(host, port)` only, so the type
/// can key sets and maps directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentAddress {
    pub host: String,
    pub port: u16,
}

impl ComponentAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ComponentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ComponentAddress {
    type Err = DfsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| DfsError::InvalidArgument(format!("expected host:port, got '{}'", s)))?;
        if host.is_empty() {
            return Err(DfsError::InvalidArgument(format!("missing host in '{}'", s)));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| DfsError::InvalidArgument(format!("invalid port in '{}': {}", s, e)))?;
        Ok(Self::new(host, port))
    }
}

/// Identity of one chunk: `(filename, sequence_no)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkKey {
    pub filename: String,
    pub sequence_no: SequenceNo,
}

impl ChunkKey {
    pub fn new(filename: impl Into<String>, sequence_no: SequenceNo) -> Self {
        Self {
            filename: filename.into(),
            sequence_no,
        }
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.filename, self.sequence_no)
    }
}

/// One piece of one file.
///
/// Identity and ordering are `(filename, sequence_no)`; size, checksum and
/// the local path are attributes. `local_path` is only meaningful on the
/// machine holding the bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub filename: String,
    pub sequence_no: SequenceNo,
    pub size: u64,
    pub checksum: String,
    #[serde(skip)]
    pub local_path: Option<PathBuf>,
}

impl Chunk {
    pub fn new(
        filename: impl Into<String>,
        sequence_no: SequenceNo,
        size: u64,
        checksum: impl Into<String>,
    ) -> Self {
        Self {
            filename: filename.into(),
            sequence_no,
            size,
            checksum: checksum.into(),
            local_path: None,
        }
    }

    pub fn with_local_path(mut self, path: PathBuf) -> Self {
        self.local_path = Some(path);
        self
    }

    pub fn key(&self) -> ChunkKey {
        ChunkKey::new(self.filename.clone(), self.sequence_no)
    }

    /// Check `data` against this chunk's recorded checksum.
    pub fn verify(&self, data: &[u8]) -> Result<(), DfsError> {
        let actual = checksum(data);
        if actual != self.checksum {
            return Err(DfsError::ChecksumMismatch {
                expected: self.checksum.clone(),
                actual,
            });
        }
        Ok(())
    }
}

impl PartialEq for Chunk {
    fn eq(&self, other: &Self) -> bool {
        self.filename == other.filename && self.sequence_no == other.sequence_no
    }
}

impl Eq for Chunk {}

impl PartialOrd for Chunk {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Chunk {
    fn cmp(&self, other: &Self) -> Ordering {
        self.filename
            .cmp(&other.filename)
            .then(self.sequence_no.cmp(&other.sequence_no))
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{} ({} bytes, {})",
            self.filename, self.sequence_no, self.size, self.checksum
        )
    }
}

/// Replica placement of one chunk, replicas in the order they should be tried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkLocation {
    pub sequence_no: SequenceNo,
    pub nodes: Vec<ComponentAddress>,
}

/// Placement of every chunk of one file, ordered by sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLocations {
    pub filename: String,
    pub chunks: Vec<ChunkLocation>,
}

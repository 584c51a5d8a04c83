//! Upload placement.

use crate::error::{DfsError, Result};
use crate::types::ComponentAddress;
use rand::Rng;

/// Decides which node receives each chunk of an upload.
pub trait PlacementPolicy: Send + Sync {
    /// One node per chunk, in chunk order.
    fn place(&self, chunk_count: usize, nodes: &[ComponentAddress]) -> Result<Vec<ComponentAddress>>;
}

/// Cycle through the nodes from a starting offset.
///
/// Chunk 0 goes to the node after the start, so consecutive chunks land on
/// distinct nodes whenever more than one is online.
#[derive(Debug, Clone, Default)]
pub struct RoundRobinPlacement {
    start: Option<usize>,
}

impl RoundRobinPlacement {
    /// Random starting offset per upload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fixed starting offset.
    pub fn starting_at(start: usize) -> Self {
        Self { start: Some(start) }
    }
}

impl PlacementPolicy for RoundRobinPlacement {
    fn place(&self, chunk_count: usize, nodes: &[ComponentAddress]) -> Result<Vec<ComponentAddress>> {
        if nodes.is_empty() {
            return Err(DfsError::NoStorageNodes);
        }

        let start = self
            .start
            .unwrap_or_else(|| rand::thread_rng().gen_range(0..nodes.len()));

        Ok((0..chunk_count)
            .map(|i| nodes[(start + 1 + i) % nodes.len()].clone())
            .collect())
    }
}

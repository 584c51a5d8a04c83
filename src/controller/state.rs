//! Membership set and file table.
//!
//! Both structures live behind one lock and are only changed through the
//! composite operations below, so a reader never observes a node that is
//! out of the membership set but still listed as a replica holder.

use crate::types::{
    ChunkKey, ChunkLocation, ComponentAddress, FileLocations, Inventory, SequenceNo,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};

/// A node declared offline by [`ClusterState::evict_stale`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
    pub node: ComponentAddress,
    /// Time since the node's last heartbeat at eviction.
    pub silent_for: Duration,
    /// Chunks the node held that are now below the replication factor.
    pub under_replicated: Vec<ChunkKey>,
}

/// What the replication engine needs to place one more replica of a chunk.
#[derive(Debug, Clone)]
pub struct ReplicaView {
    /// Current holders, in address order.
    pub holders: Vec<ComponentAddress>,
    /// Online nodes not holding the chunk, with the number of chunks each holds.
    pub candidates: Vec<(ComponentAddress, usize)>,
}

#[derive(Debug, Default)]
struct ClusterInner {
    /// Online nodes and their last heartbeat.
    online: BTreeMap<ComponentAddress, Instant>,
    /// filename -> sequence number -> nodes believed to hold the chunk.
    files: BTreeMap<String, BTreeMap<SequenceNo, BTreeSet<ComponentAddress>>>,
}

impl ClusterInner {
    fn load_of(&self) -> HashMap<&ComponentAddress, usize> {
        let mut load: HashMap<&ComponentAddress, usize> = HashMap::new();
        for chunks in self.files.values() {
            for holders in chunks.values() {
                for node in holders {
                    *load.entry(node).or_default() += 1;
                }
            }
        }
        load
    }

    fn holders(&self, key: &ChunkKey) -> Option<&BTreeSet<ComponentAddress>> {
        self.files.get(&key.filename)?.get(&key.sequence_no)
    }
}

fn locations(filename: &str, chunks: &BTreeMap<SequenceNo, BTreeSet<ComponentAddress>>) -> FileLocations {
    FileLocations {
        filename: filename.to_string(),
        chunks: chunks
            .iter()
            .map(|(&sequence_no, holders)| ChunkLocation {
                sequence_no,
                nodes: holders.iter().cloned().collect(),
            })
            .collect(),
    }
}

/// Authoritative controller view of the cluster.
#[derive(Debug, Default)]
pub struct ClusterState {
    inner: RwLock<ClusterInner>,
}

impl ClusterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a heartbeat received now. See [`apply_heartbeat_at`](Self::apply_heartbeat_at).
    pub fn apply_heartbeat(&self, node: &ComponentAddress, inventory: &Inventory) -> bool {
        self.apply_heartbeat_at(node, inventory, Instant::now())
    }

    /// Mark `node` online as of `at` and add it as a holder of every chunk in
    /// its inventory.
    ///
    /// Additive only: chunks missing from the inventory keep their holders.
    /// Returns true if the node was not online before.
    pub fn apply_heartbeat_at(
        &self,
        node: &ComponentAddress,
        inventory: &Inventory,
        at: Instant,
    ) -> bool {
        let mut inner = self.inner.write();
        let joined = inner.online.insert(node.clone(), at).is_none();

        for (filename, sequence_nos) in inventory {
            let chunks = inner.files.entry(filename.clone()).or_default();
            for &sequence_no in sequence_nos {
                chunks.entry(sequence_no).or_default().insert(node.clone());
            }
        }

        joined
    }

    /// Declare offline every node whose last heartbeat is older than `max_age`
    /// at `now`, purging it from the file table.
    ///
    /// Staleness is checked and applied under one lock, so a heartbeat that
    /// lands mid-scan either keeps the node or arrives after the eviction.
    pub fn evict_stale(
        &self,
        max_age: Duration,
        now: Instant,
        replication_factor: usize,
    ) -> Vec<Eviction> {
        let mut inner = self.inner.write();

        let stale: Vec<(ComponentAddress, Duration)> = inner
            .online
            .iter()
            .filter_map(|(node, &last)| {
                let age = now.saturating_duration_since(last);
                (age > max_age).then(|| (node.clone(), age))
            })
            .collect();

        stale
            .into_iter()
            .map(|(node, silent_for)| {
                inner.online.remove(&node);
                let mut under_replicated = Vec::new();
                for (filename, chunks) in inner.files.iter_mut() {
                    for (&sequence_no, holders) in chunks.iter_mut() {
                        if holders.remove(&node) && holders.len() < replication_factor {
                            under_replicated.push(ChunkKey::new(filename.clone(), sequence_no));
                        }
                    }
                }
                Eviction {
                    node,
                    silent_for,
                    under_replicated,
                }
            })
            .collect()
    }

    /// Optimistically record `node` as a holder of `key`.
    pub fn record_replica(&self, key: &ChunkKey, node: &ComponentAddress) {
        self.inner
            .write()
            .files
            .entry(key.filename.clone())
            .or_default()
            .entry(key.sequence_no)
            .or_default()
            .insert(node.clone());
    }

    /// Holders and destination candidates for `key`, or `None` if the chunk
    /// is not in the file table.
    pub fn replica_view(&self, key: &ChunkKey) -> Option<ReplicaView> {
        let inner = self.inner.read();
        let holders = inner.holders(key)?;
        let load = inner.load_of();

        let candidates = inner
            .online
            .keys()
            .filter(|node| !holders.contains(*node))
            .map(|node| (node.clone(), load.get(node).copied().unwrap_or(0)))
            .collect();

        Some(ReplicaView {
            holders: holders.iter().cloned().collect(),
            candidates,
        })
    }

    /// Chunks with at least one holder but fewer than
    /// `min(replication_factor, online nodes)`, with that target count.
    pub fn under_replicated(&self, replication_factor: usize) -> Vec<(ChunkKey, usize)> {
        let inner = self.inner.read();
        let target = replication_factor.min(inner.online.len());

        inner
            .files
            .iter()
            .flat_map(|(filename, chunks)| {
                chunks.iter().filter_map(move |(&sequence_no, holders)| {
                    (!holders.is_empty() && holders.len() < target)
                        .then(|| (ChunkKey::new(filename.clone(), sequence_no), target))
                })
            })
            .collect()
    }

    pub fn is_online(&self, node: &ComponentAddress) -> bool {
        self.inner.read().online.contains_key(node)
    }

    /// Online nodes in address order.
    pub fn list_nodes(&self) -> Vec<ComponentAddress> {
        self.inner.read().online.keys().cloned().collect()
    }

    /// Placement of every known file.
    pub fn list_files(&self) -> Vec<FileLocations> {
        self.inner
            .read()
            .files
            .iter()
            .map(|(filename, chunks)| locations(filename, chunks))
            .collect()
    }

    /// Placement of one file, chunks ordered by sequence number.
    pub fn placement_of(&self, filename: &str) -> Option<FileLocations> {
        self.inner
            .read()
            .files
            .get(filename)
            .map(|chunks| locations(filename, chunks))
    }

    /// Nodes believed to hold `key`.
    pub fn holders(&self, key: &ChunkKey) -> BTreeSet<ComponentAddress> {
        self.inner.read().holders(key).cloned().unwrap_or_default()
    }
}

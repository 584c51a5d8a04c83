//! Whole-file upload and download.

use super::placement::{PlacementPolicy, RoundRobinPlacement};
use super::{fetch_chunk, store_chunk, ControllerClient};
use crate::chunking::{self, chunk_file_name, remove_local_copies, split_file};
use crate::config::ClientConfig;
use crate::error::{DfsError, Result};
use crate::protocol::DEFAULT_MAX_FRAME_SIZE;
use crate::types::{checksum, Chunk, ChunkLocation, ComponentAddress, SequenceNo};
use futures::future::join_all;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

const CHUNK_TRANSFER_TIMEOUT: Duration = Duration::from_secs(60);

/// Where an upload placed each chunk.
#[derive(Debug, Clone)]
pub struct UploadSummary {
    pub filename: String,
    pub bytes: u64,
    pub chunks: Vec<ChunkLocation>,
}

/// High-level client: splits, places and sends files, and fetches them back.
pub struct Client {
    controller: ControllerClient,
    config: ClientConfig,
    placement: Box<dyn PlacementPolicy>,
    max_frame_size: usize,
}

impl Client {
    pub fn new(controller: ControllerClient, config: ClientConfig) -> Self {
        Self::with_placement(controller, config, Box::new(RoundRobinPlacement::new()))
    }

    pub fn with_placement(
        controller: ControllerClient,
        config: ClientConfig,
        placement: Box<dyn PlacementPolicy>,
    ) -> Self {
        Self {
            controller,
            config,
            placement,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Largest chunk reply accepted on download.
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn controller(&self) -> &ControllerClient {
        &self.controller
    }

    /// Store `source` under `filename`.
    ///
    /// Each chunk goes to one node chosen by the placement policy; the
    /// controller learns about it from that node's next heartbeat and
    /// replicates it from there.
    pub async fn upload(&self, source: &Path, filename: &str) -> Result<UploadSummary> {
        chunking::validate_filename(filename)?;

        let nodes = self.controller.storage_nodes().await?;
        if nodes.is_empty() {
            return Err(DfsError::NoStorageNodes);
        }

        let chunks = split_file(source, filename, self.config.chunk_size, &self.config.chunks_dir)?;
        let placement = match self.placement.place(chunks.len(), &nodes) {
            Ok(p) => p,
            Err(e) => {
                remove_local_copies(&chunks);
                return Err(e);
            }
        };

        info!(filename, chunks = chunks.len(), nodes = nodes.len(), "Uploading file");

        let result = self.send_chunks(&chunks, &placement).await;
        remove_local_copies(&chunks);
        result?;

        Ok(UploadSummary {
            filename: filename.to_string(),
            bytes: chunks.iter().map(|c| c.size).sum(),
            chunks: chunks
                .iter()
                .zip(placement)
                .map(|(chunk, node)| ChunkLocation {
                    sequence_no: chunk.sequence_no,
                    nodes: vec![node],
                })
                .collect(),
        })
    }

    async fn send_chunks(&self, chunks: &[Chunk], placement: &[ComponentAddress]) -> Result<()> {
        for (chunk, node) in chunks.iter().zip(placement) {
            let path = chunk.local_path.as_ref().ok_or_else(|| {
                DfsError::Internal(format!("chunk {} has no local path", chunk.key()))
            })?;
            let data = fs::read(path)?;

            debug!(chunk = %chunk.key(), node = %node, bytes = data.len(), "Sending chunk");
            store_chunk(
                node,
                &chunk.filename,
                chunk.sequence_no,
                data,
                &chunk.checksum,
                CHUNK_TRANSFER_TIMEOUT,
            )
            .await?;
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Fetch `filename` into `dest`, returning the number of bytes written.
    ///
    /// Chunks are fetched concurrently. Each chunk tries its replicas in the
    /// order the controller listed them. `dest` is only written once every
    /// chunk has arrived intact.
    pub async fn download(&self, filename: &str, dest: &Path) -> Result<u64> {
        chunking::validate_filename(filename)?;

        let file = self.controller.locate(filename).await?;
        if file.chunks.is_empty() {
            return Err(DfsError::FileNotFound(filename.to_string()));
        }
        fs::create_dir_all(&self.config.chunks_dir)?;

        info!(filename, chunks = file.chunks.len(), "Downloading file");

        let permits = Arc::new(Semaphore::new(self.config.parallel_downloads.max(1)));
        let handles: Vec<_> = file
            .chunks
            .into_iter()
            .map(|location| {
                let permits = permits.clone();
                let filename = filename.to_string();
                let dir = self.config.chunks_dir.clone();
                let max_frame_size = self.max_frame_size;
                tokio::spawn(async move {
                    let _permit = permits
                        .acquire_owned()
                        .await
                        .map_err(|e| DfsError::Internal(e.to_string()))?;
                    fetch_with_failover(
                        &filename,
                        &location,
                        &dir,
                        CHUNK_TRANSFER_TIMEOUT,
                        max_frame_size,
                    )
                    .await
                })
            })
            .collect();

        let mut chunks = Vec::new();
        let mut failure = None;
        for joined in join_all(handles).await {
            match joined {
                Ok(Ok(chunk)) => chunks.push(chunk),
                Ok(Err(e)) => {
                    failure.get_or_insert(e);
                }
                Err(e) => {
                    failure.get_or_insert(DfsError::Internal(format!("download task failed: {}", e)));
                }
            }
        }

        if let Some(e) = failure {
            remove_local_copies(&chunks);
            return Err(e);
        }

        let written = chunking::reassemble(&chunks, dest);
        remove_local_copies(&chunks);
        let written = written?;

        info!(filename, bytes = written, dest = %dest.display(), "Download complete");
        Ok(written)
    }
}

/// Fetch one chunk into `dir`, trying `location.nodes` strictly in order.
///
/// Unreachable nodes, missing chunks and corrupt data move on to the next
/// replica. Any other error ends the attempt.
pub async fn fetch_with_failover(
    filename: &str,
    location: &ChunkLocation,
    dir: &Path,
    timeout: Duration,
    max_frame_size: usize,
) -> Result<Chunk> {
    let sequence_no = location.sequence_no;
    let mut tried = Vec::with_capacity(location.nodes.len());

    for node in &location.nodes {
        tried.push(node.to_string());
        match fetch_chunk(node, filename, sequence_no, timeout, max_frame_size).await {
            Ok(data) => return save_chunk(filename, sequence_no, &data, dir),
            Err(e) if e.is_corruption() => {
                warn!(filename, sequence_no, node = %node, error = %e, "Corrupt replica, trying next");
            }
            Err(e) if e.is_replica_failure() => {
                warn!(filename, sequence_no, node = %node, error = %e, "Replica failed, trying next");
            }
            Err(e) => return Err(e),
        }
    }

    Err(DfsError::NoReplicaReachable {
        filename: filename.to_string(),
        sequence_no,
        tried,
    })
}

fn save_chunk(filename: &str, sequence_no: SequenceNo, data: &[u8], dir: &Path) -> Result<Chunk> {
    let path: PathBuf = dir.join(chunk_file_name(filename, sequence_no));
    fs::write(&path, data)?;
    Ok(Chunk::new(filename, sequence_no, data.len() as u64, checksum(data)).with_local_path(path))
}

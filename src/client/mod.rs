//! Client library: controller queries, chunk transfers and file upload and
//! download.

mod placement;
mod transfer;

pub use placement::{PlacementPolicy, RoundRobinPlacement};
pub use transfer::{Client, UploadSummary};

use crate::error::{DfsError, Result};
use crate::protocol::{self, Message};
use crate::types::{checksum, ComponentAddress, FileLocations, Inventory, SequenceNo};
use std::fmt::Write as _;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// Default deadline for one request/response exchange.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

async fn with_timeout<T>(
    addr: &ComponentAddress,
    timeout: Duration,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| DfsError::ConnectionFailed(format!("{}: request timed out", addr)))?
}

/// Client for the controller's query interface.
#[derive(Debug, Clone)]
pub struct ControllerClient {
    addr: ComponentAddress,
    request_timeout: Duration,
}

impl ControllerClient {
    pub fn new(addr: ComponentAddress) -> Self {
        Self::with_timeout(addr, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(addr: ComponentAddress, request_timeout: Duration) -> Self {
        Self {
            addr,
            request_timeout,
        }
    }

    /// Create from a `host:port` string.
    pub fn from_addr(addr: &str) -> Result<Self> {
        Ok(Self::new(addr.parse()?))
    }

    pub fn addr(&self) -> &ComponentAddress {
        &self.addr
    }

    async fn call(&self, msg: Message) -> Result<Message> {
        with_timeout(&self.addr, self.request_timeout, protocol::request(&self.addr, &msg)).await
    }

    /// Online storage nodes.
    pub async fn storage_nodes(&self) -> Result<Vec<ComponentAddress>> {
        match self.call(Message::GetStorageNodesRequest).await? {
            Message::GetStorageNodesResponse { nodes } => Ok(nodes),
            other => Err(other.unexpected("GetStorageNodesResponse")),
        }
    }

    /// Every file with its chunk placement.
    pub async fn files(&self) -> Result<Vec<FileLocations>> {
        match self.call(Message::GetFilesRequest).await? {
            Message::GetFilesResponse { files } => Ok(files),
            other => Err(other.unexpected("GetFilesResponse")),
        }
    }

    /// Chunk placement of one file. Unknown files have no chunks.
    pub async fn locate(&self, filename: &str) -> Result<FileLocations> {
        let msg = Message::DownloadFile {
            filename: filename.to_string(),
        };
        match self.call(msg).await? {
            Message::DownloadFileResponse { file } => Ok(file),
            other => Err(other.unexpected("DownloadFileResponse")),
        }
    }

    /// Free space summed over the online storage nodes, in bytes.
    pub async fn free_space(&self) -> Result<u64> {
        match self.call(Message::GetFreeSpaceRequest).await? {
            Message::GetFreeSpaceResponse { free_space } => Ok(free_space),
            other => Err(other.unexpected("GetFreeSpaceResponse")),
        }
    }
}

/// Send one chunk to `node` and close the connection.
///
/// `checksum` is the one recorded when the chunk was cut, so the node can
/// detect bytes that changed since. Storage nodes do not acknowledge stores.
pub async fn store_chunk(
    node: &ComponentAddress,
    filename: &str,
    sequence_no: SequenceNo,
    data: Vec<u8>,
    checksum: &str,
    timeout: Duration,
) -> Result<()> {
    let msg = Message::StoreChunk {
        filename: filename.to_string(),
        sequence_no,
        data,
        checksum: checksum.to_string(),
    };
    with_timeout(node, timeout, async {
        let mut stream = protocol::connect(node).await?;
        protocol::write_message(&mut stream, &msg).await?;
        stream.shutdown().await?;
        Ok(())
    })
    .await
}

/// Fetch one chunk from `node`, verifying the received bytes.
///
/// Replies larger than `max_frame_size` are rejected.
pub async fn fetch_chunk(
    node: &ComponentAddress,
    filename: &str,
    sequence_no: SequenceNo,
    timeout: Duration,
    max_frame_size: usize,
) -> Result<Vec<u8>> {
    let request = Message::DownloadChunk {
        filename: filename.to_string(),
        sequence_no,
    };
    let reply = with_timeout(
        node,
        timeout,
        protocol::request_with_limit(node, &request, max_frame_size),
    )
    .await?;

    match reply {
        Message::StoreChunk {
            filename: got_name,
            sequence_no: got_seq,
            data,
            checksum: expected,
        } if got_name == filename && got_seq == sequence_no => {
            let actual = checksum(&data);
            if actual != expected {
                return Err(DfsError::ChecksumMismatch { expected, actual });
            }
            Ok(data)
        }
        Message::ChunkUnavailable { reason, .. } => Err(DfsError::ChunkUnavailable {
            node: node.to_string(),
            reason,
        }),
        other => Err(other.unexpected("StoreChunk")),
    }
}

/// Free space reported by one storage node, in bytes.
pub async fn node_free_space(node: &ComponentAddress) -> Result<u64> {
    let reply = with_timeout(
        node,
        DEFAULT_REQUEST_TIMEOUT,
        protocol::request(node, &Message::GetFreeSpaceRequest),
    )
    .await?;
    match reply {
        Message::GetFreeSpaceResponse { free_space } => Ok(free_space),
        other => Err(other.unexpected("GetFreeSpaceResponse")),
    }
}

/// Chunks held by one storage node.
pub async fn node_inventory(node: &ComponentAddress) -> Result<Inventory> {
    let reply = with_timeout(
        node,
        DEFAULT_REQUEST_TIMEOUT,
        protocol::request(node, &Message::GetStorageNodeFilesRequest),
    )
    .await?;
    match reply {
        Message::GetStorageNodeFilesResponse { inventory } => Ok(inventory),
        other => Err(other.unexpected("GetStorageNodeFilesResponse")),
    }
}

/// Host/port table of storage nodes.
pub fn format_nodes(nodes: &[ComponentAddress]) -> String {
    if nodes.is_empty() {
        return "No storage nodes found.\n".to_string();
    }

    let mut out = String::new();
    let _ = writeln!(out, "{:<40} {:>5}", "Host", "Port");
    let _ = writeln!(out, "{}", "-".repeat(46));
    for node in nodes {
        let _ = writeln!(out, "{:<40} {:>5}", node.host, node.port);
    }
    out
}

/// Every file with the nodes holding each chunk.
pub fn format_files(files: &[FileLocations]) -> String {
    let mut out = String::new();
    for file in files {
        let _ = writeln!(out, "Filename: {}", file.filename);
        for chunk in &file.chunks {
            let nodes: Vec<String> = chunk.nodes.iter().map(|n| n.to_string()).collect();
            let _ = writeln!(out, "    Chunk #{:02} at [{}]", chunk.sequence_no, nodes.join(", "));
        }
    }
    out
}

/// File names only.
pub fn format_file_names(files: &[FileLocations]) -> String {
    files.iter().map(|f| format!("{}\n", f.filename)).collect()
}

/// Free space in decimal and binary gigabytes.
pub fn format_free_space(bytes: u64) -> String {
    let gb = bytes as f64 / 1_000_000_000.0;
    let gib = bytes as f64 / (1u64 << 30) as f64;
    format!("Free space on DFS: {:.2} GB ({:.2} GiB)", gb, gib)
}

/// One storage node's inventory, one line per chunk.
pub fn format_inventory(inventory: &Inventory) -> String {
    let mut out = String::new();
    for (filename, sequence_nos) in inventory {
        for sequence_no in sequence_nos {
            let _ = writeln!(out, "{} chunk #{:02}", filename, sequence_no);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChunkLocation;

    #[test]
    fn test_format_nodes_table() {
        let out = format_nodes(&[ComponentAddress::new("node-a", 7001)]);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("Host"));
        assert!(lines[0].ends_with("Port"));
        assert!(lines[2].starts_with("node-a"));
        assert!(lines[2].ends_with("7001"));
    }

    #[test]
    fn test_format_nodes_empty() {
        assert_eq!(format_nodes(&[]), "No storage nodes found.\n");
    }

    #[test]
    fn test_format_files() {
        let files = vec![FileLocations {
            filename: "movie.mp4".into(),
            chunks: vec![ChunkLocation {
                sequence_no: 3,
                nodes: vec![ComponentAddress::new("a", 1), ComponentAddress::new("b", 2)],
            }],
        }];
        assert_eq!(
            format_files(&files),
            "Filename: movie.mp4\n    Chunk #03 at [a:1, b:2]\n"
        );
        assert_eq!(format_file_names(&files), "movie.mp4\n");
    }

    #[test]
    fn test_format_free_space() {
        assert_eq!(
            format_free_space(2 * (1u64 << 30)),
            "Free space on DFS: 2.15 GB (2.00 GiB)"
        );
        assert_eq!(format_free_space(0), "Free space on DFS: 0.00 GB (0.00 GiB)");
    }

    #[test]
    fn test_format_inventory() {
        let mut inventory = Inventory::new();
        inventory.entry("f".into()).or_default().extend([0, 1]);
        assert_eq!(format_inventory(&inventory), "f chunk #00\nf chunk #01\n");
    }
}

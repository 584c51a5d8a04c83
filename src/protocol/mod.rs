//! Wire protocol shared by the controller, storage nodes and clients.
//!
//! Every exchange is a sequence of [`Message`] values over a persistent TCP
//! stream, each framed as a 4-byte big-endian length followed by the
//! bincode-encoded message (see [`framing`]).

pub mod framing;

pub use framing::{read_message, write_message, DEFAULT_MAX_FRAME_SIZE};

use crate::error::{DfsError, Result};
use crate::types::{ComponentAddress, FileLocations, Inventory, SequenceNo};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;

/// All message kinds understood by the system.
///
/// Dispatchers match on this exhaustively, so a new kind has to be handled
/// (or explicitly rejected) everywhere a message is received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Storage node to controller: liveness plus the node's full inventory.
    Heartbeat {
        node: ComponentAddress,
        inventory: Inventory,
    },
    GetStorageNodesRequest,
    GetStorageNodesResponse {
        nodes: Vec<ComponentAddress>,
    },
    GetFilesRequest,
    GetFilesResponse {
        files: Vec<FileLocations>,
    },
    DownloadFile {
        filename: String,
    },
    DownloadFileResponse {
        file: FileLocations,
    },
    /// Chunk bytes plus the checksum computed when the chunk was created.
    /// Used for uploads, peer forwarding and as the reply to `DownloadChunk`.
    StoreChunk {
        filename: String,
        sequence_no: SequenceNo,
        data: Vec<u8>,
        checksum: String,
    },
    DownloadChunk {
        filename: String,
        sequence_no: SequenceNo,
    },
    /// Reply to `DownloadChunk` when the node cannot serve a good copy.
    ChunkUnavailable {
        filename: String,
        sequence_no: SequenceNo,
        reason: String,
    },
    /// Controller to storage node: push a chunk to `target`.
    OrderSendChunk {
        target: ComponentAddress,
        filename: String,
        sequence_no: SequenceNo,
    },
    GetFreeSpaceRequest,
    GetFreeSpaceResponse {
        free_space: u64,
    },
    GetStorageNodeFilesRequest,
    GetStorageNodeFilesResponse {
        inventory: Inventory,
    },
}

impl Message {
    /// Short name of the message kind, for logs and protocol errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Heartbeat { .. } => "Heartbeat",
            Message::GetStorageNodesRequest => "GetStorageNodesRequest",
            Message::GetStorageNodesResponse { .. } => "GetStorageNodesResponse",
            Message::GetFilesRequest => "GetFilesRequest",
            Message::GetFilesResponse { .. } => "GetFilesResponse",
            Message::DownloadFile { .. } => "DownloadFile",
            Message::DownloadFileResponse { .. } => "DownloadFileResponse",
            Message::StoreChunk { .. } => "StoreChunk",
            Message::DownloadChunk { .. } => "DownloadChunk",
            Message::ChunkUnavailable { .. } => "ChunkUnavailable",
            Message::OrderSendChunk { .. } => "OrderSendChunk",
            Message::GetFreeSpaceRequest => "GetFreeSpaceRequest",
            Message::GetFreeSpaceResponse { .. } => "GetFreeSpaceResponse",
            Message::GetStorageNodeFilesRequest => "GetStorageNodeFilesRequest",
            Message::GetStorageNodeFilesResponse { .. } => "GetStorageNodeFilesResponse",
        }
    }

    /// Build the protocol error for receiving `self` when `expected` was due.
    pub fn unexpected(&self, expected: &str) -> DfsError {
        DfsError::UnexpectedResponse {
            expected: expected.to_string(),
            got: self.kind().to_string(),
        }
    }
}

/// Open a connection to `addr`.
pub async fn connect(addr: &ComponentAddress) -> Result<TcpStream> {
    let stream = TcpStream::connect((addr.host.as_str(), addr.port))
        .await
        .map_err(|e| DfsError::ConnectionFailed(format!("{}: {}", addr, e)))?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Send one request on a fresh connection and wait for the single reply.
pub async fn request(addr: &ComponentAddress, msg: &Message) -> Result<Message> {
    request_with_limit(addr, msg, DEFAULT_MAX_FRAME_SIZE).await
}

/// Like [`request`], rejecting replies larger than `max_frame_size`.
pub async fn request_with_limit(
    addr: &ComponentAddress,
    msg: &Message,
    max_frame_size: usize,
) -> Result<Message> {
    let mut stream = connect(addr).await?;
    write_message(&mut stream, msg).await?;
    read_message(&mut stream, max_frame_size)
        .await?
        .ok_or(DfsError::ConnectionClosed)
}

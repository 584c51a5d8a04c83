//! Peer-to-peer chunk forwarding.

use super::ChunkStore;
use crate::error::{DfsError, Result};
use crate::protocol::{self, write_message, Message};
use crate::types::{ComponentAddress, SequenceNo};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::debug;

/// Pushes local chunks to other storage nodes.
///
/// Owned by a single message-processing task, so the connection cache needs
/// no locking. Connections are kept per target and reused; a broken one is
/// dropped and replaced by a fresh connection on the same call.
pub struct Forwarder {
    store: Arc<ChunkStore>,
    connections: HashMap<ComponentAddress, TcpStream>,
}

impl Forwarder {
    pub fn new(store: Arc<ChunkStore>) -> Self {
        Self {
            store,
            connections: HashMap::new(),
        }
    }

    /// Send a verified copy of a local chunk to `target` as a `StoreChunk`.
    pub async fn forward(
        &mut self,
        filename: &str,
        sequence_no: SequenceNo,
        target: &ComponentAddress,
    ) -> Result<()> {
        let (chunk, data) = self.store.retrieve(filename, sequence_no)?;
        let msg = Message::StoreChunk {
            filename: chunk.filename,
            sequence_no: chunk.sequence_no,
            data,
            checksum: chunk.checksum,
        };

        if let Some(stream) = self.connections.get_mut(target) {
            match write_message(stream, &msg).await {
                Ok(()) => {
                    debug!(filename, sequence_no, peer = %target, "Forwarded chunk");
                    return Ok(());
                }
                Err(e) => {
                    debug!(peer = %target, error = %e, "Cached connection broken, reconnecting");
                    self.connections.remove(target);
                }
            }
        }

        let mut stream = protocol::connect(target).await?;
        write_message(&mut stream, &msg)
            .await
            .map_err(|e| DfsError::ConnectionFailed(format!("{}: {}", target, e)))?;
        self.connections.insert(target.clone(), stream);

        debug!(filename, sequence_no, peer = %target, "Forwarded chunk");
        Ok(())
    }

    /// Number of cached peer connections.
    pub fn cached_connections(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{read_message, DEFAULT_MAX_FRAME_SIZE};
    use crate::types::checksum;
    use tempfile::tempdir;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_forward_reuses_connection() {
        let dir = tempdir().unwrap();
        let store = Arc::new(ChunkStore::open(dir.path()).unwrap());
        store.store("f", 0, b"zero", &checksum(b"zero")).unwrap();
        store.store("f", 1, b"one", &checksum(b"one")).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = ComponentAddress::new("127.0.0.1", listener.local_addr().unwrap().port());

        let mut forwarder = Forwarder::new(store);
        forwarder.forward("f", 0, &target).await.unwrap();
        forwarder.forward("f", 1, &target).await.unwrap();
        assert_eq!(forwarder.cached_connections(), 1);

        // Both chunks arrive on the single accepted connection, in order.
        let (mut stream, _) = listener.accept().await.unwrap();
        for (seq, bytes) in [(0u32, &b"zero"[..]), (1, &b"one"[..])] {
            match read_message(&mut stream, DEFAULT_MAX_FRAME_SIZE).await.unwrap() {
                Some(Message::StoreChunk {
                    filename,
                    sequence_no,
                    data,
                    checksum: sum,
                }) => {
                    assert_eq!(filename, "f");
                    assert_eq!(sequence_no, seq);
                    assert_eq!(data, bytes);
                    assert_eq!(sum, checksum(bytes));
                }
                other => panic!("unexpected message: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_forward_missing_chunk() {
        let dir = tempdir().unwrap();
        let store = Arc::new(ChunkStore::open(dir.path()).unwrap());
        let mut forwarder = Forwarder::new(store);

        let target = ComponentAddress::new("127.0.0.1", 1);
        let err = forwarder.forward("nope", 0, &target).await.unwrap_err();
        assert!(matches!(err, DfsError::ChunkNotFound(_)));
        assert_eq!(forwarder.cached_connections(), 0);
    }

    #[tokio::test]
    async fn test_forward_unreachable_target() {
        let dir = tempdir().unwrap();
        let store = Arc::new(ChunkStore::open(dir.path()).unwrap());
        store.store("f", 0, b"data", &checksum(b"data")).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut forwarder = Forwarder::new(store);
        let err = forwarder
            .forward("f", 0, &ComponentAddress::new("127.0.0.1", port))
            .await
            .unwrap_err();
        assert!(matches!(err, DfsError::ConnectionFailed(_)));
    }
}

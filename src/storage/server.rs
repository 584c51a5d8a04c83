//! Storage node connection handling.
//!
//! One [`MessageProcessor`] task per connection, whether the connection was
//! accepted from a client or peer, or opened by this node to the controller.

use super::{ChunkStore, Forwarder};
use crate::config::ConnectionConfig;
use crate::connection::{ConnectionHealth, Verdict};
use crate::error::{DfsError, Result};
use crate::protocol::{read_message, write_message, Message};
use crate::shutdown::ShutdownCoordinator;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Write half of a connection shared between tasks.
pub type SharedWriter<W> = Arc<Mutex<W>>;

/// Accepts connections and spawns a processor for each.
#[derive(Clone)]
pub struct StorageNodeServer {
    store: Arc<ChunkStore>,
    connection: ConnectionConfig,
    shutdown: ShutdownCoordinator,
}

impl StorageNodeServer {
    pub fn new(
        store: Arc<ChunkStore>,
        connection: ConnectionConfig,
        shutdown: ShutdownCoordinator,
    ) -> Self {
        Self {
            store,
            connection,
            shutdown,
        }
    }

    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }

    /// Run the accept loop until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!(addr = %listener.local_addr()?, "Storage node listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };
                    debug!(peer = %addr, "New connection");
                    let _ = stream.set_nodelay(true);
                    let (reader, writer) = stream.into_split();
                    self.spawn_processor(reader, Arc::new(Mutex::new(writer)), addr.to_string());
                }
                _ = self.shutdown.wait_for_shutdown() => {
                    info!("Storage node accept loop stopping");
                    return Ok(());
                }
            }
        }
    }

    /// Process messages from `reader` on a new task, replying through `writer`.
    ///
    /// An `Abort` verdict takes the whole node down.
    pub fn spawn_processor<R, W>(
        &self,
        reader: R,
        writer: SharedWriter<W>,
        peer: String,
    ) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let processor = MessageProcessor::new(self.store.clone(), &self.connection);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            match processor.run(reader, writer, &peer).await {
                Verdict::Abort => {
                    shutdown.abort(format!("too many errors on connection from {}", peer))
                }
                Verdict::Close | Verdict::Continue => {
                    debug!(peer = %peer, "Connection closed");
                }
            }
        })
    }
}

/// Handles the messages of one connection.
pub struct MessageProcessor {
    store: Arc<ChunkStore>,
    forwarder: Forwarder,
    health: ConnectionHealth,
    max_frame_size: usize,
}

impl MessageProcessor {
    pub fn new(store: Arc<ChunkStore>, connection: &ConnectionConfig) -> Self {
        Self {
            forwarder: Forwarder::new(store.clone()),
            store,
            health: ConnectionHealth::new(connection),
            max_frame_size: connection.max_frame_size,
        }
    }

    /// Read and dispatch messages until the connection ends.
    pub async fn run<R, W>(mut self, mut reader: R, writer: SharedWriter<W>, peer: &str) -> Verdict
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            let msg = match read_message(&mut reader, self.max_frame_size).await {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    self.health.close();
                    return Verdict::Close;
                }
                Err(DfsError::Serialization(e)) => {
                    trace!(peer, error = %e, "Bad frame");
                    if self.health.record_bad_read() == Verdict::Close {
                        warn!(peer, "Too many bad frames, closing connection");
                        return Verdict::Close;
                    }
                    continue;
                }
                Err(e) => {
                    debug!(peer, error = %e, "Read failed, closing connection");
                    self.health.close();
                    return Verdict::Close;
                }
            };

            self.health.record_message();
            trace!(peer, kind = msg.kind(), "Incoming message");

            match self.handle(msg, peer).await {
                Ok(Some(reply)) => {
                    let mut w = writer.lock().await;
                    if let Err(e) = write_message(&mut *w, &reply).await {
                        debug!(peer, error = %e, "Write failed, closing connection");
                        self.health.close();
                        return Verdict::Close;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!(peer, error = %e, "Local failure while handling message");
                    if self.health.record_error() == Verdict::Abort {
                        error!(peer, errors = self.health.errors(), "Too many errors, giving up");
                        return Verdict::Abort;
                    }
                }
            }
        }
    }

    /// Dispatch one message, returning the reply if the kind has one.
    ///
    /// Only local I/O failures come back as `Err`; problems with the request
    /// or with a peer are logged here.
    async fn handle(&mut self, msg: Message, peer: &str) -> Result<Option<Message>> {
        match msg {
            Message::StoreChunk {
                filename,
                sequence_no,
                data,
                checksum,
            } => {
                debug!(peer, filename = %filename, sequence_no, "Storing chunk");
                match self.store.store(&filename, sequence_no, &data, &checksum) {
                    Ok(_) => Ok(None),
                    Err(e @ DfsError::Io(_)) => Err(e),
                    Err(e) => {
                        warn!(peer, filename = %filename, sequence_no, error = %e, "Chunk not stored");
                        Ok(None)
                    }
                }
            }

            Message::DownloadChunk {
                filename,
                sequence_no,
            } => match self.store.retrieve(&filename, sequence_no) {
                Ok((chunk, data)) => Ok(Some(Message::StoreChunk {
                    filename: chunk.filename,
                    sequence_no: chunk.sequence_no,
                    data,
                    checksum: chunk.checksum,
                })),
                Err(e) => {
                    warn!(peer, filename = %filename, sequence_no, error = %e, "Cannot serve chunk");
                    Ok(Some(Message::ChunkUnavailable {
                        filename,
                        sequence_no,
                        reason: e.to_string(),
                    }))
                }
            },

            Message::OrderSendChunk {
                target,
                filename,
                sequence_no,
            } => {
                debug!(filename = %filename, sequence_no, destination = %target, "Ordered to forward chunk");
                if let Err(e) = self.forwarder.forward(&filename, sequence_no, &target).await {
                    warn!(
                        filename = %filename,
                        sequence_no,
                        destination = %target,
                        error = %e,
                        "Forwarding failed"
                    );
                }
                Ok(None)
            }

            Message::GetFreeSpaceRequest => Ok(Some(Message::GetFreeSpaceResponse {
                free_space: self.store.free_space()?,
            })),

            Message::GetStorageNodeFilesRequest => Ok(Some(Message::GetStorageNodeFilesResponse {
                inventory: self.store.inventory(),
            })),

            unsupported @ (Message::Heartbeat { .. }
            | Message::GetStorageNodesRequest
            | Message::GetStorageNodesResponse { .. }
            | Message::GetFilesRequest
            | Message::GetFilesResponse { .. }
            | Message::DownloadFile { .. }
            | Message::DownloadFileResponse { .. }
            | Message::ChunkUnavailable { .. }
            | Message::GetFreeSpaceResponse { .. }
            | Message::GetStorageNodeFilesResponse { .. }) => {
                warn!(peer, kind = unsupported.kind(), "Ignoring message not handled by storage nodes");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::checksum;
    use tempfile::tempdir;
    use tokio::io::{duplex, split, AsyncWriteExt};

    fn processor(dir: &std::path::Path) -> (Arc<ChunkStore>, MessageProcessor) {
        let store = Arc::new(ChunkStore::open(dir).unwrap());
        let processor = MessageProcessor::new(store.clone(), &ConnectionConfig::default());
        (store, processor)
    }

    #[tokio::test]
    async fn test_store_then_download_over_one_connection() {
        let dir = tempdir().unwrap();
        let (store, processor) = processor(dir.path());

        let (client, server) = duplex(1024 * 1024);
        let (server_read, server_write) = split(server);
        let task = tokio::spawn(async move {
            processor
                .run(server_read, Arc::new(Mutex::new(server_write)), "test")
                .await
        });

        let (mut client_read, mut client_write) = split(client);
        let data = b"chunk bytes".to_vec();
        let store_msg = Message::StoreChunk {
            filename: "f".into(),
            sequence_no: 0,
            data: data.clone(),
            checksum: checksum(&data),
        };
        write_message(&mut client_write, &store_msg).await.unwrap();
        write_message(
            &mut client_write,
            &Message::DownloadChunk {
                filename: "f".into(),
                sequence_no: 0,
            },
        )
        .await
        .unwrap();

        let reply = read_message(&mut client_read, 1024 * 1024).await.unwrap();
        assert_eq!(reply, Some(store_msg));
        assert!(store.contains("f", 0));

        drop(client_write);
        drop(client_read);
        assert_eq!(task.await.unwrap(), Verdict::Close);
    }

    #[tokio::test]
    async fn test_missing_chunk_gets_unavailable_reply() {
        let dir = tempdir().unwrap();
        let (_store, processor) = processor(dir.path());

        let (client, server) = duplex(64 * 1024);
        let (server_read, server_write) = split(server);
        tokio::spawn(async move {
            processor
                .run(server_read, Arc::new(Mutex::new(server_write)), "test")
                .await
        });

        let (mut client_read, mut client_write) = split(client);
        write_message(
            &mut client_write,
            &Message::DownloadChunk {
                filename: "ghost".into(),
                sequence_no: 3,
            },
        )
        .await
        .unwrap();

        match read_message(&mut client_read, 64 * 1024).await.unwrap() {
            Some(Message::ChunkUnavailable {
                filename,
                sequence_no,
                ..
            }) => {
                assert_eq!(filename, "ghost");
                assert_eq!(sequence_no, 3);
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_inventory_request() {
        let dir = tempdir().unwrap();
        let (store, processor) = processor(dir.path());
        store.store("x", 1, b"1", &checksum(b"1")).unwrap();

        let (client, server) = duplex(64 * 1024);
        let (server_read, server_write) = split(server);
        tokio::spawn(async move {
            processor
                .run(server_read, Arc::new(Mutex::new(server_write)), "test")
                .await
        });

        let (mut client_read, mut client_write) = split(client);
        write_message(&mut client_write, &Message::GetStorageNodeFilesRequest)
            .await
            .unwrap();

        match read_message(&mut client_read, 64 * 1024).await.unwrap() {
            Some(Message::GetStorageNodeFilesResponse { inventory }) => {
                assert_eq!(inventory, store.inventory());
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_garbage_closes_after_threshold() {
        let dir = tempdir().unwrap();
        let store = Arc::new(ChunkStore::open(dir.path()).unwrap());
        let config = ConnectionConfig {
            max_bad_reads: 3,
            ..Default::default()
        };
        let processor = MessageProcessor::new(store, &config);

        let (mut client, server) = duplex(64 * 1024);
        let (server_read, server_write) = split(server);
        let task = tokio::spawn(async move {
            processor
                .run(server_read, Arc::new(Mutex::new(server_write)), "test")
                .await
        });

        for _ in 0..3 {
            client.write_all(&0u32.to_be_bytes()).await.unwrap();
        }

        let verdict = tokio::time::timeout(std::time::Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(verdict, Verdict::Close);
    }
}

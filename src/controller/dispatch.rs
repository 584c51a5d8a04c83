//! Controller connection handling.
//!
//! Storage nodes keep one long-lived connection: heartbeats flow in and
//! replication orders flow out on the same socket. Clients open a connection
//! per request.

use super::replication::{OrderQueues, OrderReceiver};
use super::state::ClusterState;
use crate::config::ConnectionConfig;
use crate::connection::{ConnectionHealth, Verdict};
use crate::error::DfsError;
use crate::observability;
use crate::protocol::{self, read_message, write_message, Message};
use crate::storage::SharedWriter;
use crate::types::{ComponentAddress, FileLocations};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

/// Per-node deadline when aggregating free space.
const FREE_SPACE_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Handles controller connections.
#[derive(Clone)]
pub struct Dispatcher {
    state: Arc<ClusterState>,
    queues: Arc<OrderQueues>,
    connection: ConnectionConfig,
}

/// State tied to one connection.
#[derive(Default)]
struct Session {
    /// Set once this connection has claimed a node's order queue. Dropping it
    /// stops the order sender.
    orders_closed: Option<oneshot::Sender<()>>,
}

impl Session {
    /// No order sender is running for this connection, either because none
    /// was started or because its queue was dropped on eviction.
    fn needs_order_sender(&self) -> bool {
        self.orders_closed.as_ref().map_or(true, |tx| tx.is_closed())
    }
}

impl Dispatcher {
    pub fn new(state: Arc<ClusterState>, queues: Arc<OrderQueues>, connection: ConnectionConfig) -> Self {
        Self {
            state,
            queues,
            connection,
        }
    }

    /// Read and dispatch messages until the connection ends.
    ///
    /// The controller keeps no local state that can fail, so a connection
    /// only ever closes; it never brings the process down.
    pub async fn run<R, W>(&self, mut reader: R, writer: SharedWriter<W>, peer: &str)
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut health = ConnectionHealth::new(&self.connection);
        let mut session = Session::default();

        loop {
            let msg = match read_message(&mut reader, self.connection.max_frame_size).await {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    health.close();
                    return;
                }
                Err(DfsError::Serialization(e)) => {
                    trace!(peer, error = %e, "Bad frame");
                    if health.record_bad_read() == Verdict::Close {
                        warn!(peer, "Too many bad frames, closing connection");
                        return;
                    }
                    continue;
                }
                Err(e) => {
                    debug!(peer, error = %e, "Read failed, closing connection");
                    health.close();
                    return;
                }
            };

            health.record_message();
            trace!(peer, kind = msg.kind(), "Incoming message");

            if let Some(reply) = self.handle(msg, peer, &mut session, &writer).await {
                let mut w = writer.lock().await;
                if let Err(e) = write_message(&mut *w, &reply).await {
                    debug!(peer, error = %e, "Write failed, closing connection");
                    health.close();
                    return;
                }
            }
        }
    }

    async fn handle<W>(
        &self,
        msg: Message,
        peer: &str,
        session: &mut Session,
        writer: &SharedWriter<W>,
    ) -> Option<Message>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        match msg {
            Message::Heartbeat { node, inventory } => {
                observability::record_heartbeat_received();
                if self.state.apply_heartbeat(&node, &inventory) {
                    info!(node = %node, chunks = inventory.values().map(|s| s.len()).sum::<usize>(), "Storage node online");
                    observability::set_online_nodes(self.state.list_nodes().len());
                }
                if session.needs_order_sender() {
                    if let Some(rx) = self.queues.take_receiver(&node) {
                        let (closed_tx, closed_rx) = oneshot::channel();
                        session.orders_closed = Some(closed_tx);
                        tokio::spawn(send_orders(
                            self.queues.clone(),
                            node,
                            rx,
                            writer.clone(),
                            closed_rx,
                        ));
                    }
                }
                None
            }

            Message::GetStorageNodesRequest => Some(Message::GetStorageNodesResponse {
                nodes: self.state.list_nodes(),
            }),

            Message::GetFilesRequest => Some(Message::GetFilesResponse {
                files: self.state.list_files(),
            }),

            Message::DownloadFile { filename } => {
                let file = self
                    .state
                    .placement_of(&filename)
                    .unwrap_or_else(|| FileLocations {
                        filename,
                        chunks: Vec::new(),
                    });
                Some(Message::DownloadFileResponse { file })
            }

            Message::GetFreeSpaceRequest => Some(Message::GetFreeSpaceResponse {
                free_space: self.aggregate_free_space().await,
            }),

            unsupported @ (Message::GetStorageNodesResponse { .. }
            | Message::GetFilesResponse { .. }
            | Message::DownloadFileResponse { .. }
            | Message::StoreChunk { .. }
            | Message::DownloadChunk { .. }
            | Message::ChunkUnavailable { .. }
            | Message::OrderSendChunk { .. }
            | Message::GetFreeSpaceResponse { .. }
            | Message::GetStorageNodeFilesRequest
            | Message::GetStorageNodeFilesResponse { .. }) => {
                warn!(peer, kind = unsupported.kind(), "Ignoring message not handled by the controller");
                None
            }
        }
    }

    /// Sum of the free space reported by every online node.
    ///
    /// Nodes that fail to answer are left out of the total.
    async fn aggregate_free_space(&self) -> u64 {
        let nodes = self.state.list_nodes();
        let answers = join_all(nodes.iter().map(|node| async move {
            let reply = tokio::time::timeout(
                FREE_SPACE_QUERY_TIMEOUT,
                protocol::request(node, &Message::GetFreeSpaceRequest),
            )
            .await
            .map_err(|_| DfsError::ConnectionFailed(format!("{}: timed out", node)))
            .and_then(|r| r);

            match reply {
                Ok(Message::GetFreeSpaceResponse { free_space }) => Some(free_space),
                Ok(other) => {
                    warn!(node = %node, error = %other.unexpected("GetFreeSpaceResponse"), "Bad free space reply");
                    None
                }
                Err(e) => {
                    warn!(node = %node, error = %e, "Free space query failed");
                    None
                }
            }
        }))
        .await;

        answers.into_iter().flatten().sum()
    }
}

/// Write queued orders for `node` to its connection until the connection's
/// inbound side ends, then hand the queue back.
async fn send_orders<W>(
    queues: Arc<OrderQueues>,
    node: ComponentAddress,
    mut rx: OrderReceiver,
    writer: SharedWriter<W>,
    mut closed: oneshot::Receiver<()>,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    debug!(node = %node, "Order sender attached");

    loop {
        tokio::select! {
            order = rx.recv() => {
                let Some(order) = order else { break };
                let mut w = writer.lock().await;
                if let Err(e) = write_message(&mut *w, &order).await {
                    warn!(node = %node, kind = order.kind(), error = %e, "Order not delivered");
                    break;
                }
                trace!(node = %node, kind = order.kind(), "Order delivered");
            }
            _ = &mut closed => break,
        }
    }

    queues.restore_receiver(&node, rx);
    debug!(node = %node, "Order sender detached");
}

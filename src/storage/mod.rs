//! Storage node: chunk persistence, peer forwarding and heartbeats.

mod chunk_store;
mod forward;
mod heartbeat;
mod server;

pub use chunk_store::ChunkStore;
pub use forward::Forwarder;
pub use heartbeat::HeartbeatReporter;
pub use server::{MessageProcessor, SharedWriter, StorageNodeServer};

use crate::config::DfsConfig;
use crate::error::{DfsError, Result};
use crate::shutdown::ShutdownCoordinator;
use crate::types::ComponentAddress;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Run a storage node until `shutdown` fires.
///
/// `listener` must already be bound to the node's advertised port.
pub async fn run_storage_node(
    config: &DfsConfig,
    listener: TcpListener,
    shutdown: ShutdownCoordinator,
) -> Result<()> {
    let store = Arc::new(ChunkStore::open(&config.storage.chunks_dir)?);
    let controller: ComponentAddress = config.storage.controller_addr.parse()?;
    let node = config.storage.advertise_address();

    info!(node = %node, chunks = store.chunk_count(), "Starting storage node");

    let server = StorageNodeServer::new(store, config.connection.clone(), shutdown.clone());
    let reporter = HeartbeatReporter::new(
        node,
        controller,
        config.storage.heartbeat_interval,
        server.clone(),
    );
    let reporter_handle = tokio::spawn(reporter.run(shutdown.subscribe()));

    let served = server.serve(listener).await;

    shutdown.shutdown();
    if let Err(e) = reporter_handle.await {
        error!(error = %e, "Heartbeat reporter task failed");
    }

    served?;
    match shutdown.abort_reason() {
        Some(reason) => Err(DfsError::Fatal(reason)),
        None => Ok(()),
    }
}

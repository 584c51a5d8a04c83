//! Periodic liveness and inventory reports to the controller.

use super::server::{SharedWriter, StorageNodeServer};
use crate::observability;
use crate::protocol::{self, write_message, Message};
use crate::types::ComponentAddress;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Live link to the controller.
///
/// Heartbeats go out on the write half; the read half is served by a regular
/// message processor so that forwarding orders from the controller arrive on
/// the same connection.
struct ControllerLink {
    writer: SharedWriter<OwnedWriteHalf>,
    processor: JoinHandle<()>,
}

/// Sends this node's full inventory to the controller every period.
///
/// Delivery is fire-and-forget: a failed send drops the link and the next
/// period reconnects and reports again.
pub struct HeartbeatReporter {
    node: ComponentAddress,
    controller: ComponentAddress,
    interval: Duration,
    server: StorageNodeServer,
}

impl HeartbeatReporter {
    pub fn new(
        node: ComponentAddress,
        controller: ComponentAddress,
        interval: Duration,
        server: StorageNodeServer,
    ) -> Self {
        Self {
            node,
            controller,
            interval,
            server,
        }
    }

    /// Build the heartbeat for the current inventory.
    pub fn heartbeat(&self) -> Message {
        Message::Heartbeat {
            node: self.node.clone(),
            inventory: self.server.store().inventory(),
        }
    }

    /// Run the reporter as a background task.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.interval);
        let mut link: Option<ControllerLink> = None;

        info!(node = %self.node, controller = %self.controller, "Heartbeat reporter starting");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if link.as_ref().is_some_and(|l| l.processor.is_finished()) {
                        debug!(controller = %self.controller, "Controller closed the link");
                        link = None;
                    }

                    if link.is_none() {
                        link = self.connect().await;
                    }

                    if let Some(active) = &link {
                        if !self.send(active).await {
                            if let Some(dead) = link.take() {
                                dead.processor.abort();
                            }
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Heartbeat reporter shutting down");
                    if let Some(active) = link.take() {
                        active.processor.abort();
                    }
                    break;
                }
            }
        }
    }

    async fn connect(&self) -> Option<ControllerLink> {
        match protocol::connect(&self.controller).await {
            Ok(stream) => {
                info!(controller = %self.controller, "Connected to controller");
                let (reader, writer) = stream.into_split();
                let writer = Arc::new(Mutex::new(writer));
                let processor =
                    self.server
                        .spawn_processor(reader, writer.clone(), self.controller.to_string());
                Some(ControllerLink { writer, processor })
            }
            Err(e) => {
                warn!(controller = %self.controller, error = %e, "Controller unreachable");
                None
            }
        }
    }

    async fn send(&self, link: &ControllerLink) -> bool {
        let heartbeat = self.heartbeat();
        let mut writer = link.writer.lock().await;
        match write_message(&mut *writer, &heartbeat).await {
            Ok(()) => {
                observability::record_heartbeat_sent();
                debug!(node = %self.node, "Heartbeat sent");
                true
            }
            Err(e) => {
                warn!(controller = %self.controller, error = %e, "Heartbeat failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::protocol::{read_message, DEFAULT_MAX_FRAME_SIZE};
    use crate::shutdown::ShutdownCoordinator;
    use crate::storage::ChunkStore;
    use crate::types::checksum;
    use tempfile::tempdir;
    use tokio::net::TcpListener;

    fn server(dir: &std::path::Path) -> StorageNodeServer {
        let store = Arc::new(ChunkStore::open(dir).unwrap());
        StorageNodeServer::new(store, ConnectionConfig::default(), ShutdownCoordinator::new())
    }

    #[test]
    fn test_heartbeat_carries_full_inventory() {
        let dir = tempdir().unwrap();
        let server = server(dir.path());
        server.store().store("a", 0, b"x", &checksum(b"x")).unwrap();
        server.store().store("a", 2, b"y", &checksum(b"y")).unwrap();
        server.store().store("b", 1, b"z", &checksum(b"z")).unwrap();

        let node = ComponentAddress::new("10.0.0.1", 7001);
        let controller = ComponentAddress::new("127.0.0.1", 7000);
        let reporter = HeartbeatReporter::new(
            node.clone(),
            controller,
            Duration::from_secs(1),
            server,
        );

        match reporter.heartbeat() {
            Message::Heartbeat {
                node: sender,
                inventory,
            } => {
                assert_eq!(sender, node);
                assert_eq!(inventory.len(), 2);
                assert_eq!(inventory["a"].iter().copied().collect::<Vec<_>>(), vec![0, 2]);
                assert_eq!(inventory["b"].iter().copied().collect::<Vec<_>>(), vec![1]);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reporter_sends_periodically() {
        let dir = tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let controller = ComponentAddress::new("127.0.0.1", listener.local_addr().unwrap().port());
        let node = ComponentAddress::new("127.0.0.1", 7001);

        let reporter = HeartbeatReporter::new(
            node.clone(),
            controller,
            Duration::from_millis(20),
            server(dir.path()),
        );
        let shutdown = ShutdownCoordinator::new();
        let handle = tokio::spawn(reporter.run(shutdown.subscribe()));

        // Several heartbeats arrive on one connection.
        let (mut stream, _) = listener.accept().await.unwrap();
        for _ in 0..3 {
            match read_message(&mut stream, DEFAULT_MAX_FRAME_SIZE).await.unwrap() {
                Some(Message::Heartbeat { node: sender, inventory }) => {
                    assert_eq!(sender, node);
                    assert!(inventory.is_empty());
                }
                other => panic!("unexpected message: {:?}", other),
            }
        }

        shutdown.shutdown();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}

//! Detects silent storage nodes and triggers re-replication.

use super::replication::{RepairReport, ReplicationEngine};
use super::state::{ClusterState, Eviction};
use crate::observability;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// One node taken offline by a monitor pass.
#[derive(Debug, Clone)]
pub struct OfflineNode {
    pub eviction: Eviction,
    pub repair: RepairReport,
}

/// Heartbeat-based failure detector.
pub struct HeartbeatMonitor {
    state: Arc<ClusterState>,
    engine: Arc<ReplicationEngine>,
    replication_factor: usize,
    check_interval: Duration,
    max_heartbeat_age: Duration,
}

impl HeartbeatMonitor {
    pub fn new(
        state: Arc<ClusterState>,
        engine: Arc<ReplicationEngine>,
        replication_factor: usize,
        check_interval: Duration,
        max_heartbeat_age: Duration,
    ) -> Self {
        Self {
            state,
            engine,
            replication_factor,
            check_interval,
            max_heartbeat_age,
        }
    }

    /// Run one pass at `now`.
    ///
    /// Stale nodes are removed from membership and from every holder set
    /// before any repair order is planned.
    pub fn check_at(&self, now: Instant) -> Vec<OfflineNode> {
        let evictions = self
            .state
            .evict_stale(self.max_heartbeat_age, now, self.replication_factor);

        if evictions.is_empty() {
            return Vec::new();
        }
        observability::set_online_nodes(self.state.list_nodes().len());

        evictions
            .into_iter()
            .map(|eviction| {
                warn!(
                    node = %eviction.node,
                    silent_ms = eviction.silent_for.as_millis() as u64,
                    under_replicated = eviction.under_replicated.len(),
                    "Storage node offline"
                );
                observability::record_node_evicted();
                self.engine.discard_orders(&eviction.node);

                let repair = self.engine.repair(&eviction.under_replicated);
                OfflineNode { eviction, repair }
            })
            .collect()
    }

    pub fn check(&self) -> Vec<OfflineNode> {
        self.check_at(Instant::now())
    }

    /// Run the monitor as a background task.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.check_interval);

        info!(
            check_interval_ms = self.check_interval.as_millis() as u64,
            max_heartbeat_age_ms = self.max_heartbeat_age.as_millis() as u64,
            "Heartbeat monitor starting"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let offline = self.check();
                    if !offline.is_empty() {
                        debug!(count = offline.len(), "Monitor pass took nodes offline");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Heartbeat monitor shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::replication::OrderQueues;
    use crate::protocol::Message;
    use crate::types::{ChunkKey, ComponentAddress, Inventory};

    fn node(port: u16) -> ComponentAddress {
        ComponentAddress::new("127.0.0.1", port)
    }

    fn monitor(factor: usize) -> (Arc<ClusterState>, Arc<OrderQueues>, HeartbeatMonitor) {
        let state = Arc::new(ClusterState::new());
        let queues = Arc::new(OrderQueues::new());
        let engine = Arc::new(ReplicationEngine::new(state.clone(), queues.clone(), factor));
        let monitor = HeartbeatMonitor::new(
            state.clone(),
            engine,
            factor,
            Duration::from_millis(100),
            Duration::from_secs(5),
        );
        (state, queues, monitor)
    }

    #[test]
    fn test_silent_node_evicted_once() {
        let (state, _queues, monitor) = monitor(2);
        let start = Instant::now();
        state.apply_heartbeat_at(&node(1), &Inventory::new(), start);

        assert!(monitor.check_at(start + Duration::from_secs(4)).is_empty());

        let offline = monitor.check_at(start + Duration::from_secs(6));
        assert_eq!(offline.len(), 1);
        assert_eq!(offline[0].eviction.node, node(1));

        assert!(monitor.check_at(start + Duration::from_secs(7)).is_empty());
    }

    #[test]
    fn test_failure_queues_order_for_survivor() {
        let (state, queues, monitor) = monitor(2);
        let start = Instant::now();
        let mut inv = Inventory::new();
        inv.entry("f".to_string()).or_default().insert(0);

        state.apply_heartbeat_at(&node(1), &inv, start);
        state.apply_heartbeat_at(&node(2), &inv, start + Duration::from_secs(4));
        state.apply_heartbeat_at(&node(3), &Inventory::new(), start + Duration::from_secs(4));

        let offline = monitor.check_at(start + Duration::from_secs(6));
        assert_eq!(offline.len(), 1);
        assert_eq!(offline[0].repair.orders.len(), 1);

        let mut rx = queues.take_receiver(&node(2)).unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            Message::OrderSendChunk {
                target: node(3),
                filename: "f".into(),
                sequence_no: 0,
            }
        );
        assert!(rx.try_recv().is_err());

        let holders = state.holders(&ChunkKey::new("f", 0));
        assert!(!holders.contains(&node(1)));
        assert!(holders.contains(&node(3)));
    }

    #[test]
    fn test_eviction_discards_orders_for_offline_node() {
        let (state, queues, monitor) = monitor(2);
        let start = Instant::now();
        state.apply_heartbeat_at(&node(1), &Inventory::new(), start);
        queues.enqueue(
            &node(1),
            Message::OrderSendChunk {
                target: node(2),
                filename: "f".into(),
                sequence_no: 0,
            },
        );

        assert_eq!(monitor.check_at(start + Duration::from_secs(6)).len(), 1);

        // A node that rejoins starts from an empty queue.
        let mut rx = queues.take_receiver(&node(1)).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (_state, _queues, monitor) = monitor(1);
        let (tx, rx) = broadcast::channel(1);

        let handle = tokio::spawn(monitor.run(rx));
        tx.send(()).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(result.is_ok());
    }
}

//! Re-replication of under-replicated chunks.
//!
//! The controller never moves chunk bytes itself. For each missing replica it
//! picks a surviving holder as source and an online non-holder as
//! destination, then queues an `OrderSendChunk` for the source node. The new
//! holder is recorded immediately. Heartbeats only ever add holders, so if
//! the transfer fails the destination stays listed until it is itself evicted;
//! clients skip it through replica failover.

use super::state::{ClusterState, ReplicaView};
use crate::observability;
use crate::protocol::Message;
use crate::types::{ChunkKey, ComponentAddress};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

struct NodeQueue {
    tx: mpsc::UnboundedSender<Message>,
    rx: Option<OrderReceiver>,
    generation: u64,
}

impl NodeQueue {
    fn new(generation: u64) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Some(OrderReceiver { generation, rx }),
            generation,
        }
    }
}

/// Receiving end of one node's order queue.
///
/// Tagged with the queue it came from, so a receiver outliving its queue is
/// never handed back to a newer one.
#[derive(Debug)]
pub struct OrderReceiver {
    generation: u64,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl Deref for OrderReceiver {
    type Target = mpsc::UnboundedReceiver<Message>;

    fn deref(&self) -> &Self::Target {
        &self.rx
    }
}

impl DerefMut for OrderReceiver {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.rx
    }
}

/// Outbound orders per storage node.
///
/// Orders for a node accumulate until a connection from that node claims
/// the receiver, and survive across reconnects. Evicting the node drops its
/// queue.
#[derive(Default)]
pub struct OrderQueues {
    queues: Mutex<HashMap<ComponentAddress, NodeQueue>>,
    next_generation: AtomicU64,
}

impl OrderQueues {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue<'a>(
        &self,
        queues: &'a mut HashMap<ComponentAddress, NodeQueue>,
        node: &ComponentAddress,
    ) -> &'a mut NodeQueue {
        queues
            .entry(node.clone())
            .or_insert_with(|| NodeQueue::new(self.next_generation.fetch_add(1, Ordering::Relaxed)))
    }

    pub fn enqueue(&self, node: &ComponentAddress, msg: Message) {
        let mut queues = self.queues.lock();
        // The receiver half is always owned by the map or a sender task.
        let _ = self.queue(&mut queues, node).tx.send(msg);
    }

    /// Claim the receiving end for `node`. Only one consumer at a time.
    pub fn take_receiver(&self, node: &ComponentAddress) -> Option<OrderReceiver> {
        let mut queues = self.queues.lock();
        self.queue(&mut queues, node).rx.take()
    }

    /// Drop `node`'s queue and any orders still pending in it.
    ///
    /// A consumer attached to the dropped queue sees the channel close.
    pub fn remove(&self, node: &ComponentAddress) -> usize {
        match self.queues.lock().remove(node) {
            Some(NodeQueue { rx: Some(mut rx), .. }) => {
                let mut dropped = 0;
                while rx.try_recv().is_ok() {
                    dropped += 1;
                }
                dropped
            }
            _ => 0,
        }
    }

    /// Hand the receiver back once its consumer is gone. Receivers of a
    /// queue that has since been dropped are discarded.
    pub fn restore_receiver(&self, node: &ComponentAddress, rx: OrderReceiver) {
        if let Some(queue) = self.queues.lock().get_mut(node) {
            if queue.generation == rx.generation {
                queue.rx = Some(rx);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnrecoverableReason {
    /// No node holds the chunk any more.
    NoSource,
    /// Every online node already holds the chunk.
    NoDestination,
}

impl UnrecoverableReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnrecoverableReason::NoSource => "no_source",
            UnrecoverableReason::NoDestination => "no_destination",
        }
    }
}

impl fmt::Display for UnrecoverableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnrecoverableReason::NoSource => write!(f, "no surviving replica"),
            UnrecoverableReason::NoDestination => write!(f, "no eligible destination node"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnrecoverableChunk {
    pub key: ChunkKey,
    pub reason: UnrecoverableReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationOrder {
    pub key: ChunkKey,
    pub source: ComponentAddress,
    pub destination: ComponentAddress,
}

/// Outcome of one repair pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RepairReport {
    pub orders: Vec<ReplicationOrder>,
    pub unrecoverable: Vec<UnrecoverableChunk>,
}

impl RepairReport {
    pub fn is_empty(&self) -> bool {
        self.orders.is_empty() && self.unrecoverable.is_empty()
    }
}

/// Least-loaded candidate, ties broken by address.
fn choose_destination(view: &ReplicaView) -> Option<&ComponentAddress> {
    view.candidates
        .iter()
        .min_by(|(a, load_a), (b, load_b)| load_a.cmp(load_b).then_with(|| a.cmp(b)))
        .map(|(node, _)| node)
}

/// Plans replica copies and queues the forwarding orders.
pub struct ReplicationEngine {
    state: Arc<ClusterState>,
    queues: Arc<OrderQueues>,
    replication_factor: usize,
    /// Serializes planning so concurrent passes never choose the same
    /// destination twice for one chunk.
    planning: Mutex<()>,
}

impl ReplicationEngine {
    pub fn new(state: Arc<ClusterState>, queues: Arc<OrderQueues>, replication_factor: usize) -> Self {
        Self {
            state,
            queues,
            replication_factor,
            planning: Mutex::new(()),
        }
    }

    /// Forget orders addressed to a node that went offline.
    pub fn discard_orders(&self, node: &ComponentAddress) {
        let dropped = self.queues.remove(node);
        if dropped > 0 {
            warn!(node = %node, dropped, "Discarded orders for offline node");
        }
    }

    /// Restore the given chunks to the full replication factor.
    pub fn repair(&self, chunks: &[ChunkKey]) -> RepairReport {
        let _planning = self.planning.lock();
        let mut report = RepairReport::default();
        for key in chunks {
            self.replicate(key, self.replication_factor, &mut report);
        }
        report
    }

    /// Top up every chunk that has a holder but fewer than
    /// `min(replication_factor, online nodes)` of them.
    pub fn sweep(&self) -> RepairReport {
        let _planning = self.planning.lock();
        let mut report = RepairReport::default();
        for (key, target) in self.state.under_replicated(self.replication_factor) {
            self.replicate(&key, target, &mut report);
        }
        report
    }

    fn replicate(&self, key: &ChunkKey, target: usize, report: &mut RepairReport) {
        for _ in 0..target {
            let Some(view) = self.state.replica_view(key) else {
                return;
            };
            if view.holders.len() >= target {
                return;
            }

            let Some(source) = view.holders.first() else {
                self.unrecoverable(key, UnrecoverableReason::NoSource, report);
                return;
            };
            let Some(destination) = choose_destination(&view) else {
                self.unrecoverable(key, UnrecoverableReason::NoDestination, report);
                return;
            };

            self.queues.enqueue(
                source,
                Message::OrderSendChunk {
                    target: destination.clone(),
                    filename: key.filename.clone(),
                    sequence_no: key.sequence_no,
                },
            );
            self.state.record_replica(key, destination);
            observability::record_replication_order();

            info!(
                chunk = %key,
                source = %source,
                destination = %destination,
                "Queued replication order"
            );
            report.orders.push(ReplicationOrder {
                key: key.clone(),
                source: source.clone(),
                destination: destination.clone(),
            });
        }
    }

    fn unrecoverable(&self, key: &ChunkKey, reason: UnrecoverableReason, report: &mut RepairReport) {
        error!(chunk = %key, reason = %reason, "Chunk cannot be re-replicated");
        observability::record_unrecoverable_chunk(reason.as_str());
        report.unrecoverable.push(UnrecoverableChunk {
            key: key.clone(),
            reason,
        });
    }

    /// Sweep periodically until shutdown.
    pub async fn run(self: Arc<Self>, period: Duration, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(period);
        info!(period_ms = period.as_millis() as u64, "Replication sweep starting");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.sweep();
                    if !report.is_empty() {
                        debug!(
                            orders = report.orders.len(),
                            unrecoverable = report.unrecoverable.len(),
                            "Replication sweep finished"
                        );
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Replication sweep shutting down");
                    break;
                }
            }
        }
    }
}

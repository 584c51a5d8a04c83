//! Controller: membership, placement and replication management.

mod dispatch;
mod monitor;
mod replication;
mod state;

pub use dispatch::Dispatcher;
pub use monitor::{HeartbeatMonitor, OfflineNode};
pub use replication::{
    OrderQueues, OrderReceiver, RepairReport, ReplicationEngine, ReplicationOrder,
    UnrecoverableChunk, UnrecoverableReason,
};
pub use state::{ClusterState, Eviction, ReplicaView};

use crate::config::DfsConfig;
use crate::error::{DfsError, Result};
use crate::shutdown::ShutdownCoordinator;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Controller service and its background workers.
pub struct Controller {
    state: Arc<ClusterState>,
    queues: Arc<OrderQueues>,
    engine: Arc<ReplicationEngine>,
    dispatcher: Dispatcher,
    config: DfsConfig,
    shutdown: ShutdownCoordinator,
}

impl Controller {
    pub fn new(config: &DfsConfig, shutdown: ShutdownCoordinator) -> Self {
        let state = Arc::new(ClusterState::new());
        let queues = Arc::new(OrderQueues::new());
        let engine = Arc::new(ReplicationEngine::new(
            state.clone(),
            queues.clone(),
            config.controller.replication_factor,
        ));
        let dispatcher = Dispatcher::new(state.clone(), queues.clone(), config.connection.clone());

        Self {
            state,
            queues,
            engine,
            dispatcher,
            config: config.clone(),
            shutdown,
        }
    }

    pub fn state(&self) -> &Arc<ClusterState> {
        &self.state
    }

    pub fn queues(&self) -> &Arc<OrderQueues> {
        &self.queues
    }

    /// Run the monitor, the replication sweep and the accept loop until
    /// shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let settings = &self.config.controller;
        info!(
            addr = %listener.local_addr()?,
            replication_factor = settings.replication_factor,
            "Controller listening"
        );

        let monitor = HeartbeatMonitor::new(
            self.state.clone(),
            self.engine.clone(),
            settings.replication_factor,
            settings.heartbeat_check_interval,
            settings.max_heartbeat_age,
        );
        let monitor_handle = tokio::spawn(monitor.run(self.shutdown.subscribe()));
        let sweep_handle = tokio::spawn(
            self.engine
                .clone()
                .run(settings.replication_interval, self.shutdown.subscribe()),
        );

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
                    let dispatcher = self.dispatcher.clone();
                    tokio::spawn(async move {
                        let peer = addr.to_string();
                        dispatcher.run(reader, Arc::new(Mutex::new(writer)), &peer).await;
                        debug!(peer = %peer, "Connection closed");
                    });
                }
                _ = self.shutdown.wait_for_shutdown() => {
                    info!("Controller accept loop stopping");
                    break;
                }
            }
        }

        for (name, handle) in [("monitor", monitor_handle), ("sweep", sweep_handle)] {
            if let Err(e) = handle.await {
                error!(task = name, error = %e, "Controller task failed");
            }
        }
        Ok(())
    }
}

/// Run a controller until `shutdown` fires.
pub async fn run_controller(
    config: &DfsConfig,
    listener: TcpListener,
    shutdown: ShutdownCoordinator,
) -> Result<()> {
    let controller = Controller::new(config, shutdown.clone());
    controller.serve(listener).await?;

    match shutdown.abort_reason() {
        Some(reason) => Err(DfsError::Fatal(reason)),
        None => Ok(()),
    }
}

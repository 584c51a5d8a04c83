//! dfs - a distributed file store.
//!
//! Files are split into fixed-size chunks spread over storage nodes. A
//! single controller tracks which nodes are online (from their heartbeats)
//! and which chunks each holds, and re-replicates chunks when a node goes
//! silent. Clients ask the controller where chunks live and move the bytes
//! directly to and from storage nodes.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────────────────────┐
//!   client ──────▶│ controller                   │
//!     │   queries │  membership | file table     │
//!     │           │  monitor | replication       │
//!     │           └──────▲───────────────┬───────┘
//!     │        heartbeats│               │forwarding orders
//!     │           ┌──────┴───────────────▼───────┐
//!     └──────────▶│ storage nodes                │
//!   chunk bytes   │  chunk store | forwarder     │
//!                 └──────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use dfs::config::DfsConfig;
//! use dfs::Role;
//!
//! #[tokio::main]
//! async fn main() -> dfs::Result<()> {
//!     let config = DfsConfig::development();
//!     dfs::run(config, Role::Controller).await
//! }
//! ```

pub mod chunking;
pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod controller;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod shutdown;
pub mod storage;
pub mod types;

// Re-exports
pub use controller::run_controller;
pub use error::{DfsError, Result};
pub use storage::run_storage_node;
pub use types::*;

use config::DfsConfig;
use shutdown::{ShutdownCoordinator, SignalHandler};
use tokio::net::TcpListener;
use tracing::{error, info};

/// Which service a process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Controller,
    StorageNode,
}

/// Run one service until SIGINT/SIGTERM or a fatal error.
///
/// Logging must already be initialized.
pub async fn run(config: DfsConfig, role: Role) -> Result<()> {
    config.validate()?;

    let bind_addr = match role {
        Role::Controller => config.controller.bind_addr,
        Role::StorageNode => config.storage.bind_addr,
    };
    let listener = TcpListener::bind(bind_addr).await?;

    let coordinator = ShutdownCoordinator::new();

    let metrics_handle = if config.observability.metrics_enabled {
        info!(addr = %config.observability.metrics_addr, "Starting metrics server");
        let obs_config = config.observability.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = observability::run_metrics_server(obs_config).await {
                error!(error = %e, "Metrics server error");
            }
        }))
    } else {
        None
    };

    let signal_coordinator = coordinator.clone();
    tokio::spawn(async move {
        SignalHandler::new(signal_coordinator).run().await;
    });

    let result = match role {
        Role::Controller => run_controller(&config, listener, coordinator.clone()).await,
        Role::StorageNode => run_storage_node(&config, listener, coordinator.clone()).await,
    };
    coordinator.shutdown();

    if let Some(handle) = metrics_handle {
        if !handle.is_finished() {
            info!("Stopping metrics server");
            handle.abort();
        }
    }

    info!(role = ?role, "Shutdown complete");
    result
}

//! Command-line interface.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

/// dfs - a chunked, replicated file store.
#[derive(Parser)]
#[command(name = "dfs")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "DFS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "DFS_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long, env = "DFS_JSON_LOGS")]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Run the controller
    Controller {
        /// Address to listen on
        #[arg(long, env = "DFS_CONTROLLER_BIND")]
        bind: Option<SocketAddr>,

        /// Target number of replicas per chunk
        #[arg(long)]
        replication_factor: Option<usize>,

        /// Serve Prometheus metrics on this address
        #[arg(long)]
        metrics_addr: Option<SocketAddr>,
    },

    /// Run a storage node
    StorageNode {
        /// Address to listen on
        #[arg(long, env = "DFS_STORAGE_BIND")]
        bind: Option<SocketAddr>,

        /// Host name announced to the controller
        #[arg(long, env = "DFS_ADVERTISE_HOST")]
        advertise_host: Option<String>,

        /// Controller address (host:port)
        #[arg(long, env = "DFS_CONTROLLER")]
        controller: Option<String>,

        /// Directory holding chunk files
        #[arg(long)]
        chunks_dir: Option<PathBuf>,

        /// Serve Prometheus metrics on this address
        #[arg(long)]
        metrics_addr: Option<SocketAddr>,
    },

    /// Talk to a running cluster
    Client {
        /// Controller address (host:port)
        #[arg(short = 'a', long, env = "DFS_CONTROLLER", default_value = "127.0.0.1:7000")]
        controller: String,

        #[command(subcommand)]
        command: ClientCommands,
    },

    /// Show version information
    Version,
}

/// Client subcommands.
#[derive(Subcommand)]
pub enum ClientCommands {
    /// List online storage nodes
    ListStorageNodes,

    /// List files with the nodes holding each chunk
    ListFiles,

    /// List file names
    Ls,

    /// Upload a local file
    UploadFile {
        /// File to upload
        path: PathBuf,

        /// Name to store it under (defaults to the file name)
        #[arg(long)]
        name: Option<String>,
    },

    /// Download a file
    DownloadFile {
        /// Stored file name
        name: String,

        /// Output path (defaults to the file name in the current directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show free space across the cluster
    FreeSpace,

    /// List the chunks held by one storage node
    NodeFiles {
        /// Storage node address (host:port)
        node: String,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

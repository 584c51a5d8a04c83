//! dfs - Main entry point.

use anyhow::Context;
use dfs::cli::{ClientCommands, Cli, Commands};
use dfs::client::{self, Client, ControllerClient};
use dfs::config::DfsConfig;
use dfs::types::ComponentAddress;
use dfs::{observability, Role};
use std::path::{Path, PathBuf};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse_args();

    let level_given = cli.log_level.is_some() || cli.config.is_some();
    let mut config = match &cli.config {
        Some(path) => DfsConfig::from_file(path)?,
        None => DfsConfig::default(),
    };
    if let Some(level) = cli.log_level {
        config.observability.log_level = level;
    }
    if cli.json_logs {
        config.observability.json_logs = true;
    }

    match cli.command {
        Commands::Controller {
            bind,
            replication_factor,
            metrics_addr,
        } => {
            if let Some(bind) = bind {
                config.controller.bind_addr = bind;
            }
            if let Some(factor) = replication_factor {
                config.controller.replication_factor = factor;
            }
            if let Some(addr) = metrics_addr {
                config.observability.metrics_enabled = true;
                config.observability.metrics_addr = addr;
            }

            observability::init(&config.observability)?;
            dfs::run(config, Role::Controller).await?;
        }

        Commands::StorageNode {
            bind,
            advertise_host,
            controller,
            chunks_dir,
            metrics_addr,
        } => {
            if let Some(bind) = bind {
                config.storage.bind_addr = bind;
            }
            if let Some(host) = advertise_host {
                config.storage.advertise_host = host;
            }
            if let Some(controller) = controller {
                config.storage.controller_addr = controller;
            }
            if let Some(dir) = chunks_dir {
                config.storage.chunks_dir = dir;
            }
            if let Some(addr) = metrics_addr {
                config.observability.metrics_enabled = true;
                config.observability.metrics_addr = addr;
            }

            observability::init(&config.observability)?;
            dfs::run(config, Role::StorageNode).await?;
        }

        Commands::Client {
            controller,
            command,
        } => {
            // Client output goes to stdout; keep logs quiet unless asked.
            if !level_given {
                config.observability.log_level = "warn".to_string();
            }
            observability::init(&config.observability)?;
            config.validate()?;

            let controller = ControllerClient::from_addr(&controller)
                .with_context(|| format!("invalid controller address '{}'", controller))?;
            let client = Client::new(controller, config.client)
                .with_max_frame_size(config.connection.max_frame_size);
            run_client(client, command).await?;
        }

        Commands::Version => {
            println!("dfs v{}", env!("CARGO_PKG_VERSION"));
            println!("A chunked, replicated file store");
        }
    }

    Ok(())
}

async fn run_client(client: Client, command: ClientCommands) -> anyhow::Result<()> {
    match command {
        ClientCommands::ListStorageNodes => {
            let nodes = client.controller().storage_nodes().await?;
            print!("{}", client::format_nodes(&nodes));
        }

        ClientCommands::ListFiles => {
            let files = client.controller().files().await?;
            print!("{}", client::format_files(&files));
        }

        ClientCommands::Ls => {
            let files = client.controller().files().await?;
            print!("{}", client::format_file_names(&files));
        }

        ClientCommands::UploadFile { path, name } => {
            let name = match name {
                Some(name) => name,
                None => file_name_of(&path)?,
            };
            let summary = client
                .upload(&path, &name)
                .await
                .with_context(|| format!("upload of {} failed", path.display()))?;
            println!(
                "Uploaded {} ({} bytes, {} chunks)",
                summary.filename,
                summary.bytes,
                summary.chunks.len()
            );
        }

        ClientCommands::DownloadFile { name, output } => {
            let dest = output.unwrap_or_else(|| PathBuf::from(&name));
            let bytes = client
                .download(&name, &dest)
                .await
                .with_context(|| format!("download of {} failed", name))?;
            println!("Downloaded {} to {} ({} bytes)", name, dest.display(), bytes);
        }

        ClientCommands::FreeSpace => {
            let bytes = client.controller().free_space().await?;
            println!("{}", client::format_free_space(bytes));
        }

        ClientCommands::NodeFiles { node } => {
            let node: ComponentAddress = node.parse()?;
            let inventory = client::node_inventory(&node).await?;
            print!("{}", client::format_inventory(&inventory));
        }
    }

    Ok(())
}

fn file_name_of(path: &Path) -> anyhow::Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .with_context(|| format!("cannot derive a file name from {}", path.display()))
}

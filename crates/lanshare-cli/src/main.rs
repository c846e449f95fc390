//! LANSHARE CLI
//!
//! Local-network device discovery and direct file transfer

mod config;
mod progress;

use clap::{Parser, Subcommand};
use console::style;
use lanshare_core::{ConnectionState, Node, NodeEvent, ReceivedFile, TransferDirection};
use lanshare_discovery::{DeviceStatus, RelayServer};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use config::Config;
use progress::{ReceiveBoard, TransferProgress, format_bytes, format_duration, format_speed};

/// How long `send` waits for the target to show up in the device list
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

/// LANSHARE - Share files with devices on your network
#[derive(Parser)]
#[command(name = "lanshare")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Relay address (overrides the configuration file)
    #[arg(long, global = true)]
    relay: Option<String>,

    /// Display name (overrides the configuration file)
    #[arg(long, global = true)]
    name: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a signaling relay server
    Relay {
        /// Bind address
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// List devices registered with the relay
    Peers,

    /// Send a file to a device
    Send {
        /// File to send
        #[arg(required = true)]
        file: PathBuf,

        /// Recipient device id or display name
        #[arg(short, long)]
        to: String,
    },

    /// Receive files from other devices
    Receive {
        /// Output directory
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Exit after the first file
        #[arg(long)]
        once: bool,
    },

    /// Show or create the configuration file
    Config {
        /// Write the default configuration if none exists
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load_or_default(&config_path)?;
    if let Some(relay) = &cli.relay {
        config.node.relay_addr.clone_from(relay);
    }
    if let Some(name) = &cli.name {
        config.node.display_name = Some(name.clone());
    }

    // Initialize logging
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level)),
        )
        .init();

    config.validate()?;

    match cli.command {
        Commands::Relay { bind } => run_relay(bind, &config).await?,
        Commands::Peers => list_peers(&config).await?,
        Commands::Send { file, to } => send_file(file, &to, &config).await?,
        Commands::Receive { output, once } => {
            let output = output
                .or_else(|| config.transfer.download_dir.clone())
                .unwrap_or_else(|| PathBuf::from("."));
            receive_files(output, once, &config).await?;
        }
        Commands::Config { init } => show_config(&config_path, init, &config)?,
    }

    Ok(())
}

/// Run the relay until Ctrl+C
async fn run_relay(bind: Option<String>, config: &Config) -> anyhow::Result<()> {
    let bind_addr = match bind {
        Some(addr) => addr.parse()?,
        None => config.parse_bind_addr()?,
    };

    let server = RelayServer::bind_with_config(bind_addr, config.relay_server_config()).await?;
    let local = server.local_addr()?;

    println!("{}", style("LANSHARE Relay").bold());
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Listening on: {local}");
    println!("Online window: {}s", config.relay.online_window_secs);
    println!("Press Ctrl+C to stop");

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => println!("\nShutting down..."),
    }

    Ok(())
}

/// Print the relay's device list
async fn list_peers(config: &Config) -> anyhow::Result<()> {
    let node = Node::start(config.node_config()?).await?;
    let mut events = node.subscribe();
    node.refresh_devices()?;

    // The relay answers with a fresh list
    let _ = tokio::time::timeout(Duration::from_secs(3), async {
        while let Ok(event) = events.recv().await {
            if matches!(event, NodeEvent::DevicesChanged(_)) {
                break;
            }
        }
    })
    .await;

    let peers = node.peers().await;
    println!("{}", style("Devices:").bold());
    if peers.is_empty() {
        println!("  (none)");
    }
    for device in peers {
        let status = match device.status {
            DeviceStatus::Online => style("online").green(),
            DeviceStatus::Offline => style("offline").dim(),
        };
        println!("  {}  {:<24} {}", device.id, device.name, status);
    }

    node.shutdown().await?;
    Ok(())
}

/// Send one file to a device
async fn send_file(file: PathBuf, to: &str, config: &Config) -> anyhow::Result<()> {
    if !file.is_file() {
        anyhow::bail!("File not found: {}", file.display());
    }
    let file_size = std::fs::metadata(&file)?.len();
    let filename = file
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file")
        .to_string();

    let node = Node::start(config.node_config()?).await?;
    let result = send_with(&node, &file, &filename, file_size, to).await;
    node.shutdown().await?;
    result
}

async fn send_with(
    node: &Node,
    file: &Path,
    filename: &str,
    file_size: u64,
    to: &str,
) -> anyhow::Result<()> {
    let target = node.wait_for_device(to, RESOLVE_TIMEOUT).await?;

    println!("File: {}", file.display());
    println!("Size: {}", format_bytes(file_size));
    println!("Recipient: {} ({})", to, target.short());

    println!("Connecting...");
    node.connect(&target).await?;

    let progress = TransferProgress::new(file_size, &format!("Sending: {filename}"));
    let mut events = node.subscribe();
    let sending = node.send_file(&target, file);
    tokio::pin!(sending);

    let report = loop {
        tokio::select! {
            result = &mut sending => break result,
            event = events.recv() => {
                if let Ok(NodeEvent::TransferProgress(p)) = event {
                    if p.direction == TransferDirection::Send && p.remote == target {
                        progress.update(p.bytes);
                    }
                }
            }
        }
    };

    match report {
        Ok(report) => {
            progress.update(report.bytes_sent);
            progress.finish_with_message(format!(
                "Sent {} in {} ({})",
                filename,
                format_duration(Duration::from_secs_f64(report.elapsed)),
                format_speed(report.speed)
            ));
            node.close(&target).await;
            Ok(())
        }
        Err(e) => {
            progress.abandon();
            node.close(&target).await;
            Err(e.into())
        }
    }
}

/// Receive files until Ctrl+C (or the first file with `once`)
async fn receive_files(output: PathBuf, once: bool, config: &Config) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&output).await?;

    let node = Node::start(config.node_config()?).await?;
    let mut events = node.subscribe();

    println!("{}", style("Ready to receive").bold());
    println!("Device: {} ({})", node.display_name(), node.device_id());
    println!("Output directory: {}", output.display());
    println!("Press Ctrl+C to stop");

    let mut board = ReceiveBoard::new();

    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        };

        let event = match event {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Missed {} events", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match event {
            NodeEvent::ConnectionStateChanged { remote, state } => {
                if state == ConnectionState::Open {
                    println!("Connected: {}", remote.short());
                } else if matches!(state, ConnectionState::Closed | ConnectionState::Failed) {
                    println!("Disconnected: {} ({})", remote.short(), state);
                }
            }
            NodeEvent::TransferProgress(p) if p.direction == TransferDirection::Receive => {
                board.update(&p);
            }
            NodeEvent::FileReceived(file) => {
                board.finish(&file.from, &file.name, format!("Received: {}", file.name));
                if save_received(&file, &output).await && once {
                    break;
                }
            }
            NodeEvent::Error { remote, category, message } => {
                if let Some(remote) = &remote {
                    board.abandon_from(remote);
                }
                eprintln!("{} {}: {}", style("Error").red(), category, message);
            }
            _ => {}
        }
    }

    node.shutdown().await?;
    Ok(())
}

/// Save a received file and report where it went
///
/// A failed save is reported and the receive loop carries on. Returns
/// whether the file reached the disk.
async fn save_received(file: &ReceivedFile, output: &Path) -> bool {
    match file.save_to(output).await {
        Ok(path) => {
            println!(
                "{} {} ({}) from {}",
                style("Saved").green(),
                path.display(),
                format_bytes(file.size),
                file.from.short()
            );
            true
        }
        Err(e) => {
            tracing::warn!("Saving {} into {} failed: {}", file.name, output.display(), e);
            eprintln!(
                "{} could not save {} from {}: {}",
                style("Error").red(),
                file.name,
                file.from.short(),
                e
            );
            false
        }
    }
}

/// Print the effective configuration
fn show_config(path: &Path, init: bool, config: &Config) -> anyhow::Result<()> {
    if init {
        if path.exists() {
            println!("Configuration already exists: {}", path.display());
        } else {
            Config::default().save(path)?;
            println!("Wrote default configuration: {}", path.display());
        }
        return Ok(());
    }

    println!("{}", style("LANSHARE Configuration").bold());
    println!("File: {}", path.display());
    println!();
    println!("Node:");
    println!(
        "  Name: {}",
        config.node.display_name.as_deref().unwrap_or("(host name)")
    );
    println!("  Relay: {}", config.node.relay_addr);
    println!("  Heartbeat: {}s", config.node.heartbeat_secs);
    println!();
    println!("Relay server:");
    println!("  Bind: {}", config.relay.bind_addr);
    println!("  Online window: {}s", config.relay.online_window_secs);
    println!("  Expiry: {}s", config.relay.expiry_secs);
    println!();
    println!("Transfer:");
    println!(
        "  Chunk size: {}",
        format_bytes(config.transfer.chunk_size as u64)
    );
    println!(
        "  Max file size: {}",
        format_bytes(config.transfer.max_file_size)
    );
    println!();
    println!("Logging: {}", config.logging.level);

    Ok(())
}

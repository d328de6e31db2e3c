//! LanSync - peer-to-peer folder sync for the local network
//!
//! Nodes find each other over multicast and pull changed files from one
//! another over TCP, verified by content hash.

mod display;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use lansync_config::{Config, ConfigLoader, LogFormat};
use lansync_engine::SyncOrchestrator;
use lansync_sync::{LocalManifest, ManifestBuilder, ManifestOptions};
use lansync_types::{PeerId, SyncStats};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// LanSync - peer-to-peer folder sync for the local network
#[derive(Parser)]
#[command(
    name = "lansync",
    version = env!("CARGO_PKG_VERSION"),
    about = "Peer-to-peer folder sync for the local network",
    long_about = "LanSync keeps a folder in sync across machines on the same network.\n\
                  Nodes discover each other over UDP multicast and pull changed files\n\
                  over TCP, verifying every file by its content hash."
)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Quiet mode - errors only
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Verbose mode - detailed output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node until interrupted
    Run {
        /// Sync root, overrides the configuration
        #[arg(long)]
        root: Option<PathBuf>,
        /// Sync with every online peer this often (seconds)
        #[arg(long)]
        sync_interval: Option<u64>,
    },
    /// Start a node, wait for peers, sync once with each and exit
    Sync {
        /// Only sync with this peer id
        #[arg(long)]
        peer: Option<String>,
        /// Seconds to listen for peers before syncing
        #[arg(long, default_value = "3")]
        wait: u64,
    },
    /// Build the local manifest and print it
    Scan {
        /// Directory to scan, defaults to the configured sync root
        path: Option<PathBuf>,
        /// Print the manifest as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show configuration
    Config {
        /// Show default configuration
        #[arg(long)]
        default: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    init_logging(&config, cli.debug, cli.quiet, cli.verbose)?;

    info!("LanSync v{} starting", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Run {
            root,
            sync_interval,
        } => run_command(config, root, sync_interval, cli.quiet).await?,
        Commands::Sync { peer, wait } => sync_command(config, peer, wait, cli.quiet).await?,
        Commands::Scan { path, json } => scan_command(&config, path, json).await?,
        Commands::Config { default } => config_command(&config, default)?,
    }

    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let config = match path {
        Some(path) => ConfigLoader::load_from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => ConfigLoader::load_default().context("Failed to load configuration")?,
    };
    Ok(config)
}

fn init_logging(config: &Config, debug: bool, quiet: bool, verbose: bool) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if debug {
        "debug"
    } else if verbose {
        "info"
    } else if quiet {
        "error"
    } else {
        config.logging.level.as_str()
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("Invalid log filter")?;

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false);

    match config.logging.format {
        LogFormat::Json => subscriber.json().try_init(),
        LogFormat::Pretty => subscriber.try_init(),
    }
    .map_err(|e| anyhow::anyhow!("Failed to install logger: {}", e))?;

    Ok(())
}

async fn run_command(
    mut config: Config,
    root: Option<PathBuf>,
    sync_interval: Option<u64>,
    quiet: bool,
) -> Result<()> {
    if let Some(root) = root {
        config.node.sync_root = root;
    }
    if let Some(seconds) = sync_interval {
        config.sync.auto_sync_interval_ms = seconds.saturating_mul(1000);
    }

    let node = SyncOrchestrator::with_config(config)?;
    let mut events = node.take_events();
    node.start().await?;

    if !quiet {
        println!(
            "{} {} ({}) syncing {}",
            style("→").green().bold(),
            style(node.display_name()).cyan(),
            node.node_id(),
            style(node.local_manifest().root().display()).cyan()
        );
        println!("{} Press Ctrl-C to stop", style("ℹ").yellow());
    }

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                }
                break;
            }
            event = next_event(&mut events) => match event {
                Some(event) => {
                    if !quiet {
                        println!("{}", display::describe_event(&event));
                    }
                }
                None => events = None,
            },
        }
    }

    node.stop().await?;
    if !quiet {
        display::print_engine_stats(&node.get_stats().await);
    }
    Ok(())
}

async fn next_event(
    events: &mut Option<tokio::sync::mpsc::Receiver<lansync_engine::SyncEvent>>,
) -> Option<lansync_engine::SyncEvent> {
    match events {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

async fn sync_command(config: Config, peer: Option<String>, wait: u64, quiet: bool) -> Result<()> {
    let node = SyncOrchestrator::with_config(config)?;
    node.start().await?;

    if !quiet {
        println!(
            "{} Listening for peers for {}s",
            style("ℹ").yellow(),
            wait
        );
    }
    tokio::time::sleep(Duration::from_secs(wait)).await;

    let results: BTreeMap<PeerId, SyncStats> = match peer {
        Some(peer_id) => match node.sync_with_peer(&peer_id).await {
            Ok(stats) => std::iter::once((peer_id, stats)).collect(),
            Err(e) => {
                node.stop().await?;
                return Err(e.into());
            }
        },
        None => node.sync_with_all().await,
    };
    node.stop().await?;

    if results.is_empty() && !quiet {
        println!("{} No online peers found", style("ℹ").yellow());
    }
    let mut failed = false;
    for (peer_id, stats) in &results {
        failed |= !stats.is_clean();
        if !quiet {
            display::print_sync_stats(peer_id, stats);
        }
    }

    if failed {
        anyhow::bail!("Sync finished with errors");
    }
    Ok(())
}

async fn scan_command(config: &Config, path: Option<PathBuf>, json: bool) -> Result<()> {
    let root = path.unwrap_or_else(|| config.node.sync_root.clone());
    let options = ManifestOptions {
        exclude: config.node.exclude.clone(),
        track_directories: config.node.track_directories,
        fast_rescan: false,
    };
    let local = Arc::new(LocalManifest::new(ManifestBuilder::new(&root, options)?));
    local.rescan().await?;
    let manifest = local.snapshot().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&manifest)?);
        return Ok(());
    }

    println!(
        "{} Scanned {}",
        style("✓").green().bold(),
        style(root.display()).cyan()
    );
    for entry in manifest.iter() {
        if entry.is_directory {
            println!("  {}/", entry.relative_path);
        } else {
            println!(
                "  {}  {:>10}  {:?}",
                entry.relative_path,
                display::format_bytes(entry.size_bytes),
                entry.content_hash
            );
        }
    }
    println!(
        "{} files, {}",
        style(manifest.file_count()).green(),
        display::format_bytes(manifest.total_bytes())
    );
    Ok(())
}

fn config_command(config: &Config, default: bool) -> Result<()> {
    let (title, shown) = if default {
        ("Default configuration:", Config::default())
    } else {
        ("Current configuration:", config.clone())
    };
    println!("{} {}", style("⚙").blue().bold(), title);
    print!("{}", serde_yaml::to_string(&shown)?);
    Ok(())
}

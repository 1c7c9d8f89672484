//! swarm-torrent - Main entry point
//!
//! Downloads and seeds a single torrent until interrupted.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use swarm_torrent::{
    CliArgs, ClientConfig, DiskProvider, PeerInfo, PeerSource, PieceStore, SwarmManager, TorrentError,
    TorrentInfo, TorrentParser, Tracker,
};
use tracing::{debug, error, info, warn};

/// Set up panic handler for unexpected errors
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();
        if let Some(location) = panic_info.location() {
            error!(
                "PANIC occurred at {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            );
        }
        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        } else {
            error!("Panic message: unknown");
        }
        error!("Backtrace:\n{:?}", backtrace);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_panic_handler();

    let args = CliArgs::parse_args();
    init_logging(&args);
    info!("swarm-torrent starting");
    debug!("CLI arguments: {:?}", args);

    let config = args.to_config().context("Invalid configuration")?;
    let torrent = Arc::new(load_torrent_file(&args.torrent_file).context("Failed to load torrent file")?);
    display_torrent_info(&torrent, &config);

    let store = PieceStore::from_torrent(&torrent, &config.output_dir, &DiskProvider).map_err(|e| {
        error!("Failed to open piece store: {}", e);
        anyhow::Error::from(TorrentError::storage_error_full(
            "Failed to open piece store",
            config.output_dir.display().to_string(),
            e.to_string(),
        ))
    })?;

    info!("Verifying existing data");
    let complete = store.verify_all()?;
    info!(
        "{} of {} blocks present {}",
        store.num_blocks() - store.missing_count(),
        store.num_blocks(),
        store
    );
    if complete {
        info!("All data present; seeding");
    }

    let trackers = Tracker::for_torrent(&torrent);
    if trackers.is_empty() && args.peers.is_empty() {
        warn!("No usable trackers and no peers given");
    }

    let mut manager = SwarmManager::new(torrent.clone(), Arc::new(store), Arc::new(config), trackers);
    let mut manual = Vec::new();
    for peer in &args.peers {
        let addr: SocketAddr = peer.parse().with_context(|| format!("Invalid peer address '{}'", peer))?;
        manual.push(PeerInfo::new(addr, PeerSource::Manual));
    }
    manager.add_peers(manual);

    manager
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Interrupted");
        })
        .await?;

    info!("swarm-torrent finished ({})", manager.store());
    Ok(())
}

/// Initialize logging based on verbosity settings
fn init_logging(args: &CliArgs) {
    let level = args.log_level();

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if args.is_verbose() {
        subscriber.pretty().init();
    } else {
        subscriber.compact().init();
    }

    debug!("Logging initialized with level {:?}", level);
}

/// Load and parse the torrent file
fn load_torrent_file(path: &Path) -> Result<TorrentInfo> {
    info!("Loading torrent file: {}", path.display());
    let info = TorrentParser::parse_file(path).map_err(|e| {
        error!("Failed to parse torrent file '{}': {}", path.display(), e);
        e
    })?;
    info!("Successfully loaded torrent file: {}", info.name);
    Ok(info)
}

/// Display torrent information
fn display_torrent_info(torrent: &TorrentInfo, config: &ClientConfig) {
    println!("Torrent Information:");
    println!("  Name: {}", torrent.name);
    println!("  Size: {} bytes", torrent.total_size());
    println!("  Pieces: {} x {} bytes", torrent.piece_count(), torrent.piece_length);
    println!("  Info hash: {}", torrent.info_hash_hex());
    for (tier, url) in torrent.trackers() {
        println!("  Tracker (tier {}): {}", tier, url);
    }
    println!();
    println!("Configuration:");
    println!("  Output directory: {}", config.output_dir.display());
    println!("  Listen port: {}", config.listen_port);
    println!("  Max peers: {}", config.max_peers);
    println!("  Inbound: {}", if config.accept_inbound { "enabled" } else { "disabled" });
    println!();
}

use clap::Parser;
use leech::{
    ApplicationError, ClientConfig, FileWriter, PieceManager, Torrent, TorrentClient, Tracker,
};
use std::{path::PathBuf, sync::Arc, time::Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Download a single-file torrent
#[derive(Parser, Debug)]
#[command(name = "leech", version, about)]
struct Cli {
    /// Path to the .torrent file
    torrent: PathBuf,

    /// Directory the downloaded file is written to
    #[arg(short, long, default_value = ".")]
    output: PathBuf,

    /// Port reported to the tracker
    #[arg(short, long, default_value_t = 6881)]
    port: u16,

    /// Maximum simultaneous peer connections
    #[arg(short = 'c', long, default_value_t = 40)]
    max_connections: usize,

    /// Requests kept in flight per peer
    #[arg(long, default_value_t = 5)]
    pipeline: usize,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), ApplicationError> {
    let cli = Cli::parse();

    // RUST_LOG wins over -v
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let torrent = Torrent::from_file(&cli.torrent)?;
    torrent.log_info();

    let config = ClientConfig {
        port: cli.port,
        max_connections: cli.max_connections,
        pipeline_depth: cli.pipeline,
        ..Default::default()
    };
    config.validate()?;

    let path = cli.output.join(torrent.output_name());
    let writer = Arc::new(
        FileWriter::create(&path, torrent.total_length(), torrent.piece_length()).await?,
    );
    let manager = Arc::new(PieceManager::new(&torrent, config.block_size, writer)?);
    let tracker = Arc::new(Tracker::new(torrent.announce_url(), config.tracker_timeout)?);
    let client = Arc::new(TorrentClient::new(
        torrent.info_hash(),
        config,
        manager.clone(),
        tracker,
    ));

    let stopper = client.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, shutting down");
            stopper.stop().await;
        }
    });

    let started = Instant::now();
    client.start().await?;

    let progress = manager.progress().await;
    if manager.is_complete().await {
        info!(
            path = %path.display(),
            bytes = progress.bytes_total,
            elapsed_secs = started.elapsed().as_secs(),
            "download finished"
        );
    } else {
        warn!(
            pieces = progress.pieces_done,
            total = progress.pieces_total,
            "download incomplete"
        );
    }
    Ok(())
}

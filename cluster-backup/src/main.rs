//! cluster-backup - Main entry point
//!
//! Takes one full or page-level incremental backup and exits.

use anyhow::Result;
use clap::Parser;
use cluster_backup::daemon::shutdown::ShutdownCoordinator;
use cluster_backup::fs::inventory::SystemClock;
use cluster_backup::server::PsqlConnector;
use cluster_backup::transfer::copy::LocalCopier;
use cluster_backup::wal::pagemap::PageLsnFallback;
use cluster_backup::{utils, BackupContext, BackupError, BackupMode, BackupSession, Config};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Backup mode: full or page
    #[arg(short = 'b', long)]
    backup_mode: Option<BackupMode>,

    /// Data directory of the cluster
    #[arg(short = 'D', long)]
    pgdata: Option<PathBuf>,

    /// WAL archive directory
    #[arg(short = 'A', long)]
    arclog_path: Option<PathBuf>,

    /// Backup catalog directory
    #[arg(short = 'B', long)]
    backup_path: Option<PathBuf>,

    /// Wait for a regular checkpoint instead of forcing one
    #[arg(short = 'C', long)]
    smooth_checkpoint: bool,

    /// Compress copied files with zstd
    #[arg(short = 'Z', long)]
    compress: bool,

    /// Database server host
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Database server port
    #[arg(short, long)]
    port: Option<u16>,

    /// Database user
    #[arg(short = 'U', long)]
    username: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = run(args).await {
        eprintln!("ERROR: {:#}", e);
        let code = e.downcast_ref::<BackupError>().map_or(1, BackupError::exit_code);
        std::process::exit(code);
    }
}

async fn run(args: Args) -> Result<()> {
    // Load configuration
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .map_err(|e| BackupError::Config(format!("{}: {:#}", path.display(), e)))?,
        None => Config::default(),
    };
    apply_overrides(&mut config, &args);

    // Initialize logging
    utils::logger::init(&config.log.level)?;

    tracing::info!("Starting cluster-backup v{}", env!("CARGO_PKG_VERSION"));

    let shutdown = Arc::new(ShutdownCoordinator::new());
    let signals = {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move { shutdown.wait_for_signal().await })
    };

    let ctx = BackupContext {
        connector: PsqlConnector::new(config.server.clone()),
        copier: Box::new(LocalCopier::new(config.backup.compression_level)),
        scanner: Box::new(PageLsnFallback),
        clock: Box::new(SystemClock),
        cancel: shutdown.token(),
    };
    let mut session = BackupSession::new(config.backup_options(), ctx);
    let result = session.run().await;
    signals.abort();

    let desc = result?;
    tracing::info!("Backup {} finished with status {}", desc.id(), desc.status);
    Ok(())
}

/// Command-line flags take precedence over the configuration file.
fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(mode) = args.backup_mode {
        config.backup.mode = Some(mode);
    }
    if let Some(pgdata) = &args.pgdata {
        config.cluster.pgdata = Some(pgdata.clone());
    }
    if let Some(arclog) = &args.arclog_path {
        config.cluster.arclog_path = Some(arclog.clone());
    }
    if let Some(backup_path) = &args.backup_path {
        config.catalog.backup_path = Some(backup_path.clone());
    }
    if args.smooth_checkpoint {
        config.backup.smooth_checkpoint = true;
    }
    if args.compress {
        config.backup.compress = true;
    }
    if let Some(host) = &args.host {
        config.server.host = Some(host.clone());
    }
    if let Some(port) = args.port {
        config.server.port = Some(port);
    }
    if let Some(user) = &args.username {
        config.server.user = Some(user.clone());
    }
    if let Some(level) = &args.log_level {
        config.log.level = level.clone();
    }
}

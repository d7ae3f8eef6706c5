//! Tiered Cache Admin
//!
//! Operator tool for a cache's configuration and on-disk tier.
//!
//! ```text
//! tiered-cache --config cache.yaml check-config
//! tiered-cache --config cache.yaml stats
//! tiered-cache --config cache.yaml sweep --dry-run
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tiered_cache::cache::{format_duration, L3Cache, LocalFsBackend, StorageBackend};
use tiered_cache::{CacheConfig, Result};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Tiered Cache - inspect and maintain a cache directory
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Cache configuration file (YAML); defaults apply when omitted
    #[arg(long, short, env = "TIERED_CACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate the configuration and print the effective values
    CheckConfig,

    /// Summarize the disk tier directory
    Stats,

    /// Run one disk-bound sweep against the directory
    Sweep {
        /// Report what would be deleted without deleting it
        #[arg(long)]
        dry_run: bool,
    },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let config = match &args.config {
        Some(path) => CacheConfig::from_file(path)?,
        None => CacheConfig::default(),
    };

    match args.command {
        Command::CheckConfig => check_config(&config),
        Command::Stats => stats(&config).await,
        Command::Sweep { dry_run } => sweep(&config, dry_run).await,
    }
}

fn check_config(config: &CacheConfig) -> Result<()> {
    config.validate()?;
    println!("# configuration is valid");
    println!(
        "# disk tier directory: {}",
        config.cache_directory().display()
    );
    print!("{}", config.to_yaml()?);
    Ok(())
}

async fn stats(config: &CacheConfig) -> Result<()> {
    let backend = LocalFsBackend::open(config.cache_directory())?;
    let files = backend.list().await?;

    let total: u64 = files.iter().map(|f| f.len).sum();
    let oldest = files.iter().map(|f| f.accessed).min();
    let newest = files.iter().map(|f| f.accessed).max();

    println!("directory:      {}", backend.location());
    println!("files:          {}", files.len());
    println!(
        "total bytes:    {} of {} ({:.1}%)",
        total,
        config.disk.max_total_bytes,
        total as f64 * 100.0 / config.disk.max_total_bytes as f64
    );
    if let (Some(oldest), Some(newest)) = (oldest, newest) {
        println!(
            "oldest access:  {}",
            DateTime::<Utc>::from(oldest).to_rfc3339()
        );
        println!(
            "newest access:  {}",
            DateTime::<Utc>::from(newest).to_rfc3339()
        );
    }
    println!(
        "orphan grace:   {}",
        format_duration(config.disk.orphan_grace)
    );
    Ok(())
}

async fn sweep(config: &CacheConfig, dry_run: bool) -> Result<()> {
    config.validate()?;
    let backend = LocalFsBackend::open(config.cache_directory())?;
    info!(directory = %backend.location(), dry_run, "Running disk sweep");

    // A fresh index: every file is unindexed, so the grace window decides
    // which ones count as orphans
    let l3 = L3Cache::new(Arc::new(backend), config.l3_config());
    let report = if dry_run {
        l3.plan_disk_sweep().await?
    } else {
        l3.sweep_disk().await?
    };

    if dry_run {
        println!("# dry run: nothing was deleted");
    }
    print!("{}", serde_yaml::to_string(&report)?);
    Ok(())
}

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

//! codeassist-cachectl - inspect and maintain an on-disk response cache

use anyhow::Context;
use clap::{Parser, Subcommand};
use codeassist_cache::{InvalidationCoordinator, ResponseCache};
use codeassist_core::{CacheOptions, CacheSettings};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "codeassist-cachectl")]
#[command(about = "Inspect and maintain a codeassist response cache directory")]
struct Args {
    /// Cache directory
    #[arg(long)]
    cache_dir: PathBuf,

    /// Settings file; command line flags override it
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Entry time-to-live in seconds
    #[arg(long)]
    ttl_secs: Option<u64>,

    /// Storage ceiling enforced by `sweep`
    #[arg(long)]
    max_storage_bytes: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print metrics after loading the cache
    Stats,
    /// Drop expired entries and enforce the storage ceiling
    Sweep,
    /// Remove every entry
    Clear,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let mut settings = match &args.settings {
        Some(path) => CacheSettings::from_json_file(path)
            .with_context(|| format!("failed to load settings from {}", path.display()))?,
        None => CacheSettings::default(),
    };
    settings.cache = CacheOptions {
        persist: true,
        cache_dir: Some(args.cache_dir.clone()),
        background_refresh: false,
        ..settings.cache
    };
    if let Some(ttl) = args.ttl_secs {
        settings.cache.ttl = Duration::from_secs(ttl);
        settings.invalidation.ttl = Duration::from_secs(ttl);
    }
    if let Some(max) = args.max_storage_bytes {
        settings.cache.max_storage_bytes = max;
        settings.invalidation.max_storage_bytes = max;
    }
    settings.validate()?;

    tracing::info!(cache_dir = %args.cache_dir.display(), "Opening response cache");

    // Entries are kept opaque; the tool never interprets responses.
    let cache: ResponseCache<serde_json::Value> = ResponseCache::new(settings.cache.clone());
    cache.initialize().await;

    match args.command {
        Command::Stats => {
            let metrics = cache.metrics();
            println!("{}", serde_json::to_string_pretty(&metrics)?);
        }
        Command::Sweep => {
            let coordinator = InvalidationCoordinator::new(cache.clone(), settings.invalidation);
            let report = coordinator.sweep().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Clear => {
            let removed = cache.clear().await;
            println!("removed {removed} entries");
        }
    }

    Ok(())
}

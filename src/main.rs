// ABOUTME: CLI entry point for listing-replicator
// ABOUTME: Parses commands and routes to the sync engine

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use listing_replicator::cursor::CursorTracker;
use listing_replicator::engine::{EngineConfig, SyncEngine};
use listing_replicator::entity::EntityType;
use listing_replicator::feed::HttpFeedClient;
use listing_replicator::referential::ReferentialPolicy;
use listing_replicator::store::PostgresStore;

#[derive(Parser)]
#[command(name = "listing-replicator")]
#[command(about = "Incremental real-estate listing feed replication into PostgreSQL", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    /// Feed API base URL
    #[arg(long, env = "FEED_URL", global = true)]
    feed_url: Option<String>,
    /// Feed API bearer token
    #[arg(long, env = "FEED_TOKEN", global = true)]
    feed_token: Option<String>,
    /// Target PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,
    /// Cursor state file (defaults to ~/.listing-replicator/cursors.json)
    #[arg(long, global = true)]
    state_path: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a sync from the stored cursors (or from scratch with --full)
    Sync {
        /// Ignore stored cursors and reprocess the entire feed
        #[arg(long)]
        full: bool,
        /// Fetch page size
        #[arg(long, default_value_t = 1000)]
        batch_size: usize,
        /// Persistence chunk size
        #[arg(long, default_value_t = 500)]
        chunk_size: usize,
        /// Reject child records when the parent-existence check itself fails
        /// (default passes them through to persistence)
        #[arg(long)]
        fail_closed: bool,
    },
    /// Sync a single record (and its children) by key
    SyncOne {
        /// Entity type: property or media
        entity: String,
        /// Primary key of the record
        key: String,
    },
    /// Show per-entity cursors and circuit-breaker state
    Status,
    /// Reset the stored cursor for one entity (or all)
    ResetCursor {
        /// Entity type: property or media (omit for all)
        #[arg(long)]
        entity: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log)),
        )
        .init();

    let state_path = cli
        .state_path
        .clone()
        .unwrap_or_else(CursorTracker::default_path);

    match &cli.command {
        Commands::Sync {
            full,
            batch_size,
            chunk_size,
            fail_closed,
        } => {
            let config = EngineConfig {
                batch_size: *batch_size,
                chunk_size: *chunk_size,
                referential_policy: if *fail_closed {
                    ReferentialPolicy::FailClosed
                } else {
                    ReferentialPolicy::FailOpen
                },
                ..EngineConfig::default()
            };
            let mut engine = build_engine(&cli, &state_path, config).await?;

            let result = if *full {
                engine.run_full_sync().await?
            } else {
                engine.run_incremental_sync().await?
            };

            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.is_success() {
                std::process::exit(1);
            }
        }
        Commands::SyncOne { entity, key } => {
            let entity: EntityType = entity.parse()?;
            let mut engine = build_engine(&cli, &state_path, EngineConfig::default()).await?;
            let result = engine.sync_one(entity, key).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Status => {
            let engine = build_engine(&cli, &state_path, EngineConfig::default()).await?;
            let status = engine.status();
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::ResetCursor { entity } => {
            let entity = entity
                .as_deref()
                .map(|e| e.parse::<EntityType>())
                .transpose()?;
            let mut cursors = CursorTracker::load(&state_path).await?;
            cursors.reset(entity).await?;
            println!("Cursor state reset");
        }
    }

    Ok(())
}

async fn build_engine(
    cli: &Cli,
    state_path: &std::path::Path,
    config: EngineConfig,
) -> Result<SyncEngine<HttpFeedClient, PostgresStore>> {
    let feed_url = cli
        .feed_url
        .clone()
        .context("Feed URL required (--feed-url or FEED_URL)")?;
    let database_url = cli
        .database_url
        .clone()
        .context("Database URL required (--database-url or DATABASE_URL)")?;

    let feed = HttpFeedClient::new(feed_url, cli.feed_token.clone())?;
    let store = PostgresStore::connect(&database_url).await?;
    let cursors = CursorTracker::load(state_path).await?;

    Ok(SyncEngine::new(feed, store, cursors, config))
}

//! Command-line interface for the event indexer.
//!
//! # Commands
//!
//! - `index`: Run every configured stream until Ctrl-C
//! - `status`: Show each stream's cursor, reorg count and event total
//! - `resync`: Roll a stream back to a block after a reorg deeper than the bound
//! - `mark-stale`: Request a metadata refresh for one NFT
//!
//! # Example
//!
//! ```bash
//! TRACKED_CONTRACTS=erc20:0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48@21000000 \
//!     eth-event-indexer index
//!
//! eth-event-indexer resync --stream erc20:0xa0b8...eb48 --to-block 21000500
//! ```

use std::sync::Arc;

use alloy::primitives::{Address, U256};
use clap::{Parser, Subcommand};
use colored::Colorize;
use eyre::{bail, Result, WrapErr};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::{database_url_from_env, Config};
use crate::db::{create_pool, models::StreamStatus, Repository};
use crate::indexer::run_streams;
use crate::metadata::ContractMetadataFetcher;
use crate::projections::ProjectionSet;
use crate::rpc::{AlloyChainClient, ChainClient};

/// Reorg-aware EVM event indexer
#[derive(Parser, Debug)]
#[command(name = "eth-event-indexer")]
#[command(about = "Index EVM contract events into reorg-safe SQLite projections", long_about = None)]
#[command(version)]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
enum Commands {
    /// Index all configured streams until interrupted
    Index,

    /// Show stream cursors and counters
    Status,

    /// Revert a stream to a block and continue from there
    Resync {
        /// Stream identifier, as shown by `status`
        #[arg(short, long)]
        stream: String,

        /// Block to reset the cursor to
        #[arg(short, long)]
        to_block: u64,
    },

    /// Mark NFT metadata stale so the next transfer refreshes it
    MarkStale {
        /// Collection contract address
        #[arg(short, long)]
        collection: Address,

        /// Token id (decimal or 0x-hex)
        #[arg(short, long)]
        token_id: U256,
    },
}

/// Parse CLI arguments and execute the appropriate command.
///
/// # Errors
///
/// Returns an error if configuration, the store or the chain client fails, or
/// if a stream halted while indexing.
pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Index => run_index_command().await,
        Commands::Status => run_status_command().await,
        Commands::Resync { stream, to_block } => run_resync_command(&stream, to_block).await,
        Commands::MarkStale {
            collection,
            token_id,
        } => run_mark_stale_command(collection, token_id).await,
    }
}

/// Execute the index command.
async fn run_index_command() -> Result<()> {
    let config = Config::from_env().wrap_err("Failed to load configuration")?;
    let repo = Repository::new(
        create_pool(config.database_url())
            .await
            .wrap_err("Failed to open projection store")?,
    );
    repo.health_check()
        .await
        .wrap_err("Projection store is not answering")?;
    let client = AlloyChainClient::connect(config.rpc_url())
        .await
        .wrap_err("Failed to connect to chain client")?;
    let metadata = Arc::new(ContractMetadataFetcher::new(client.provider().clone()));

    println!(
        "{} {} streams from {}",
        "🔍 Indexing".cyan().bold(),
        config.contracts().len(),
        config.rpc_url().dimmed()
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received, finishing in-flight ranges"),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl-C, shutting down"),
        }
        let _ = shutdown_tx.send(true);
    });

    let outcomes = run_streams(&config, Arc::new(client), repo, metadata, shutdown_rx).await;

    let mut halted = 0;
    for (stream, outcome) in &outcomes {
        match outcome {
            Ok(()) => println!("{} {}", "✓ stopped".green(), stream),
            Err(e) => {
                halted += 1;
                println!("{} {} ({}): {}", "✗ halted".red().bold(), stream, e.kind(), e);
            }
        }
    }

    if halted > 0 {
        bail!("{halted} of {} streams halted; see the log for details", outcomes.len());
    }
    Ok(())
}

/// Execute the status command.
async fn run_status_command() -> Result<()> {
    let repo = open_store().await?;
    let streams = repo.list_streams().await.wrap_err("Failed to read stream cursors")?;

    if streams.is_empty() {
        println!("{}", "No streams have been indexed yet.".yellow());
        return Ok(());
    }
    for status in &streams {
        print_stream_status(status);
    }
    Ok(())
}

/// Execute the resync command.
async fn run_resync_command(stream: &str, to_block: u64) -> Result<()> {
    let config = Config::from_env().wrap_err("Failed to load configuration")?;
    let repo = Repository::new(create_pool(config.database_url()).await?);

    let Some(cursor) = repo.get_cursor(stream).await? else {
        bail!("Stream {stream} has no cursor; nothing to resync");
    };
    if to_block > cursor.last_block_number {
        bail!(
            "Stream {stream} is at block {}; resync can only move it back",
            cursor.last_block_number
        );
    }

    let client = AlloyChainClient::connect(config.rpc_url()).await?;
    let target = client
        .block(to_block)
        .await
        .wrap_err_with(|| format!("Failed to load block {to_block}"))?;

    warn!(
        stream,
        from_block = cursor.last_block_number,
        to_block,
        "Manual resync requested"
    );
    let reverted = repo
        .rollback_to(&ProjectionSet::standard(), stream, &target)
        .await
        .wrap_err("Resync failed; the store is unchanged")?;

    println!(
        "{} {} reset to block {} ({} contributions reverted)",
        "↺".cyan().bold(),
        stream,
        to_block.to_string().yellow(),
        reverted
    );
    Ok(())
}

/// Execute the mark-stale command.
async fn run_mark_stale_command(collection: Address, token_id: U256) -> Result<()> {
    let repo = open_store().await?;
    if repo.mark_metadata_stale(collection, token_id).await? {
        println!("{} {collection} #{token_id}", "Marked stale:".green());
    } else {
        println!(
            "{}",
            format!("No metadata stored for {collection} #{token_id}; it will be fetched on the next transfer")
                .yellow()
        );
    }
    Ok(())
}

async fn open_store() -> Result<Repository> {
    let url = database_url_from_env();
    let pool = create_pool(&url)
        .await
        .wrap_err_with(|| format!("Failed to open projection store at {url}"))?;
    let repo = Repository::new(pool);
    repo.health_check()
        .await
        .wrap_err_with(|| format!("Projection store at {url} is not answering"))?;
    Ok(repo)
}

/// Display one stream with colored formatting.
fn print_stream_status(status: &StreamStatus) {
    let updated = chrono::DateTime::from_timestamp(status.updated_at, 0).map_or_else(
        || "unknown".to_string(),
        |t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    );
    let reorgs = if status.reorg_count > 0 {
        status.reorg_count.to_string().red().bold()
    } else {
        status.reorg_count.to_string().green()
    };

    println!(
        "{} {} Block: {} | Hash: {} | Events: {} | Reorgs: {} | Updated: {}",
        "📦".cyan(),
        status.stream_id.bold(),
        status.last_block_number.to_string().yellow(),
        short_hash(&status.last_block_hash).dimmed(),
        status.event_count.to_string().blue(),
        reorgs,
        updated.dimmed()
    );
}

/// Abbreviate a hex hash to `0x1234…abcd`.
fn short_hash(hash: &str) -> String {
    if hash.len() <= 14 {
        return hash.to_string();
    }
    format!("{}…{}", &hash[..6], &hash[hash.len() - 4..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_resync() {
        let cli = Cli::try_parse_from([
            "eth-event-indexer",
            "resync",
            "--stream",
            "erc20:0x00000000000000000000000000000000000000aa",
            "--to-block",
            "120",
        ])
        .unwrap();
        match cli.command {
            Commands::Resync { stream, to_block } => {
                assert!(stream.starts_with("erc20:"));
                assert_eq!(to_block, 120);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_mark_stale_accepts_decimal_id() {
        let cli = Cli::try_parse_from([
            "eth-event-indexer",
            "mark-stale",
            "--collection",
            "0x00000000000000000000000000000000000000cc",
            "--token-id",
            "42",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::MarkStale { token_id, .. } if token_id == U256::from(42)
        ));
    }

    #[test]
    fn test_short_hash() {
        assert_eq!(
            short_hash("0x00000000000000000000000000000000000000000000000000000000000000ff"),
            "0x0000…00ff"
        );
        assert_eq!(short_hash("0x12"), "0x12");
    }
}

//! # EVM Event Indexer
//!
//! Reorg-aware event indexer for EVM chains using [Alloy](https://github.com/alloy-rs/alloy).
//!
//! Logs from tracked contracts (ERC20, ERC721, ERC1155, bridge and rollup
//! contracts) are fetched range by range, decoded into typed events and
//! folded into SQLite projections: an event store, ERC20 and NFT balances,
//! hourly and daily charts, and NFT metadata.
//!
//! ## Guarantees
//!
//! - **Atomic ranges**: every projection write of a range and the cursor
//!   advance commit in one transaction, cursor last
//! - **Idempotent writers**: re-applying an event is a no-op, so a range can be
//!   retried after a crash or a rollback
//! - **Reorg reconciliation**: a replaced cursor block is detected before each
//!   fetch and the projections are rolled back to the common ancestor
//!
//! ## Architecture
//!
//! 1. **Config** ([`config`]) - Environment loading and tracked contracts
//! 2. **Chain client** ([`rpc`]) - The [`rpc::ChainClient`] trait and its Alloy implementation
//! 3. **Fetcher** ([`fetcher`]) - Range bisection and retry with [`retry`] backoff
//! 4. **Events** ([`events`]) - ABI bindings and the decoder registry
//! 5. **Projections** ([`projections`]) - Idempotent, revertible writers
//! 6. **Store** ([`db`], [`cursor`]) - Pool, migrations, transactional commits
//! 7. **Reorgs** ([`reorg`]) - Divergence detection and rollback
//! 8. **Orchestration** ([`indexer`]) - One loop per stream
//!
//! ## Using as a Library
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use eth_event_indexer::{
//!     config::Config, db::{create_pool, Repository}, indexer::StreamIndexer,
//!     rpc::AlloyChainClient,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let repo = Repository::new(create_pool(config.database_url()).await?);
//!     let client = Arc::new(AlloyChainClient::connect(config.rpc_url()).await?);
//!
//!     let contract = config.contracts()[0].clone();
//!     let indexer = StreamIndexer::new(&config, contract, client, repo);
//!
//!     let cursor = indexer.load_or_seed().await?;
//!     let cycle = indexer.run_cycle(cursor).await?;
//!     println!("{cycle:?}");
//!     Ok(())
//! }
//! ```
//!
//! ## Error Handling
//!
//! All operations return [`error::TrackerResult<T>`](error::TrackerResult).
//! Each error carries a [`Disposition`](error::Disposition) telling the
//! stream loop whether to retry or halt.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod cli;
pub mod config;
pub mod cursor;
pub mod db;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod indexer;
pub mod metadata;
pub mod observability;
pub mod projections;
pub mod reorg;
pub mod retry;
pub mod rpc;

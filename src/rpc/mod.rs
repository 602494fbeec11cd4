//! Chain client access.
//!
//! The indexing engine talks to the chain only through the [`ChainClient`]
//! trait, so tests can script an in-memory chain and production uses the Alloy
//! HTTP implementation in [`http`].
//!
//! # Architecture
//!
//! ```text
//!   StreamIndexer ──► LogFetcher ──► ChainClient
//!        │                              ▲
//!        └──── ReorgDetector ───────────┘
//!                                       │
//!                              AlloyChainClient (HTTP)
//! ```
//!
//! # Errors
//!
//! Implementations must report a node refusing a log query because of its range
//! or result size as [`TrackerError::RangeTooLarge`](crate::error::TrackerError::RangeTooLarge),
//! which the fetcher answers by bisecting. Anything else transient is a
//! [`TrackerError::Rpc`](crate::error::TrackerError::Rpc) and is retried with backoff.

pub mod http;

use alloy::primitives::{Address, B256};
use async_trait::async_trait;

use crate::error::TrackerResult;
use crate::events::RawLog;
use crate::reorg::BlockRecord;

pub use http::{create_provider, AlloyChainClient, Provider};

/// The chain operations the indexer consumes.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Current head block number.
    async fn latest_block_number(&self) -> TrackerResult<u64>;

    /// Logs in `[from, to]` emitted by any of `addresses` whose topic0 is one of
    /// `signatures`. An empty `signatures` list matches every topic.
    async fn get_logs(
        &self,
        from: u64,
        to: u64,
        addresses: &[Address],
        signatures: &[B256],
    ) -> TrackerResult<Vec<RawLog>>;

    /// Canonical header at `number`.
    async fn block(&self, number: u64) -> TrackerResult<BlockRecord>;

    /// Canonical hash at `number`.
    async fn block_hash(&self, number: u64) -> TrackerResult<B256> {
        Ok(self.block(number).await?.hash)
    }
}

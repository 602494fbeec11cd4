//! Projection writers.
//!
//! Each writer turns decoded events into idempotent mutations of one projection
//! and can revert everything it did for a given block. Writers never open their
//! own transactions: the caller passes a connection that is already inside the
//! range transaction, so a failure in any writer rolls back the whole range.
//!
//! | Writer | Tables | Identity |
//! |--------|--------|----------|
//! | [`EventStoreWriter`] | `events` | `(block_hash, log_index)` |
//! | [`Erc20BalanceWriter`] | `erc20_balances`, `balance_deltas` | `(owner, token)` |
//! | [`NftBalanceWriter`] | `nft_balances`, `balance_deltas` | `(owner, collection, token_id)` |
//! | [`ChartWriter`] | `chart_buckets`, `chart_contributions` | `(granularity, bucket_start, metric)` |
//! | [`NftMetadataWriter`] | `nft_metadata` | `(collection, token_id)` |

pub mod balances;
pub mod charts;
pub mod events;
pub mod nft_metadata;

pub use balances::{Erc20BalanceWriter, NftBalanceWriter};
pub use charts::ChartWriter;
pub use events::EventStoreWriter;
pub use nft_metadata::NftMetadataWriter;

use std::collections::HashMap;

use alloy::primitives::aliases::I512;
use alloy::primitives::{Address, U256, U512};
use async_trait::async_trait;
use sqlx::SqliteConnection;
use tracing::debug;

use crate::error::TrackerResult;
use crate::events::DecodedEvent;

/// Signed balance. Wide enough that any sum of uint256 transfers fits.
pub type Balance = I512;

/// Token URIs fetched ahead of a commit, keyed by `(collection, token_id)`.
pub type MetadataMap = HashMap<(Address, U256), String>;

/// Per-range information writers need besides the event itself.
#[derive(Debug, Clone, Copy)]
pub struct ApplyContext<'a> {
    /// Stream the range belongs to
    pub stream_id: &'a str,
    /// Chain the events come from
    pub chain_id: u64,
    /// Prefetched NFT metadata
    pub metadata: &'a MetadataMap,
}

/// An idempotent, revertible projection.
#[async_trait]
pub trait ProjectionWriter: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Apply one event. Returns `true` if state changed, `false` if the event
    /// was already applied or does not concern this projection.
    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        ctx: &ApplyContext<'_>,
        event: &DecodedEvent,
    ) -> TrackerResult<bool>;

    /// Revert every contribution the stream made at `block_number`.
    /// Returns the number of contributions reverted.
    async fn revert_block(
        &self,
        conn: &mut SqliteConnection,
        stream_id: &str,
        block_number: u64,
    ) -> TrackerResult<u64>;

    /// Drop rollback bookkeeping for blocks below `block_number`.
    async fn prune_below(
        &self,
        _conn: &mut SqliteConnection,
        _stream_id: &str,
        _block_number: u64,
    ) -> TrackerResult<()> {
        Ok(())
    }
}

/// The ordered set of writers a range is committed to.
pub struct ProjectionSet {
    writers: Vec<Box<dyn ProjectionWriter>>,
}

impl ProjectionSet {
    /// Create a set from explicit writers.
    #[must_use]
    pub fn new(writers: Vec<Box<dyn ProjectionWriter>>) -> Self {
        Self { writers }
    }

    /// Every projection the indexer maintains.
    #[must_use]
    pub fn standard() -> Self {
        Self::new(vec![
            Box::new(EventStoreWriter),
            Box::new(Erc20BalanceWriter),
            Box::new(NftBalanceWriter),
            Box::new(ChartWriter),
            Box::new(NftMetadataWriter),
        ])
    }

    /// Writer names, in application order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.writers.iter().map(|w| w.name()).collect()
    }

    /// Apply events in order to every writer.
    ///
    /// Returns how many events changed at least one projection.
    ///
    /// # Errors
    ///
    /// Returns the first writer error; the caller must roll back.
    pub async fn apply_all(
        &self,
        conn: &mut SqliteConnection,
        ctx: &ApplyContext<'_>,
        events: &[DecodedEvent],
    ) -> TrackerResult<usize> {
        let mut applied = 0;
        for event in events {
            let mut changed = false;
            for writer in &self.writers {
                changed |= writer.apply(conn, ctx, event).await?;
            }
            if changed {
                applied += 1;
            } else {
                debug!(
                    block = event.meta.block_number,
                    log_index = event.meta.log_index,
                    "Event already applied"
                );
            }
        }
        Ok(applied)
    }

    /// Revert one block in every writer, in reverse application order.
    ///
    /// # Errors
    ///
    /// Returns the first writer error; the caller must roll back.
    pub async fn revert_block(
        &self,
        conn: &mut SqliteConnection,
        stream_id: &str,
        block_number: u64,
    ) -> TrackerResult<u64> {
        let mut reverted = 0;
        for writer in self.writers.iter().rev() {
            let count = writer.revert_block(conn, stream_id, block_number).await?;
            if count > 0 {
                debug!(writer = writer.name(), block_number, count, "Contributions reverted");
            }
            reverted += count;
        }
        Ok(reverted)
    }

    /// Prune rollback bookkeeping below `block_number` in every writer.
    ///
    /// # Errors
    ///
    /// Returns the first writer error.
    pub async fn prune_below(
        &self,
        conn: &mut SqliteConnection,
        stream_id: &str,
        block_number: u64,
    ) -> TrackerResult<()> {
        for writer in &self.writers {
            writer.prune_below(conn, stream_id, block_number).await?;
        }
        Ok(())
    }
}

impl Default for ProjectionSet {
    fn default() -> Self {
        Self::standard()
    }
}

impl std::fmt::Debug for ProjectionSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionSet")
            .field("writers", &self.names())
            .finish()
    }
}

/// `value` as an unsigned 512-bit integer.
#[must_use]
pub fn widen(value: U256) -> U512 {
    U512::from_be_slice(&value.to_be_bytes::<32>())
}

/// `value` as a non-negative [`Balance`].
#[must_use]
pub fn to_balance(value: U256) -> Balance {
    Balance::from_raw(widen(value))
}

/// Lowercase `0x` hex, the storage form of addresses and hashes.
pub(crate) fn hex<T: std::fmt::Debug>(value: &T) -> String {
    format!("{value:?}")
}

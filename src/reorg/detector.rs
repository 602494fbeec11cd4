//! Reorg detection implementation.

use alloy::primitives::B256;
use alloy::rpc::types::Block;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cursor::Cursor;
use crate::error::{TrackerError, TrackerResult};
use crate::rpc::ChainClient;

/// Record of a block header, as far as reorg handling needs it.
///
/// Stores minimal information needed to verify chain continuity:
/// - Block number and hash
/// - Parent hash (to verify chain linkage)
/// - Timestamp (for chart buckets and debugging)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    /// Block number
    pub number: u64,

    /// Block hash
    pub hash: B256,

    /// Parent block hash
    pub parent_hash: B256,

    /// Block timestamp (Unix epoch seconds)
    pub timestamp: u64,
}

impl BlockRecord {
    /// Create a `BlockRecord` from an Alloy block.
    #[must_use]
    pub fn from_block(block: &Block) -> Self {
        Self {
            number: block.header.number,
            hash: block.header.hash,
            parent_hash: block.header.parent_hash,
            timestamp: block.header.timestamp,
        }
    }

    /// Create a new `BlockRecord` manually.
    #[must_use]
    pub const fn new(number: u64, hash: B256, parent_hash: B256, timestamp: u64) -> Self {
        Self {
            number,
            hash,
            parent_hash,
            timestamp,
        }
    }
}

/// Result of comparing a cursor with the canonical chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainStatus {
    /// The cursor's block is still canonical.
    Synced,
    /// The cursor's block was replaced.
    Diverged {
        /// Hash recorded in the cursor
        stored: B256,
        /// Hash the chain now reports at the same height
        canonical: B256,
    },
}

/// Compares stored block hashes against the canonical chain.
///
/// ## Algorithm
///
/// 1. Compare the cursor hash with the canonical hash at the cursor height
/// 2. On mismatch, walk the stored hash history downward, highest first
/// 3. The first stored block whose hash is still canonical is the common ancestor
/// 4. Give up with [`TrackerError::ReorgTooDeep`] once the walk passes `max_depth`
///
/// Heights with no stored hash carried no contributions and are skipped, but
/// still count toward the depth bound.
#[derive(Debug, Clone, Copy)]
pub struct ReorgDetector {
    max_depth: u64,
}

impl ReorgDetector {
    /// Create a detector with the given walk-back bound.
    #[must_use]
    pub const fn new(max_depth: u64) -> Self {
        Self { max_depth }
    }

    /// Get the walk-back bound.
    #[must_use]
    pub const fn max_depth(&self) -> u64 {
        self.max_depth
    }

    /// Check whether the cursor's block is still canonical.
    ///
    /// # Errors
    ///
    /// Returns an error if the chain client fails.
    pub async fn check(&self, client: &dyn ChainClient, cursor: &Cursor) -> TrackerResult<ChainStatus> {
        let canonical = client.block_hash(cursor.last_block_number).await?;
        if canonical == cursor.last_block_hash {
            return Ok(ChainStatus::Synced);
        }

        warn!(
            stream = %cursor.stream_id,
            block = cursor.last_block_number,
            stored = %cursor.last_block_hash,
            canonical = %canonical,
            "REORG DETECTED: cursor block is no longer canonical"
        );
        Ok(ChainStatus::Diverged {
            stored: cursor.last_block_hash,
            canonical,
        })
    }

    /// Find the highest stored block that is still canonical.
    ///
    /// `history` holds `(number, hash)` pairs recorded for the stream at or below
    /// the cursor, in descending block order.
    ///
    /// # Errors
    ///
    /// - [`TrackerError::ReorgTooDeep`] if no stored block within `max_depth` of
    ///   the cursor is canonical
    /// - Chain client errors
    pub async fn find_common_ancestor(
        &self,
        client: &dyn ChainClient,
        cursor: &Cursor,
        history: &[(u64, B256)],
    ) -> TrackerResult<(u64, B256)> {
        let floor = cursor.last_block_number.saturating_sub(self.max_depth);

        for &(number, stored) in history {
            if number > cursor.last_block_number {
                continue;
            }
            if number < floor {
                break;
            }

            let canonical = client.block_hash(number).await?;
            if canonical == stored {
                info!(
                    stream = %cursor.stream_id,
                    ancestor = number,
                    depth = cursor.last_block_number - number,
                    "Common ancestor found"
                );
                return Ok((number, canonical));
            }
            debug!(stream = %cursor.stream_id, block = number, "Stored block orphaned");
        }

        Err(TrackerError::ReorgTooDeep {
            stream: cursor.stream_id.clone(),
            from_block: cursor.last_block_number,
            max_depth: self.max_depth,
        })
    }
}

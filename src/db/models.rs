//! Database models that map to SQL tables.
//!
//! Addresses and hashes are stored as lowercase `0x` hex strings and 256-bit
//! integers as decimal strings, so rows compare equal exactly when the
//! projected values do.

use serde::{Deserialize, Serialize};

/// A row of the `events` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct EventRow {
    /// Database-assigned identifier
    pub id: i64,
    /// Chain the event was emitted on
    pub chain_id: i64,
    /// Stream that indexed the event
    pub stream_id: String,
    /// Event kind (`erc20_transfer`, `nft_transfer`, ...)
    pub kind: String,
    /// Emitting contract
    pub contract_address: String,
    /// Block number
    pub block_number: i64,
    /// Block hash
    pub block_hash: String,
    /// Transaction hash
    pub tx_hash: String,
    /// Log index within the block
    pub log_index: i64,
    /// Block timestamp (Unix seconds)
    pub block_timestamp: i64,
    /// JSON payload with kind-specific fields
    pub payload: String,
}

/// A row of the `erc20_balances` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Erc20BalanceRow {
    /// Account
    pub owner: String,
    /// Token contract
    pub token: String,
    /// Signed balance in base units
    pub balance: String,
    /// Newest block that contributed
    pub last_block_number: i64,
}

/// A row of the `nft_balances` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct NftBalanceRow {
    /// Account
    pub owner: String,
    /// Collection contract
    pub collection: String,
    /// Token id, decimal
    pub token_id: String,
    /// Signed amount held
    pub balance: String,
    /// Newest block that contributed
    pub last_block_number: i64,
}

/// A row of the `chart_buckets` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ChartBucketRow {
    /// `hour` or `day`
    pub granularity: String,
    /// Bucket start (Unix seconds)
    pub bucket_start: i64,
    /// Metric name, suffixed with the contract address
    pub metric: String,
    /// Accumulated value, decimal
    pub value: String,
    /// Newest block that contributed
    pub last_block_number: i64,
}

/// A row of the `nft_metadata` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct NftMetadataRow {
    /// Collection contract
    pub collection: String,
    /// Token id, decimal
    pub token_id: String,
    /// Token URI
    pub uri: String,
    /// Whether a refresh was requested
    pub stale: bool,
    /// Stream that fetched it
    pub stream_id: String,
    /// Block whose transfer triggered the fetch
    pub source_block_number: i64,
    /// Unix timestamp of the last write
    pub updated_at: i64,
}

/// Cursor and counters of one stream, for the `status` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct StreamStatus {
    /// Stream identifier
    pub stream_id: String,
    /// Last processed block number
    pub last_block_number: i64,
    /// Hash of that block
    pub last_block_hash: String,
    /// Rollbacks applied so far
    pub reorg_count: i64,
    /// Unix timestamp of the last cursor write
    pub updated_at: i64,
    /// Events stored for the stream
    pub event_count: i64,
}

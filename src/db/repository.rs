//! Repository pattern for database operations.
//!
//! Provides the two write paths of the indexer, both single transactions:
//! - [`Repository::commit_range`]: apply a range's events to every projection,
//!   record block hashes and advance the cursor last
//! - [`Repository::rollback_to`]: revert every contribution above a common
//!   ancestor and move the cursor back to it
//!
//! plus the read queries used by the `status` command and tests.

use std::collections::BTreeSet;
use std::str::FromStr;

use alloy::primitives::{Address, B256, U256};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info, instrument, warn};

use super::models::{
    ChartBucketRow, Erc20BalanceRow, EventRow, NftBalanceRow, NftMetadataRow, StreamStatus,
};
use crate::cursor::{self, Cursor, CursorAdvance};
use crate::error::{TrackerError, TrackerResult};
use crate::events::DecodedEvent;
use crate::projections::{hex, ApplyContext, Balance, MetadataMap, ProjectionSet};
use crate::reorg::BlockRecord;

/// Everything needed to commit one block range of one stream.
#[derive(Debug, Clone)]
pub struct CommitBatch {
    /// Stream being advanced
    pub stream_id: String,
    /// Chain id recorded on events
    pub chain_id: u64,
    /// First block of the range
    pub from_block: u64,
    /// Decoded events, in chain order
    pub events: Vec<DecodedEvent>,
    /// Headers of blocks that produced logs, plus the range end
    pub blocks: Vec<BlockRecord>,
    /// Prefetched NFT metadata
    pub metadata: MetadataMap,
    /// Cursor value after the range
    pub cursor: Cursor,
    /// Rollback bookkeeping below this block may be dropped
    pub prune_below: u64,
}

/// Result of a successful range commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitOutcome {
    /// Events that changed at least one projection
    pub applied: usize,
    /// Events that were already applied
    pub duplicates: usize,
}

/// Repository for database operations.
///
/// Wraps a SQLite connection pool and provides type-safe methods
/// for all database interactions.
#[derive(Debug, Clone)]
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    /// Creates a new repository with the given connection pool.
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Check that the database answers.
    ///
    /// # Errors
    ///
    /// Returns a database error if the query fails.
    pub async fn health_check(&self) -> TrackerResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| TrackerError::database("Database health check failed", Some(Box::new(e))))?;
        Ok(())
    }

    // ==================== CURSOR OPERATIONS ====================

    /// Load a stream's cursor.
    ///
    /// # Errors
    ///
    /// Returns a database error if the query fails.
    pub async fn get_cursor(&self, stream_id: &str) -> TrackerResult<Option<Cursor>> {
        let mut conn = self.acquire().await?;
        cursor::get(&mut conn, stream_id).await
    }

    /// Create the first cursor of a stream at `block` and record its hash.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::StaleCursor`] if the stream already has a cursor
    /// at or above `block`, or a database error.
    #[instrument(skip(self, block), fields(block = block.number))]
    pub async fn seed_cursor(&self, stream_id: &str, block: &BlockRecord) -> TrackerResult<Cursor> {
        let seeded = Cursor::new(stream_id, block.number, block.hash);

        let mut tx = self.begin().await?;
        record_blocks(&mut tx, stream_id, std::slice::from_ref(block)).await?;
        cursor::advance(&mut tx, &seeded, CursorAdvance::Forward).await?;
        commit(tx).await?;

        info!(stream = stream_id, block = block.number, "Cursor seeded");
        Ok(seeded)
    }

    /// All stream cursors with their counters.
    ///
    /// # Errors
    ///
    /// Returns a database error if the query fails.
    pub async fn list_streams(&self) -> TrackerResult<Vec<StreamStatus>> {
        sqlx::query_as::<_, StreamStatus>(
            r"
            SELECT c.stream_id, c.last_block_number, c.last_block_hash, c.reorg_count, c.updated_at,
                   (SELECT COUNT(*) FROM events e WHERE e.stream_id = c.stream_id) AS event_count
            FROM cursors c
            ORDER BY c.stream_id
            ",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| TrackerError::database("Failed to list streams", Some(Box::new(e))))
    }

    /// Number of rollbacks applied to a stream.
    ///
    /// # Errors
    ///
    /// Returns a database error if the query fails.
    pub async fn reorg_count(&self, stream_id: &str) -> TrackerResult<u64> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT reorg_count FROM cursors WHERE stream_id = ?")
            .bind(stream_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| TrackerError::database("Failed to read reorg count", Some(Box::new(e))))?;
        Ok(row.map_or(0, |(n,)| n as u64))
    }

    // ==================== RANGE OPERATIONS ====================

    /// Apply a range to every projection and advance the cursor, atomically.
    ///
    /// The cursor write is the last statement of the transaction. Any failure
    /// rolls back every projection write made for the range.
    ///
    /// # Errors
    ///
    /// Returns the first writer, history or cursor error; nothing is committed.
    #[instrument(
        skip(self, writers, batch),
        fields(
            stream = %batch.stream_id,
            from = batch.from_block,
            to = batch.cursor.last_block_number,
            events = batch.events.len(),
            duration_ms = tracing::field::Empty
        )
    )]
    pub async fn commit_range(
        &self,
        writers: &ProjectionSet,
        batch: &CommitBatch,
    ) -> TrackerResult<CommitOutcome> {
        let start = std::time::Instant::now();
        let mut tx = self.begin().await?;

        let ctx = ApplyContext {
            stream_id: &batch.stream_id,
            chain_id: batch.chain_id,
            metadata: &batch.metadata,
        };
        let applied = writers.apply_all(&mut tx, &ctx, &batch.events).await?;

        record_blocks(&mut tx, &batch.stream_id, &batch.blocks).await?;
        if batch.prune_below > 0 {
            // Journals only grow with events, so an empty range leaves writers untouched
            if !batch.events.is_empty() {
                writers
                    .prune_below(&mut tx, &batch.stream_id, batch.prune_below)
                    .await?;
            }
            prune_history(&mut tx, &batch.stream_id, batch.prune_below).await?;
        }

        cursor::advance(&mut tx, &batch.cursor, CursorAdvance::Forward).await?;
        commit(tx).await?;

        tracing::Span::current().record("duration_ms", start.elapsed().as_millis() as u64);
        Ok(CommitOutcome {
            applied,
            duplicates: batch.events.len() - applied,
        })
    }

    /// Stored `(number, hash)` pairs of a stream at or below `at_or_below`,
    /// highest first, at most `limit` entries.
    ///
    /// # Errors
    ///
    /// Returns a database error if the query fails.
    pub async fn stored_hashes(
        &self,
        stream_id: &str,
        at_or_below: u64,
        limit: u64,
    ) -> TrackerResult<Vec<(u64, B256)>> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            r"
            SELECT block_number, block_hash FROM block_history
            WHERE stream_id = ? AND block_number <= ?
            ORDER BY block_number DESC
            LIMIT ?
            ",
        )
        .bind(stream_id)
        .bind(at_or_below as i64)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| TrackerError::database("Failed to load block history", Some(Box::new(e))))?;

        rows.into_iter()
            .map(|(number, hash)| Ok((number as u64, cursor::parse_hash(&hash)?)))
            .collect()
    }

    /// Revert every contribution of the stream above `ancestor` and reset the
    /// cursor to it, atomically.
    ///
    /// Returns the number of contributions reverted.
    ///
    /// # Errors
    ///
    /// Returns a writer or store error; nothing is committed.
    #[instrument(skip(self, writers, ancestor), fields(ancestor = ancestor.number))]
    pub async fn rollback_to(
        &self,
        writers: &ProjectionSet,
        stream_id: &str,
        ancestor: &BlockRecord,
    ) -> TrackerResult<u64> {
        let mut tx = self.begin().await?;

        let heights = contributed_heights_above(&mut tx, stream_id, ancestor.number).await?;
        let mut reverted = 0;
        // Newest first, so each revert undoes the latest remaining contribution
        for height in heights.iter().rev() {
            reverted += writers.revert_block(&mut tx, stream_id, *height).await?;
        }

        sqlx::query("DELETE FROM block_history WHERE stream_id = ? AND block_number > ?")
            .bind(stream_id)
            .bind(ancestor.number as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| TrackerError::database("Failed to trim block history", Some(Box::new(e))))?;
        record_blocks(&mut tx, stream_id, std::slice::from_ref(ancestor)).await?;

        let reset = Cursor::new(stream_id, ancestor.number, ancestor.hash);
        cursor::advance(&mut tx, &reset, CursorAdvance::Rollback).await?;
        commit(tx).await?;

        info!(
            stream = stream_id,
            ancestor = ancestor.number,
            blocks = heights.len(),
            reverted,
            "Rolled back to common ancestor"
        );
        Ok(reverted)
    }

    // ==================== NFT METADATA OPERATIONS ====================

    /// Whether metadata for a token is absent or marked stale.
    ///
    /// # Errors
    ///
    /// Returns a database error if the query fails.
    pub async fn metadata_needs_refresh(&self, collection: Address, token_id: U256) -> TrackerResult<bool> {
        let row: Option<(bool,)> =
            sqlx::query_as("SELECT stale FROM nft_metadata WHERE collection = ? AND token_id = ?")
                .bind(hex(&collection))
                .bind(token_id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| TrackerError::database("Failed to read NFT metadata", Some(Box::new(e))))?;
        Ok(row.map_or(true, |(stale,)| stale))
    }

    /// Flag a token's metadata for refresh on its next transfer.
    ///
    /// Returns `false` if no metadata is stored for the token.
    ///
    /// # Errors
    ///
    /// Returns a database error if the update fails.
    pub async fn mark_metadata_stale(&self, collection: Address, token_id: U256) -> TrackerResult<bool> {
        let result = sqlx::query("UPDATE nft_metadata SET stale = 1 WHERE collection = ? AND token_id = ?")
            .bind(hex(&collection))
            .bind(token_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| TrackerError::database("Failed to mark metadata stale", Some(Box::new(e))))?;
        Ok(result.rows_affected() > 0)
    }

    /// Stored metadata of a token.
    ///
    /// # Errors
    ///
    /// Returns a database error if the query fails.
    pub async fn nft_metadata(&self, collection: Address, token_id: U256) -> TrackerResult<Option<NftMetadataRow>> {
        sqlx::query_as::<_, NftMetadataRow>(
            "SELECT * FROM nft_metadata WHERE collection = ? AND token_id = ?",
        )
        .bind(hex(&collection))
        .bind(token_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| TrackerError::database("Failed to read NFT metadata", Some(Box::new(e))))
    }

    // ==================== QUERY OPERATIONS ====================

    /// Events of a stream in chain order.
    ///
    /// # Errors
    ///
    /// Returns a database error if the query fails.
    pub async fn events_for_stream(&self, stream_id: &str) -> TrackerResult<Vec<EventRow>> {
        sqlx::query_as::<_, EventRow>(
            "SELECT * FROM events WHERE stream_id = ? ORDER BY block_number, log_index",
        )
        .bind(stream_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| TrackerError::database("Failed to query events", Some(Box::new(e))))
    }

    /// ERC20 balance of `owner`; zero if no row exists.
    ///
    /// # Errors
    ///
    /// Returns a database error if the query fails or the stored value is corrupt.
    pub async fn erc20_balance(&self, owner: Address, token: Address) -> TrackerResult<Balance> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT balance FROM erc20_balances WHERE owner = ? AND token = ?")
                .bind(hex(&owner))
                .bind(hex(&token))
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| TrackerError::database("Failed to read balance", Some(Box::new(e))))?;
        parse_balance(row)
    }

    /// All ERC20 balance rows, ordered by token and owner.
    ///
    /// # Errors
    ///
    /// Returns a database error if the query fails.
    pub async fn erc20_balances(&self) -> TrackerResult<Vec<Erc20BalanceRow>> {
        sqlx::query_as::<_, Erc20BalanceRow>("SELECT * FROM erc20_balances ORDER BY token, owner")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| TrackerError::database("Failed to query balances", Some(Box::new(e))))
    }

    /// NFT balance of `owner` for one token; zero if no row exists.
    ///
    /// # Errors
    ///
    /// Returns a database error if the query fails or the stored value is corrupt.
    pub async fn nft_balance(&self, owner: Address, collection: Address, token_id: U256) -> TrackerResult<Balance> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT balance FROM nft_balances WHERE owner = ? AND collection = ? AND token_id = ?",
        )
        .bind(hex(&owner))
        .bind(hex(&collection))
        .bind(token_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| TrackerError::database("Failed to read NFT balance", Some(Box::new(e))))?;
        parse_balance(row)
    }

    /// All NFT balance rows.
    ///
    /// # Errors
    ///
    /// Returns a database error if the query fails.
    pub async fn nft_balances(&self) -> TrackerResult<Vec<NftBalanceRow>> {
        sqlx::query_as::<_, NftBalanceRow>(
            "SELECT * FROM nft_balances ORDER BY collection, token_id, owner",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| TrackerError::database("Failed to query NFT balances", Some(Box::new(e))))
    }

    /// All chart buckets.
    ///
    /// # Errors
    ///
    /// Returns a database error if the query fails.
    pub async fn chart_buckets(&self) -> TrackerResult<Vec<ChartBucketRow>> {
        sqlx::query_as::<_, ChartBucketRow>(
            "SELECT * FROM chart_buckets ORDER BY metric, granularity, bucket_start",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| TrackerError::database("Failed to query chart buckets", Some(Box::new(e))))
    }

    async fn acquire(&self) -> TrackerResult<sqlx::pool::PoolConnection<sqlx::Sqlite>> {
        self.pool
            .acquire()
            .await
            .map_err(|e| TrackerError::database("Failed to acquire connection", Some(Box::new(e))))
    }

    async fn begin(&self) -> TrackerResult<sqlx::Transaction<'static, sqlx::Sqlite>> {
        self.pool
            .begin()
            .await
            .map_err(|e| TrackerError::database("Failed to start transaction", Some(Box::new(e))))
    }
}

async fn commit(tx: sqlx::Transaction<'static, sqlx::Sqlite>) -> TrackerResult<()> {
    tx.commit()
        .await
        .map_err(|e| TrackerError::database("Failed to commit transaction", Some(Box::new(e))))
}

async fn record_blocks(
    conn: &mut SqliteConnection,
    stream_id: &str,
    blocks: &[BlockRecord],
) -> TrackerResult<()> {
    for block in blocks {
        sqlx::query(
            r"
            INSERT INTO block_history (stream_id, block_number, block_hash, parent_hash, block_timestamp)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(stream_id, block_number) DO UPDATE SET
                block_hash = excluded.block_hash,
                parent_hash = excluded.parent_hash,
                block_timestamp = excluded.block_timestamp
            ",
        )
        .bind(stream_id)
        .bind(block.number as i64)
        .bind(hex(&block.hash))
        .bind(hex(&block.parent_hash))
        .bind(block.timestamp as i64)
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            TrackerError::database(
                format!("Failed to record block {}", block.number),
                Some(Box::new(e)),
            )
        })?;
    }
    debug!(stream = stream_id, blocks = blocks.len(), "Block hashes recorded");
    Ok(())
}

async fn prune_history(conn: &mut SqliteConnection, stream_id: &str, below: u64) -> TrackerResult<()> {
    sqlx::query("DELETE FROM block_history WHERE stream_id = ? AND block_number < ?")
        .bind(stream_id)
        .bind(below as i64)
        .execute(&mut *conn)
        .await
        .map_err(|e| TrackerError::database("Failed to prune block history", Some(Box::new(e))))?;
    Ok(())
}

/// Heights above `ancestor` that may carry contributions of the stream.
async fn contributed_heights_above(
    conn: &mut SqliteConnection,
    stream_id: &str,
    ancestor: u64,
) -> TrackerResult<BTreeSet<u64>> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        r"
        SELECT block_number FROM block_history WHERE stream_id = ?1 AND block_number > ?2
        UNION
        SELECT block_number FROM events WHERE stream_id = ?1 AND block_number > ?2
        ",
    )
    .bind(stream_id)
    .bind(ancestor as i64)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| TrackerError::database("Failed to find blocks to revert", Some(Box::new(e))))?;

    let oldest_journal: (Option<i64>,) =
        sqlx::query_as("SELECT MIN(block_number) FROM block_history WHERE stream_id = ?")
            .bind(stream_id)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| TrackerError::database("Failed to read block history", Some(Box::new(e))))?;
    if let (Some(oldest),) = oldest_journal {
        if (oldest as u64) > ancestor + 1 {
            warn!(
                stream = stream_id,
                ancestor,
                oldest_recorded = oldest,
                "Rolling back below the retained history; pruned balance and chart contributions cannot be reverted"
            );
        }
    }

    Ok(rows.into_iter().map(|(n,)| n as u64).collect())
}

fn parse_balance(row: Option<(String,)>) -> TrackerResult<Balance> {
    match row {
        Some((value,)) => Balance::from_dec_str(&value).map_err(|e| {
            TrackerError::database(format!("Corrupt balance value in store: {value}"), Some(Box::new(e)))
        }),
        None => Ok(Balance::ZERO),
    }
}

/// Parse an address stored as hex.
///
/// # Errors
///
/// Returns a database error if the value is not a valid address.
pub fn parse_address(value: &str) -> TrackerResult<Address> {
    Address::from_str(value).map_err(|e| {
        TrackerError::database(format!("Corrupt address in store: {value}"), Some(Box::new(e)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_pool;
    use crate::events::{EventPayload, LogMeta};
    use alloy::primitives::address;

    const TOKEN: Address = address!("00000000000000000000000000000000000000aa");
    const A: Address = address!("000000000000000000000000000000000000000a");
    const B: Address = address!("000000000000000000000000000000000000000b");
    const STREAM: &str = "erc20:0x00000000000000000000000000000000000000aa";

    async fn setup_test_db() -> Repository {
        let pool = create_pool("sqlite::memory:")
            .await
            .expect("Failed to create test database");
        Repository::new(pool)
    }

    fn hash(number: u64) -> B256 {
        B256::with_last_byte(number as u8)
    }

    fn block(number: u64) -> BlockRecord {
        BlockRecord::new(number, hash(number), hash(number.saturating_sub(1)), 1_700_000_000 + number)
    }

    fn transfer(number: u64, log_index: u64, from: Address, to: Address, value: u64) -> DecodedEvent {
        DecodedEvent {
            meta: LogMeta {
                block_number: number,
                block_hash: hash(number),
                tx_hash: B256::repeat_byte(0xee),
                log_index,
                address: TOKEN,
                timestamp: 1_700_000_000 + number,
            },
            payload: EventPayload::Erc20Transfer {
                from,
                to,
                value: U256::from(value),
            },
        }
    }

    fn batch(from: u64, to: u64, events: Vec<DecodedEvent>) -> CommitBatch {
        let mut blocks: Vec<BlockRecord> = events.iter().map(|e| block(e.meta.block_number)).collect();
        blocks.push(block(to));
        CommitBatch {
            stream_id: STREAM.to_string(),
            chain_id: 1,
            from_block: from,
            events,
            blocks,
            metadata: MetadataMap::new(),
            cursor: Cursor::new(STREAM, to, hash(to)),
            prune_below: 0,
        }
    }

    #[tokio::test]
    async fn test_health_check() {
        let repo = setup_test_db().await;
        assert!(repo.health_check().await.is_ok());

        repo.pool().close().await;
        assert!(matches!(repo.health_check().await, Err(TrackerError::Database { .. })));
    }

    #[tokio::test]
    async fn test_seed_and_commit_range() {
        let repo = setup_test_db().await;
        let writers = ProjectionSet::standard();
        repo.seed_cursor(STREAM, &block(9)).await.unwrap();

        let outcome = repo
            .commit_range(&writers, &batch(10, 12, vec![transfer(11, 0, Address::ZERO, A, 10)]))
            .await
            .unwrap();
        assert_eq!(outcome, CommitOutcome { applied: 1, duplicates: 0 });

        let cursor = repo.get_cursor(STREAM).await.unwrap().unwrap();
        assert_eq!(cursor.last_block_number, 12);
        assert_eq!(repo.erc20_balance(A, TOKEN).await.unwrap(), Balance::try_from(10).unwrap());
        assert_eq!(
            repo.stored_hashes(STREAM, 100, 10).await.unwrap(),
            vec![(12, hash(12)), (11, hash(11)), (9, hash(9))]
        );
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_nothing_behind() {
        let repo = setup_test_db().await;
        let writers = ProjectionSet::standard();
        repo.seed_cursor(STREAM, &block(20)).await.unwrap();

        // Cursor would move backwards: the whole range must roll back
        let err = repo
            .commit_range(&writers, &batch(15, 18, vec![transfer(16, 0, Address::ZERO, A, 10)]))
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::StaleCursor { .. }));

        assert!(repo.events_for_stream(STREAM).await.unwrap().is_empty());
        assert_eq!(repo.erc20_balance(A, TOKEN).await.unwrap(), Balance::ZERO);
        assert_eq!(repo.stored_hashes(STREAM, 100, 10).await.unwrap(), vec![(20, hash(20))]);
    }

    #[tokio::test]
    async fn test_rollback_reverts_above_ancestor() {
        let repo = setup_test_db().await;
        let writers = ProjectionSet::standard();
        repo.seed_cursor(STREAM, &block(0)).await.unwrap();
        repo.commit_range(&writers, &batch(1, 3, vec![transfer(2, 0, Address::ZERO, A, 10)]))
            .await
            .unwrap();
        repo.commit_range(&writers, &batch(4, 6, vec![transfer(5, 0, A, B, 4)]))
            .await
            .unwrap();

        let reverted = repo.rollback_to(&writers, STREAM, &block(3)).await.unwrap();
        assert!(reverted > 0);

        let cursor = repo.get_cursor(STREAM).await.unwrap().unwrap();
        assert_eq!((cursor.last_block_number, cursor.last_block_hash), (3, hash(3)));
        assert_eq!(repo.reorg_count(STREAM).await.unwrap(), 1);
        assert_eq!(repo.erc20_balance(A, TOKEN).await.unwrap(), Balance::try_from(10).unwrap());
        assert_eq!(repo.erc20_balance(B, TOKEN).await.unwrap(), Balance::ZERO);
        assert_eq!(repo.events_for_stream(STREAM).await.unwrap().len(), 1);
        assert_eq!(repo.stored_hashes(STREAM, 100, 1).await.unwrap(), vec![(3, hash(3))]);
    }

    #[tokio::test]
    async fn test_prune_drops_old_history() {
        let repo = setup_test_db().await;
        let writers = ProjectionSet::standard();
        repo.seed_cursor(STREAM, &block(0)).await.unwrap();

        let mut pruning = batch(1, 10, vec![transfer(2, 0, Address::ZERO, A, 1)]);
        pruning.prune_below = 5;
        repo.commit_range(&writers, &pruning).await.unwrap();

        assert_eq!(repo.stored_hashes(STREAM, 100, 10).await.unwrap(), vec![(10, hash(10))]);
        // Balances themselves are never pruned
        assert_eq!(repo.erc20_balance(A, TOKEN).await.unwrap(), Balance::ONE);
    }

    #[tokio::test]
    async fn test_metadata_staleness() {
        let repo = setup_test_db().await;
        let id = U256::from(1);
        assert!(repo.metadata_needs_refresh(TOKEN, id).await.unwrap());
        assert!(!repo.mark_metadata_stale(TOKEN, id).await.unwrap());

        sqlx::query(
            r"
            INSERT INTO nft_metadata (
                collection, token_id, uri, stale, stream_id, source_block_number, updated_at
            )
            VALUES (?, '1', 'ipfs://x', 0, 's', 1, 0)
            ",
        )
        .bind(hex(&TOKEN))
        .execute(repo.pool())
        .await
        .unwrap();
        assert!(!repo.metadata_needs_refresh(TOKEN, id).await.unwrap());
        assert!(repo.mark_metadata_stale(TOKEN, id).await.unwrap());
        assert!(repo.metadata_needs_refresh(TOKEN, id).await.unwrap());
        assert!(repo.nft_metadata(TOKEN, id).await.unwrap().unwrap().stale);
    }

    #[tokio::test]
    async fn test_list_streams() {
        let repo = setup_test_db().await;
        let writers = ProjectionSet::standard();
        repo.seed_cursor(STREAM, &block(0)).await.unwrap();
        repo.commit_range(&writers, &batch(1, 2, vec![transfer(1, 0, Address::ZERO, A, 1)]))
            .await
            .unwrap();

        let streams = repo.list_streams().await.unwrap();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].last_block_number, 2);
        assert_eq!(streams[0].event_count, 1);
        assert_eq!(parse_address(&hex(&TOKEN)).unwrap(), TOKEN);
    }
}

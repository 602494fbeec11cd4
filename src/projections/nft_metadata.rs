//! NFT metadata.
//!
//! URIs are fetched before the range transaction opens (see
//! [`crate::metadata`]) and handed to the writer through
//! [`ApplyContext::metadata`]. The writer only fills rows that are absent or
//! marked stale, and records the block that produced them. A refresh keeps the
//! version it replaced, so reverting the refresh restores that version (still
//! marked stale, so the next transfer fetches it again). Reverting a first
//! fetch drops the row. Only one prior version is kept: reverting two
//! successive refreshes of the same token drops the row.

use async_trait::async_trait;
use sqlx::SqliteConnection;

use super::{hex, ApplyContext, ProjectionWriter};
use crate::error::{TrackerError, TrackerResult};
use crate::events::{DecodedEvent, EventPayload};

/// Maintains `nft_metadata`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NftMetadataWriter;

#[async_trait]
impl ProjectionWriter for NftMetadataWriter {
    fn name(&self) -> &'static str {
        "nft_metadata"
    }

    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        ctx: &ApplyContext<'_>,
        event: &DecodedEvent,
    ) -> TrackerResult<bool> {
        let EventPayload::NftTransfer { tokens, .. } = &event.payload else {
            return Ok(false);
        };
        let collection = event.meta.address;
        let mut changed = false;

        for (token_id, _) in tokens {
            let Some(uri) = ctx.metadata.get(&(collection, *token_id)) else {
                continue;
            };

            let result = sqlx::query(
                r"
                INSERT INTO nft_metadata (
                    collection, token_id, uri, stale, stream_id, source_block_number, updated_at
                )
                VALUES (?, ?, ?, 0, ?, ?, strftime('%s', 'now'))
                ON CONFLICT(collection, token_id) DO UPDATE SET
                    previous_uri = nft_metadata.uri,
                    previous_source_block_number = nft_metadata.source_block_number,
                    uri = excluded.uri,
                    stale = 0,
                    stream_id = excluded.stream_id,
                    source_block_number = excluded.source_block_number,
                    updated_at = excluded.updated_at
                WHERE nft_metadata.stale = 1
                ",
            )
            .bind(hex(&collection))
            .bind(token_id.to_string())
            .bind(uri)
            .bind(ctx.stream_id)
            .bind(event.meta.block_number as i64)
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                TrackerError::database(
                    format!("Failed to store metadata for {collection:?} #{token_id}"),
                    Some(Box::new(e)),
                )
            })?;

            changed |= result.rows_affected() > 0;
        }

        Ok(changed)
    }

    async fn revert_block(
        &self,
        conn: &mut SqliteConnection,
        stream_id: &str,
        block_number: u64,
    ) -> TrackerResult<u64> {
        let restored = sqlx::query(
            r"
            UPDATE nft_metadata SET
                uri = previous_uri,
                source_block_number = previous_source_block_number,
                stale = 1,
                previous_uri = NULL,
                previous_source_block_number = NULL
            WHERE stream_id = ? AND source_block_number = ? AND previous_uri IS NOT NULL
            ",
        )
        .bind(stream_id)
        .bind(block_number as i64)
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            TrackerError::database(
                format!("Failed to restore metadata replaced in block {block_number}"),
                Some(Box::new(e)),
            )
        })?;

        let deleted =
            sqlx::query("DELETE FROM nft_metadata WHERE stream_id = ? AND source_block_number = ?")
                .bind(stream_id)
                .bind(block_number as i64)
                .execute(&mut *conn)
                .await
                .map_err(|e| {
                    TrackerError::database(
                        format!("Failed to delete metadata sourced from block {block_number}"),
                        Some(Box::new(e)),
                    )
                })?;

        Ok(restored.rows_affected() + deleted.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projections::test_support::{conn, event, STREAM};
    use crate::projections::MetadataMap;
    use alloy::primitives::{address, Address, U256};

    const COLLECTION: Address = address!("00000000000000000000000000000000000000cc");

    fn mint(block: u64, token_id: u64) -> DecodedEvent {
        event(
            block,
            0,
            COLLECTION,
            EventPayload::NftTransfer {
                from: Address::ZERO,
                to: address!("0000000000000000000000000000000000000001"),
                tokens: vec![(U256::from(token_id), U256::from(1))],
                multi_token: false,
            },
        )
    }

    async fn uri(conn: &mut SqliteConnection, token_id: u64) -> Option<(String, i64)> {
        sqlx::query_as("SELECT uri, source_block_number FROM nft_metadata WHERE token_id = ?")
            .bind(token_id.to_string())
            .fetch_optional(&mut *conn)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_fills_absent_and_keeps_fresh_rows() {
        let mut conn = conn().await;
        let mut metadata = MetadataMap::new();
        metadata.insert((COLLECTION, U256::from(1)), "ipfs://one".to_string());
        let ctx = ApplyContext {
            stream_id: STREAM,
            chain_id: 1,
            metadata: &metadata,
        };

        assert!(NftMetadataWriter.apply(&mut conn, &ctx, &mint(5, 1)).await.unwrap());
        assert_eq!(uri(&mut conn, 1).await, Some(("ipfs://one".to_string(), 5)));

        // A later transfer does not overwrite a fresh row
        metadata.insert((COLLECTION, U256::from(1)), "ipfs://changed".to_string());
        let ctx = ApplyContext {
            stream_id: STREAM,
            chain_id: 1,
            metadata: &metadata,
        };
        assert!(!NftMetadataWriter.apply(&mut conn, &ctx, &mint(6, 1)).await.unwrap());
        assert_eq!(uri(&mut conn, 1).await, Some(("ipfs://one".to_string(), 5)));

        // Once stale, the next transfer refreshes it
        sqlx::query("UPDATE nft_metadata SET stale = 1")
            .execute(&mut *conn)
            .await
            .unwrap();
        assert!(NftMetadataWriter.apply(&mut conn, &ctx, &mint(7, 1)).await.unwrap());
        assert_eq!(uri(&mut conn, 1).await, Some(("ipfs://changed".to_string(), 7)));
    }

    #[tokio::test]
    async fn test_missing_fetch_leaves_row_absent_and_revert_deletes() {
        let mut conn = conn().await;
        let mut metadata = MetadataMap::new();
        metadata.insert((COLLECTION, U256::from(2)), "ipfs://two".to_string());
        let ctx = ApplyContext {
            stream_id: STREAM,
            chain_id: 1,
            metadata: &metadata,
        };

        assert!(!NftMetadataWriter.apply(&mut conn, &ctx, &mint(3, 1)).await.unwrap());
        assert!(NftMetadataWriter.apply(&mut conn, &ctx, &mint(4, 2)).await.unwrap());
        assert_eq!(uri(&mut conn, 1).await, None);

        assert_eq!(NftMetadataWriter.revert_block(&mut conn, STREAM, 4).await.unwrap(), 1);
        assert_eq!(uri(&mut conn, 2).await, None);
    }

    #[tokio::test]
    async fn test_reverted_refresh_restores_previous_uri() {
        let mut conn = conn().await;
        let mut metadata = MetadataMap::new();
        metadata.insert((COLLECTION, U256::from(3)), "ipfs://old".to_string());
        let ctx = ApplyContext {
            stream_id: STREAM,
            chain_id: 1,
            metadata: &metadata,
        };
        assert!(NftMetadataWriter.apply(&mut conn, &ctx, &mint(10, 3)).await.unwrap());

        sqlx::query("UPDATE nft_metadata SET stale = 1")
            .execute(&mut *conn)
            .await
            .unwrap();
        metadata.insert((COLLECTION, U256::from(3)), "ipfs://new".to_string());
        let ctx = ApplyContext {
            stream_id: STREAM,
            chain_id: 1,
            metadata: &metadata,
        };
        assert!(NftMetadataWriter.apply(&mut conn, &ctx, &mint(12, 3)).await.unwrap());
        assert_eq!(uri(&mut conn, 3).await, Some(("ipfs://new".to_string(), 12)));

        assert_eq!(NftMetadataWriter.revert_block(&mut conn, STREAM, 12).await.unwrap(), 1);
        assert_eq!(uri(&mut conn, 3).await, Some(("ipfs://old".to_string(), 10)));
        let (stale,): (bool,) = sqlx::query_as("SELECT stale FROM nft_metadata WHERE token_id = '3'")
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        assert!(stale);

        // The restored version goes away with its own block
        assert_eq!(NftMetadataWriter.revert_block(&mut conn, STREAM, 10).await.unwrap(), 1);
        assert_eq!(uri(&mut conn, 3).await, None);
    }
}

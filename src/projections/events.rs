//! Raw event records.

use async_trait::async_trait;
use sqlx::SqliteConnection;

use super::{hex, ApplyContext, ProjectionWriter};
use crate::error::{TrackerError, TrackerResult};
use crate::events::DecodedEvent;

/// Inserts one row per event, ignoring events already stored.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventStoreWriter;

#[async_trait]
impl ProjectionWriter for EventStoreWriter {
    fn name(&self) -> &'static str {
        "events"
    }

    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        ctx: &ApplyContext<'_>,
        event: &DecodedEvent,
    ) -> TrackerResult<bool> {
        let meta = &event.meta;
        let result = sqlx::query(
            r"
            INSERT INTO events (
                chain_id, stream_id, kind, contract_address, block_number,
                block_hash, tx_hash, log_index, block_timestamp, payload
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(block_hash, log_index) DO NOTHING
            ",
        )
        .bind(ctx.chain_id as i64)
        .bind(ctx.stream_id)
        .bind(event.kind())
        .bind(hex(&meta.address))
        .bind(meta.block_number as i64)
        .bind(hex(&meta.block_hash))
        .bind(hex(&meta.tx_hash))
        .bind(meta.log_index as i64)
        .bind(meta.timestamp as i64)
        .bind(event.payload_json().to_string())
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            TrackerError::database(
                format!("Failed to insert event {}:{}", meta.block_number, meta.log_index),
                Some(Box::new(e)),
            )
        })?;

        Ok(result.rows_affected() == 1)
    }

    async fn revert_block(
        &self,
        conn: &mut SqliteConnection,
        stream_id: &str,
        block_number: u64,
    ) -> TrackerResult<u64> {
        let result = sqlx::query("DELETE FROM events WHERE stream_id = ? AND block_number = ?")
            .bind(stream_id)
            .bind(block_number as i64)
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                TrackerError::database(
                    format!("Failed to delete events of block {block_number}"),
                    Some(Box::new(e)),
                )
            })?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventPayload;
    use crate::projections::test_support::{conn, event, no_metadata, STREAM};
    use alloy::primitives::{address, Address, U256};

    fn transfer(block: u64, log_index: u64) -> DecodedEvent {
        event(
            block,
            log_index,
            address!("00000000000000000000000000000000000000aa"),
            EventPayload::Erc20Transfer {
                from: Address::ZERO,
                to: address!("0000000000000000000000000000000000000001"),
                value: U256::from(10),
            },
        )
    }

    async fn count(conn: &mut SqliteConnection) -> i64 {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM events")
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        n
    }

    #[tokio::test]
    async fn test_insert_is_idempotent() {
        let mut conn = conn().await;
        let ctx = ApplyContext {
            stream_id: STREAM,
            chain_id: 1,
            metadata: no_metadata(),
        };

        assert!(EventStoreWriter.apply(&mut conn, &ctx, &transfer(1, 0)).await.unwrap());
        assert!(!EventStoreWriter.apply(&mut conn, &ctx, &transfer(1, 0)).await.unwrap());
        assert!(EventStoreWriter.apply(&mut conn, &ctx, &transfer(1, 1)).await.unwrap());
        assert_eq!(count(&mut conn).await, 2);

        let (kind, payload): (String, String) =
            sqlx::query_as("SELECT kind, payload FROM events WHERE log_index = 0")
                .fetch_one(&mut *conn)
                .await
                .unwrap();
        assert_eq!(kind, "erc20_transfer");
        assert!(payload.contains("\"value\":\"10\""));
    }

    #[tokio::test]
    async fn test_revert_block_only_touches_that_block() {
        let mut conn = conn().await;
        let ctx = ApplyContext {
            stream_id: STREAM,
            chain_id: 1,
            metadata: no_metadata(),
        };
        EventStoreWriter.apply(&mut conn, &ctx, &transfer(1, 0)).await.unwrap();
        EventStoreWriter.apply(&mut conn, &ctx, &transfer(2, 0)).await.unwrap();

        assert_eq!(EventStoreWriter.revert_block(&mut conn, STREAM, 2).await.unwrap(), 1);
        assert_eq!(EventStoreWriter.revert_block(&mut conn, "other", 1).await.unwrap(), 0);
        assert_eq!(count(&mut conn).await, 1);
    }
}

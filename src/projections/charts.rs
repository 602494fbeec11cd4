//! Time-bucketed aggregate charts.
//!
//! Each event adds to a set of metrics in both an hourly and a daily bucket.
//! Contributions are journaled per `(block_hash, log_index, granularity, metric)`
//! so that re-application is a no-op and a block can be subtracted out again.
//! Bucket values are unsigned 512-bit sums, so volume metrics never overflow.

use alloy::primitives::{Address, U256, U512};
use async_trait::async_trait;
use sqlx::SqliteConnection;

use super::{hex, widen, ApplyContext, ProjectionWriter};
use crate::error::{TrackerError, TrackerResult};
use crate::events::{DecodedEvent, EventPayload};

/// Bucket width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    /// One hour
    Hour,
    /// One day (UTC)
    Day,
}

impl Granularity {
    /// All granularities every metric is recorded at.
    pub const ALL: [Self; 2] = [Self::Hour, Self::Day];

    /// Stored name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hour => "hour",
            Self::Day => "day",
        }
    }

    /// Bucket width in seconds.
    #[must_use]
    pub const fn seconds(self) -> u64 {
        match self {
            Self::Hour => 3_600,
            Self::Day => 86_400,
        }
    }

    /// Start of the bucket containing `timestamp`.
    #[must_use]
    pub const fn bucket_start(self, timestamp: u64) -> u64 {
        timestamp - timestamp % self.seconds()
    }
}

/// Metric contributions of one event, as `(metric name, amount)`.
#[must_use]
pub fn metrics_for(event: &DecodedEvent) -> Vec<(String, U256)> {
    let contract = event.meta.address;
    let metric = |name: &str| format!("{name}:{}", hex(&contract));

    match &event.payload {
        EventPayload::Erc20Transfer { value, .. } => vec![
            (metric("erc20_transfers"), U256::from(1)),
            (metric("erc20_volume"), *value),
        ],
        EventPayload::NftTransfer { from, tokens, .. } => {
            let count = U256::from(tokens.len());
            let mut metrics = vec![(metric("nft_transfers"), count)];
            if *from == Address::ZERO {
                metrics.push((metric("nft_mints"), count));
            }
            metrics
        }
        EventPayload::BridgeMessage { value, .. } => vec![
            (metric("bridge_messages"), U256::from(1)),
            (metric("bridge_value"), *value),
        ],
        EventPayload::BlockProposed { .. } => vec![(metric("blocks_proposed"), U256::from(1))],
    }
}

/// Maintains `chart_buckets`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChartWriter;

#[async_trait]
impl ProjectionWriter for ChartWriter {
    fn name(&self) -> &'static str {
        "charts"
    }

    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        ctx: &ApplyContext<'_>,
        event: &DecodedEvent,
    ) -> TrackerResult<bool> {
        let meta = &event.meta;
        let mut changed = false;

        for (metric, amount) in metrics_for(event) {
            for granularity in Granularity::ALL {
                let bucket_start = granularity.bucket_start(meta.timestamp);
                let journaled = sqlx::query(
                    r"
                    INSERT INTO chart_contributions (
                        block_hash, log_index, granularity, metric, bucket_start,
                        amount, stream_id, block_number
                    )
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT(block_hash, log_index, granularity, metric) DO NOTHING
                    ",
                )
                .bind(hex(&meta.block_hash))
                .bind(meta.log_index as i64)
                .bind(granularity.as_str())
                .bind(&metric)
                .bind(bucket_start as i64)
                .bind(amount.to_string())
                .bind(ctx.stream_id)
                .bind(meta.block_number as i64)
                .execute(&mut *conn)
                .await
                .map_err(|e| {
                    TrackerError::database("Failed to journal chart contribution", Some(Box::new(e)))
                })?;

                if journaled.rows_affected() == 1 {
                    let bucket = (granularity.as_str(), bucket_start as i64, metric.as_str());
                    add_to_bucket(conn, bucket, widen(amount), true, meta.block_number).await?;
                    changed = true;
                }
            }
        }

        Ok(changed)
    }

    async fn revert_block(
        &self,
        conn: &mut SqliteConnection,
        stream_id: &str,
        block_number: u64,
    ) -> TrackerResult<u64> {
        let rows = sqlx::query_as::<_, (String, i64, String, String)>(
            r"
            SELECT granularity, bucket_start, metric, amount FROM chart_contributions
            WHERE stream_id = ? AND block_number = ?
            ",
        )
        .bind(stream_id)
        .bind(block_number as i64)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| TrackerError::database("Failed to load chart contributions", Some(Box::new(e))))?;

        sqlx::query("DELETE FROM chart_contributions WHERE stream_id = ? AND block_number = ?")
            .bind(stream_id)
            .bind(block_number as i64)
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                TrackerError::database("Failed to delete chart contributions", Some(Box::new(e)))
            })?;

        for (granularity, bucket_start, metric, amount) in &rows {
            let amount = widen(parse_u256(amount)?);
            let bucket = (granularity.as_str(), *bucket_start, metric.as_str());
            add_to_bucket(conn, bucket, amount, false, block_number).await?;
        }

        Ok(rows.len() as u64)
    }

    async fn prune_below(
        &self,
        conn: &mut SqliteConnection,
        stream_id: &str,
        block_number: u64,
    ) -> TrackerResult<()> {
        sqlx::query("DELETE FROM chart_contributions WHERE stream_id = ? AND block_number < ?")
            .bind(stream_id)
            .bind(block_number as i64)
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                TrackerError::database("Failed to prune chart contributions", Some(Box::new(e)))
            })?;
        Ok(())
    }
}

/// Add to (or subtract from) a bucket, deleting it when it returns to zero.
async fn add_to_bucket(
    conn: &mut SqliteConnection,
    (granularity, bucket_start, metric): (&str, i64, &str),
    amount: U512,
    increment: bool,
    block_number: u64,
) -> TrackerResult<()> {
    let current = sqlx::query_as::<_, (String,)>(
        "SELECT value FROM chart_buckets WHERE granularity = ? AND bucket_start = ? AND metric = ?",
    )
    .bind(granularity)
    .bind(bucket_start)
    .bind(metric)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| TrackerError::database("Failed to read chart bucket", Some(Box::new(e))))?;

    let value = match current {
        Some((value,)) => U512::from_str_radix(&value, 10).map_err(|e| {
            TrackerError::database(format!("Corrupt chart value in store: {value}"), Some(Box::new(e)))
        })?,
        None => U512::ZERO,
    };
    let updated = if increment {
        value.checked_add(amount)
    } else {
        value.checked_sub(amount)
    }
    .ok_or_else(|| {
        TrackerError::state(
            format!("Chart bucket {metric}@{bucket_start} would go negative"),
            None,
        )
    })?;

    if updated.is_zero() {
        sqlx::query("DELETE FROM chart_buckets WHERE granularity = ? AND bucket_start = ? AND metric = ?")
            .bind(granularity)
            .bind(bucket_start)
            .bind(metric)
            .execute(&mut *conn)
            .await
            .map_err(|e| TrackerError::database("Failed to delete chart bucket", Some(Box::new(e))))?;
        return Ok(());
    }

    // On revert, provenance falls back to the newest contribution still journaled
    let last_block = if increment {
        block_number as i64
    } else {
        latest_contribution_block(conn, (granularity, bucket_start, metric)).await?
    };

    sqlx::query(
        r"
        INSERT INTO chart_buckets (granularity, bucket_start, metric, value, last_block_number)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(granularity, bucket_start, metric) DO UPDATE SET
            value = excluded.value,
            last_block_number = excluded.last_block_number
        ",
    )
    .bind(granularity)
    .bind(bucket_start)
    .bind(metric)
    .bind(updated.to_string())
    .bind(last_block)
    .execute(&mut *conn)
    .await
    .map_err(|e| TrackerError::database("Failed to write chart bucket", Some(Box::new(e))))?;

    Ok(())
}

async fn latest_contribution_block(
    conn: &mut SqliteConnection,
    (granularity, bucket_start, metric): (&str, i64, &str),
) -> TrackerResult<i64> {
    let (block,): (Option<i64>,) = sqlx::query_as(
        r"
        SELECT MAX(block_number) FROM chart_contributions
        WHERE granularity = ? AND bucket_start = ? AND metric = ?
        ",
    )
    .bind(granularity)
    .bind(bucket_start)
    .bind(metric)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| TrackerError::database("Failed to read chart provenance", Some(Box::new(e))))?;
    Ok(block.unwrap_or_default())
}

fn parse_u256(value: &str) -> TrackerResult<U256> {
    U256::from_str_radix(value, 10).map_err(|e| {
        TrackerError::database(format!("Corrupt chart value in store: {value}"), Some(Box::new(e)))
    })
}

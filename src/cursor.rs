//! Per-stream cursors.
//!
//! A cursor records the last block whose effects are fully reflected in the
//! projections, together with that block's hash. It only moves forward, except
//! when the reconciler explicitly rolls it back to a common ancestor.
//!
//! The functions here take a `&mut SqliteConnection` so they can run inside the
//! same transaction as the projection writes they checkpoint.

use std::str::FromStr;

use alloy::primitives::B256;
use serde::Serialize;
use sqlx::SqliteConnection;

use crate::error::{TrackerError, TrackerResult};

/// Last durably processed block of a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cursor {
    /// Stream identifier
    pub stream_id: String,
    /// Last processed block number
    pub last_block_number: u64,
    /// Canonical hash of that block when it was processed
    pub last_block_hash: B256,
}

impl Cursor {
    /// Create a cursor.
    #[must_use]
    pub fn new(stream_id: impl Into<String>, last_block_number: u64, last_block_hash: B256) -> Self {
        Self {
            stream_id: stream_id.into(),
            last_block_number,
            last_block_hash,
        }
    }
}

/// How a cursor write relates to the stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorAdvance {
    /// Normal progress; the new block must be above the stored one.
    Forward,
    /// Reorg rollback or manual resync; the new block must not be above the stored one.
    Rollback,
}

/// Load the cursor of a stream, or `None` if the stream has never run.
///
/// # Errors
///
/// Returns a database error if the query fails or the stored hash is corrupt.
pub async fn get(conn: &mut SqliteConnection, stream_id: &str) -> TrackerResult<Option<Cursor>> {
    let row = sqlx::query_as::<_, (i64, String)>(
        "SELECT last_block_number, last_block_hash FROM cursors WHERE stream_id = ?",
    )
    .bind(stream_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| {
        TrackerError::database(format!("Failed to load cursor for {stream_id}"), Some(Box::new(e)))
    })?;

    row.map(|(number, hash)| {
        Ok(Cursor {
            stream_id: stream_id.to_string(),
            last_block_number: number as u64,
            last_block_hash: parse_hash(&hash)?,
        })
    })
    .transpose()
}

/// Store a new cursor value.
///
/// # Errors
///
/// - [`TrackerError::StaleCursor`] if a forward advance does not move past the
///   stored block
/// - [`TrackerError::State`] if a rollback would move the cursor forward
/// - [`TrackerError::Database`] if the write fails
pub async fn advance(
    conn: &mut SqliteConnection,
    cursor: &Cursor,
    mode: CursorAdvance,
) -> TrackerResult<()> {
    if let Some(current) = get(conn, &cursor.stream_id).await? {
        match mode {
            CursorAdvance::Forward if cursor.last_block_number <= current.last_block_number => {
                return Err(TrackerError::StaleCursor {
                    stream: cursor.stream_id.clone(),
                    current: current.last_block_number,
                    attempted: cursor.last_block_number,
                });
            }
            CursorAdvance::Rollback if cursor.last_block_number > current.last_block_number => {
                return Err(TrackerError::state(
                    format!(
                        "Rollback of {} would move the cursor forward from {} to {}",
                        cursor.stream_id, current.last_block_number, cursor.last_block_number
                    ),
                    None,
                ));
            }
            _ => {}
        }
    }

    let reorg_increment: i64 = i64::from(mode == CursorAdvance::Rollback);
    sqlx::query(
        r"
        INSERT INTO cursors (stream_id, last_block_number, last_block_hash, reorg_count, updated_at)
        VALUES (?, ?, ?, ?, strftime('%s', 'now'))
        ON CONFLICT(stream_id) DO UPDATE SET
            last_block_number = excluded.last_block_number,
            last_block_hash = excluded.last_block_hash,
            reorg_count = cursors.reorg_count + excluded.reorg_count,
            updated_at = excluded.updated_at
        ",
    )
    .bind(&cursor.stream_id)
    .bind(cursor.last_block_number as i64)
    .bind(format!("{:?}", cursor.last_block_hash))
    .bind(reorg_increment)
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        TrackerError::database(
            format!("Failed to advance cursor for {}", cursor.stream_id),
            Some(Box::new(e)),
        )
    })?;

    Ok(())
}

/// Parse a hash stored as `0x`-prefixed hex.
///
/// # Errors
///
/// Returns a database error if the text is not a 32-byte hex value.
pub fn parse_hash(value: &str) -> TrackerResult<B256> {
    B256::from_str(value).map_err(|e| {
        TrackerError::database(format!("Corrupt block hash in store: {value}"), Some(Box::new(e)))
    })
}

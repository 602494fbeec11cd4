//! Reorg reconciliation.
//!
//! Runs before every fetch cycle. If the cursor's block is no longer
//! canonical, the stored hash history is walked back to the newest block that
//! still is, every projection contribution above it is reverted and the
//! cursor is reset to it, all in one transaction.

use tracing::{info, instrument};

use super::detector::{ChainStatus, ReorgDetector};
use crate::cursor::Cursor;
use crate::db::Repository;
use crate::error::{TrackerError, TrackerResult};
use crate::projections::ProjectionSet;
use crate::rpc::ChainClient;

/// Outcome of [`Reconciler::reconcile`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    /// The cursor was canonical; nothing changed.
    Synced(Cursor),
    /// Contributions above the common ancestor were reverted.
    RolledBack {
        /// Cursor reset to the common ancestor
        cursor: Cursor,
        /// Height the cursor was at before the rollback
        from_block: u64,
        /// Contributions reverted across all writers
        reverted: u64,
    },
}

impl Reconciliation {
    /// Cursor to continue from.
    #[must_use]
    pub fn cursor(&self) -> &Cursor {
        match self {
            Self::Synced(cursor) | Self::RolledBack { cursor, .. } => cursor,
        }
    }

    /// Consume into the cursor to continue from.
    #[must_use]
    pub fn into_cursor(self) -> Cursor {
        match self {
            Self::Synced(cursor) | Self::RolledBack { cursor, .. } => cursor,
        }
    }
}

/// Detects divergence and rolls the projections back to a common ancestor.
#[derive(Debug, Clone, Copy)]
pub struct Reconciler {
    detector: ReorgDetector,
}

impl Reconciler {
    /// Create a reconciler that walks back at most `max_depth` blocks.
    #[must_use]
    pub const fn new(max_depth: u64) -> Self {
        Self {
            detector: ReorgDetector::new(max_depth),
        }
    }

    /// Make sure `cursor` sits on the canonical chain.
    ///
    /// # Errors
    ///
    /// - [`TrackerError::ReorgTooDeep`](crate::error::TrackerError::ReorgTooDeep)
    ///   if no common ancestor lies within the configured depth
    /// - Chain client or store errors; the store is left unchanged
    #[instrument(skip_all, fields(stream = %cursor.stream_id, block = cursor.last_block_number))]
    pub async fn reconcile(
        &self,
        client: &dyn ChainClient,
        repo: &Repository,
        writers: &ProjectionSet,
        cursor: Cursor,
    ) -> TrackerResult<Reconciliation> {
        if self.detector.check(client, &cursor).await? == ChainStatus::Synced {
            return Ok(Reconciliation::Synced(cursor));
        }

        let history = repo
            .stored_hashes(
                &cursor.stream_id,
                cursor.last_block_number,
                self.detector.max_depth() + 1,
            )
            .await?;
        let (ancestor_number, ancestor_hash) = self
            .detector
            .find_common_ancestor(client, &cursor, &history)
            .await?;
        let ancestor = client.block(ancestor_number).await?;
        if ancestor.hash != ancestor_hash {
            return Err(TrackerError::chain_moved(
                cursor.stream_id,
                ancestor_number,
                "common ancestor replaced during reconciliation",
            ));
        }

        let reverted = repo.rollback_to(writers, &cursor.stream_id, &ancestor).await?;
        info!(
            stream = %cursor.stream_id,
            from_block = cursor.last_block_number,
            ancestor = ancestor.number,
            reverted,
            "Reorg reconciled"
        );

        Ok(Reconciliation::RolledBack {
            cursor: Cursor::new(cursor.stream_id, ancestor.number, ancestor.hash),
            from_block: cursor.last_block_number,
            reverted,
        })
    }
}

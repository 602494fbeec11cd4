//! Chain reorganization detection and reconciliation.
//!
//! ## How It Works
//!
//! 1. **Block hash history**: every committed range stores the hashes of the
//!    blocks that contributed logs, of every block still within reorg depth of
//!    the head, and of the range end
//! 2. **Divergence check**: before each range, the cursor's stored hash is
//!    compared with the canonical hash at the cursor height
//! 3. **Walk-back**: on mismatch, stored hashes are compared against canonical
//!    ones from the top down until they agree (the common ancestor), bounded by
//!    the configured maximum depth
//! 4. **Rollback**: every projection contribution above the ancestor is reverted
//!    and the cursor reset to the ancestor in one transaction; forward
//!    processing then re-applies the new branch
//!
//! ## Example
//!
//! ```rust,ignore
//! use eth_event_indexer::reorg::Reconciler;
//!
//! let reconciler = Reconciler::new(64);
//! let cursor = reconciler
//!     .reconcile(&client, &repo, &writers, cursor)
//!     .await?
//!     .into_cursor();
//! ```

pub mod detector;
pub mod reconciler;

pub use detector::{BlockRecord, ChainStatus, ReorgDetector};
pub use reconciler::{Reconciler, Reconciliation};

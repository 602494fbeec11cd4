//! Error types for the event indexer.
//!
//! This module provides a unified error type [`TrackerError`] covering every
//! failure the ingestion engine can hit, from chain access through decoding to
//! the projection store.
//!
//! # Design
//!
//! The error hierarchy follows the stages of a processing cycle:
//! - [`TrackerError::Config`]: Configuration and environment issues
//! - [`TrackerError::Rpc`]: Transient chain client failures
//! - [`TrackerError::RangeTooLarge`]: The node refused a log range (handled by bisection)
//! - [`TrackerError::FetchFailed`]: Retries exhausted for a block range
//! - [`TrackerError::Decoding`]: A recognized log could not be parsed
//! - [`TrackerError::Database`]: Projection store failures (transaction rolled back)
//! - [`TrackerError::StaleCursor`]: Attempt to move a cursor backwards without rollback
//! - [`TrackerError::ReorgTooDeep`]: Walk-back exceeded the configured depth
//! - [`TrackerError::ChainMoved`]: The chain changed underneath an in-flight range
//!
//! Every error can be classified with [`TrackerError::disposition`], which is
//! what the per-stream loop uses to decide between retrying and halting.
//!
//! # Example
//!
//! ```
//! use eth_event_indexer::error::{Disposition, TrackerError, TrackerResult};
//!
//! fn check_range(from: u64, to: u64) -> TrackerResult<()> {
//!     if to < from {
//!         return Err(TrackerError::state("inverted block range", None));
//!     }
//!     Ok(())
//! }
//!
//! let err = check_range(10, 5).unwrap_err();
//! assert_eq!(err.disposition(), Disposition::Halt);
//! ```

use thiserror::Error;

/// Boxed source error carried by most variants.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type alias using [`TrackerError`].
pub type TrackerResult<T> = Result<T, TrackerError>;

/// How the per-stream loop should react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Back off and run the cycle again from the last cursor.
    Retry,
    /// Retry a bounded number of times, then halt.
    RetryBounded,
    /// Stop the stream and surface the error to an operator.
    Halt,
}

/// Unified error type for the event indexer.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// Configuration or environment variable errors.
    #[error("Configuration error: {message}")]
    Config {
        /// Human-readable error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<BoxError>,
    },

    /// Transient chain client failure (network, timeout, node error).
    #[error("RPC error: {message}")]
    Rpc {
        /// Human-readable error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<BoxError>,
    },

    /// The node rejected a log query because the range or result set was too large.
    #[error("Block range {from}..={to} too large for the node")]
    RangeTooLarge {
        /// First block of the rejected range
        from: u64,
        /// Last block of the rejected range
        to: u64,
    },

    /// A block range could not be fetched after the configured number of attempts.
    #[error("Fetch of blocks {from}..={to} failed after {attempts} attempts: {last_error}")]
    FetchFailed {
        /// First block of the range
        from: u64,
        /// Last block of the range
        to: u64,
        /// Number of attempts made
        attempts: u32,
        /// Last error encountered
        last_error: String,
    },

    /// A log matched a registered signature but its payload could not be decoded.
    #[error("Decoding error: {message}")]
    Decoding {
        /// Human-readable error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<BoxError>,
    },

    /// Projection store failure. Any open transaction has been rolled back.
    #[error("Database error: {message}")]
    Database {
        /// Human-readable error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<BoxError>,
    },

    /// A cursor advance would not move forward and no rollback was requested.
    #[error("Stale cursor for stream {stream}: current block {current}, attempted {attempted}")]
    StaleCursor {
        /// Stream identifier
        stream: String,
        /// Block number currently stored
        current: u64,
        /// Block number the caller tried to store
        attempted: u64,
    },

    /// No common ancestor was found within the configured reorg depth.
    #[error("Reorg on stream {stream} deeper than {max_depth} blocks below {from_block}; manual resync required")]
    ReorgTooDeep {
        /// Stream identifier
        stream: String,
        /// Cursor height the walk-back started from
        from_block: u64,
        /// Configured maximum depth
        max_depth: u64,
    },

    /// The canonical chain changed while a range was in flight.
    #[error("Chain moved under stream {stream} at block {block}: {message}")]
    ChainMoved {
        /// Stream identifier
        stream: String,
        /// Block where the inconsistency was observed
        block: u64,
        /// What was inconsistent
        message: String,
    },

    /// Internal invariant violations.
    #[error("State error: {message}")]
    State {
        /// Human-readable error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<BoxError>,
    },
}

impl TrackerError {
    /// Create a new configuration error.
    ///
    /// # Example
    ///
    /// ```
    /// use eth_event_indexer::error::TrackerError;
    ///
    /// let err = TrackerError::config("RPC_URL not set", None);
    /// assert!(matches!(err, TrackerError::Config { .. }));
    /// ```
    #[must_use]
    pub fn config(message: impl Into<String>, source: Option<BoxError>) -> Self {
        Self::Config {
            message: message.into(),
            source,
        }
    }

    /// Create a new RPC error.
    #[must_use]
    pub fn rpc(message: impl Into<String>, source: Option<BoxError>) -> Self {
        Self::Rpc {
            message: message.into(),
            source,
        }
    }

    /// Create a new decoding error.
    #[must_use]
    pub fn decoding(message: impl Into<String>, source: Option<BoxError>) -> Self {
        Self::Decoding {
            message: message.into(),
            source,
        }
    }

    /// Create a new database error.
    ///
    /// # Example
    ///
    /// ```
    /// use eth_event_indexer::error::TrackerError;
    ///
    /// let err = TrackerError::database("Connection failed", None);
    /// assert!(matches!(err, TrackerError::Database { .. }));
    /// ```
    #[must_use]
    pub fn database(message: impl Into<String>, source: Option<BoxError>) -> Self {
        Self::Database {
            message: message.into(),
            source,
        }
    }

    /// Create a new state error.
    #[must_use]
    pub fn state(message: impl Into<String>, source: Option<BoxError>) -> Self {
        Self::State {
            message: message.into(),
            source,
        }
    }

    /// Create a chain-moved error for a stream.
    #[must_use]
    pub fn chain_moved(stream: impl Into<String>, block: u64, message: impl Into<String>) -> Self {
        Self::ChainMoved {
            stream: stream.into(),
            block,
            message: message.into(),
        }
    }

    /// Short, stable name of the error kind, used as a structured log field.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::Rpc { .. } => "rpc",
            Self::RangeTooLarge { .. } => "range_too_large",
            Self::FetchFailed { .. } => "fetch_failed",
            Self::Decoding { .. } => "decode_error",
            Self::Database { .. } => "write_failed",
            Self::StaleCursor { .. } => "stale_cursor",
            Self::ReorgTooDeep { .. } => "reorg_too_deep",
            Self::ChainMoved { .. } => "chain_moved",
            Self::State { .. } => "state",
        }
    }

    /// Classify the error for the per-stream retry policy.
    ///
    /// # Example
    ///
    /// ```
    /// use eth_event_indexer::error::{Disposition, TrackerError};
    ///
    /// assert_eq!(TrackerError::database("busy", None).disposition(), Disposition::Retry);
    /// assert_eq!(TrackerError::decoding("bad payload", None).disposition(), Disposition::RetryBounded);
    /// ```
    #[must_use]
    pub const fn disposition(&self) -> Disposition {
        match self {
            Self::Rpc { .. }
            | Self::RangeTooLarge { .. }
            | Self::FetchFailed { .. }
            | Self::Database { .. }
            | Self::ChainMoved { .. } => Disposition::Retry,
            Self::Decoding { .. } => Disposition::RetryBounded,
            Self::Config { .. }
            | Self::StaleCursor { .. }
            | Self::ReorgTooDeep { .. }
            | Self::State { .. } => Disposition::Halt,
        }
    }
}

impl From<sqlx::Error> for TrackerError {
    fn from(err: sqlx::Error) -> Self {
        Self::database(err.to_string(), Some(Box::new(err)))
    }
}

/// Convert from `eyre::Report` to `TrackerError`.
///
/// Reports that reach the library boundary are treated as RPC errors, which
/// the stream loop retries.
impl From<eyre::Report> for TrackerError {
    fn from(err: eyre::Report) -> Self {
        Self::Rpc {
            message: err.to_string(),
            source: None,
        }
    }
}

//! Per-stream orchestration.
//!
//! Each tracked contract is one stream, driven by its own [`StreamIndexer`].
//! A cycle takes the current cursor by value and returns the next one:
//!
//! ```text
//! reconcile ──► next range ──► fetch ──► verify headers ──► decode ──► commit
//!     │              │
//!  Reorged         Idle
//! ```
//!
//! [`StreamIndexer::run`] repeats cycles until shutdown is signalled, sleeping
//! for the poll interval when caught up and backing off on retryable errors.
//! Shutdown is checked only between cycles, so a commit in progress always
//! finishes (or rolls back) first.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::B256;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{Config, TrackedContract};
use crate::cursor::Cursor;
use crate::db::{CommitBatch, Repository};
use crate::error::{Disposition, TrackerError, TrackerResult};
use crate::events::decoder::signatures_for;
use crate::events::{DecodedEvent, DecoderRegistry, RawLog};
use crate::fetcher::LogFetcher;
use crate::metadata::{self, MetadataFetcher, NoMetadata};
use crate::projections::ProjectionSet;
use crate::reorg::{BlockRecord, Reconciler, Reconciliation};
use crate::retry::{with_jitter, Backoff, BackoffPolicy};
use crate::rpc::ChainClient;

/// Consecutive decode failures tolerated before a stream halts.
pub const DECODE_RETRY_LIMIT: u32 = 3;

/// Concurrent header lookups per range.
const HEADER_CONCURRENCY: usize = 8;

/// Outcome of one [`StreamIndexer::run_cycle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cycle {
    /// Caught up with the indexable head; nothing was fetched.
    Idle(Cursor),
    /// A range was committed.
    Advanced {
        /// Cursor at the end of the range
        cursor: Cursor,
        /// Decoded events in the range
        events: usize,
        /// Events that changed a projection
        applied: usize,
        /// Logs with no registered decoder
        unrecognized: usize,
    },
    /// The cursor had diverged and was rolled back.
    Reorged {
        /// Cursor at the common ancestor
        cursor: Cursor,
        /// Contributions reverted
        reverted: u64,
    },
}

impl Cycle {
    /// Cursor to start the next cycle from.
    #[must_use]
    pub fn into_cursor(self) -> Cursor {
        match self {
            Self::Idle(cursor) | Self::Advanced { cursor, .. } | Self::Reorged { cursor, .. } => {
                cursor
            }
        }
    }
}

/// Drives one stream: a single contract and the events it emits.
pub struct StreamIndexer {
    contract: TrackedContract,
    stream_id: String,
    start_block: u64,
    chain_id: u64,
    max_range: u64,
    confirmations: u64,
    max_reorg_depth: u64,
    poll_interval: Duration,
    retry: BackoffPolicy,
    signatures: Vec<B256>,
    registry: DecoderRegistry,
    client: Arc<dyn ChainClient>,
    fetcher: LogFetcher,
    reconciler: Reconciler,
    repo: Repository,
    writers: Arc<ProjectionSet>,
    metadata: Arc<dyn MetadataFetcher>,
}

impl std::fmt::Debug for StreamIndexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamIndexer")
            .field("stream_id", &self.stream_id)
            .field("start_block", &self.start_block)
            .field("max_range", &self.max_range)
            .field("writers", &self.writers)
            .finish_non_exhaustive()
    }
}

impl StreamIndexer {
    /// Create an indexer for `contract` with the standard projections and no
    /// metadata source.
    #[must_use]
    pub fn new(
        config: &Config,
        contract: TrackedContract,
        client: Arc<dyn ChainClient>,
        repo: Repository,
    ) -> Self {
        let fetcher = LogFetcher::new(client.clone(), config.max_range_size(), *config.retry());
        Self {
            stream_id: contract.stream_id(),
            start_block: config.start_block_for(&contract),
            chain_id: config.chain_id(),
            max_range: config.max_range_size(),
            confirmations: config.confirmations(),
            max_reorg_depth: config.max_reorg_depth(),
            poll_interval: config.poll_interval(),
            retry: *config.retry(),
            signatures: signatures_for(contract.kind),
            registry: DecoderRegistry::for_contracts(std::slice::from_ref(&contract)),
            reconciler: Reconciler::new(config.max_reorg_depth()),
            writers: Arc::new(ProjectionSet::standard()),
            metadata: Arc::new(NoMetadata),
            contract,
            client,
            fetcher,
            repo,
        }
    }

    /// Use a different set of projection writers.
    #[must_use]
    pub fn with_writers(mut self, writers: Arc<ProjectionSet>) -> Self {
        self.writers = writers;
        self
    }

    /// Use a metadata source for NFT transfers.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Arc<dyn MetadataFetcher>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Stream identifier.
    #[must_use]
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Load the stored cursor, seeding it just below the start block on first run.
    ///
    /// # Errors
    ///
    /// Returns chain client or store errors.
    pub async fn load_or_seed(&self) -> TrackerResult<Cursor> {
        if let Some(cursor) = self.repo.get_cursor(&self.stream_id).await? {
            debug!(stream = %self.stream_id, block = cursor.last_block_number, "Resuming from cursor");
            return Ok(cursor);
        }

        let seed = self.client.block(self.start_block.saturating_sub(1)).await?;
        self.repo.seed_cursor(&self.stream_id, &seed).await
    }

    /// Run one cycle from `cursor`.
    ///
    /// # Errors
    ///
    /// Any error leaves the store as it was before the cycle; the caller
    /// reloads the cursor and decides from [`TrackerError::disposition`]
    /// whether to retry.
    #[instrument(skip(self, cursor), fields(stream = %self.stream_id, cursor = cursor.last_block_number))]
    pub async fn run_cycle(&self, cursor: Cursor) -> TrackerResult<Cycle> {
        let cursor = match self
            .reconciler
            .reconcile(self.client.as_ref(), &self.repo, &self.writers, cursor)
            .await?
        {
            Reconciliation::Synced(cursor) => cursor,
            Reconciliation::RolledBack {
                cursor, reverted, ..
            } => return Ok(Cycle::Reorged { cursor, reverted }),
        };

        let head = self.client.latest_block_number().await?;
        let Some((from, to)) = self.next_range(&cursor, head) else {
            return Ok(Cycle::Idle(cursor));
        };

        match self.process_range(&cursor, head, from, to).await {
            Ok(cycle) => Ok(cycle),
            Err(e) => {
                match e.disposition() {
                    Disposition::Retry => warn!(
                        stream = %self.stream_id, from, to, kind = e.kind(), error = %e,
                        "Range failed, will retry"
                    ),
                    Disposition::RetryBounded | Disposition::Halt => error!(
                        stream = %self.stream_id, from, to, kind = e.kind(), error = %e,
                        "Range failed"
                    ),
                }
                Err(e)
            }
        }
    }

    /// Next inclusive range after `cursor`, or `None` when caught up.
    #[must_use]
    pub fn next_range(&self, cursor: &Cursor, head: u64) -> Option<(u64, u64)> {
        let indexable = head.saturating_sub(self.confirmations);
        if indexable <= cursor.last_block_number {
            return None;
        }
        let from = cursor.last_block_number + 1;
        let to = indexable.min(cursor.last_block_number.saturating_add(self.max_range));
        Some((from, to))
    }

    #[instrument(skip(self, cursor, head), fields(duration_ms = tracing::field::Empty))]
    async fn process_range(&self, cursor: &Cursor, head: u64, from: u64, to: u64) -> TrackerResult<Cycle> {
        let start = std::time::Instant::now();

        let mut logs = self
            .fetcher
            .fetch(from, to, &[self.contract.address], &self.signatures)
            .await?;
        let headers = self.headers_for(&logs, head, from, to).await?;
        self.verify_against_headers(cursor, &mut logs, &headers).await?;

        let mut events: Vec<DecodedEvent> = Vec::with_capacity(logs.len());
        let mut unrecognized = 0;
        for log in &logs {
            match self.registry.decode(log)? {
                Some(event) => events.push(event),
                None => unrecognized += 1,
            }
        }
        if unrecognized > 0 {
            debug!(stream = %self.stream_id, unrecognized, "Unrecognized logs dropped");
        }

        let metadata = metadata::prefetch(self.metadata.as_ref(), &self.repo, &events).await?;

        let end = headers.get(&to).ok_or_else(|| {
            TrackerError::state(format!("Header for range end {to} was not fetched"), None)
        })?;
        let next = Cursor::new(self.stream_id.clone(), to, end.hash);
        let batch = CommitBatch {
            stream_id: self.stream_id.clone(),
            chain_id: self.chain_id,
            from_block: from,
            events,
            blocks: headers.into_values().collect(),
            metadata,
            cursor: next.clone(),
            prune_below: to.saturating_sub(self.max_reorg_depth),
        };
        let outcome = self.repo.commit_range(&self.writers, &batch).await?;

        tracing::Span::current().record("duration_ms", start.elapsed().as_millis() as u64);
        info!(
            stream = %self.stream_id,
            from,
            to,
            events = batch.events.len(),
            applied = outcome.applied,
            unrecognized,
            "Range committed"
        );

        Ok(Cycle::Advanced {
            cursor: next,
            events: batch.events.len(),
            applied: outcome.applied,
            unrecognized,
        })
    }

    /// Headers of every block that produced a log, every block that could
    /// still be reorged, and the range end.
    async fn headers_for(
        &self,
        logs: &[RawLog],
        head: u64,
        from: u64,
        to: u64,
    ) -> TrackerResult<BTreeMap<u64, BlockRecord>> {
        let mut numbers: BTreeSet<u64> = logs.iter().map(|log| log.block_number).collect();
        let unsafe_from = from.max(head.saturating_sub(self.max_reorg_depth));
        numbers.extend(unsafe_from..=to);
        numbers.insert(to);

        let client = self.client.as_ref();
        stream::iter(numbers)
            .map(|number| async move { client.block(number).await.map(|b| (number, b)) })
            .buffered(HEADER_CONCURRENCY)
            .try_collect()
            .await
    }

    /// Abort the range if the chain moved while it was being fetched.
    async fn verify_against_headers(
        &self,
        cursor: &Cursor,
        logs: &mut [RawLog],
        headers: &BTreeMap<u64, BlockRecord>,
    ) -> TrackerResult<()> {
        for log in logs.iter_mut() {
            if log.removed {
                return Err(TrackerError::chain_moved(
                    &self.stream_id,
                    log.block_number,
                    "node returned a removed log",
                ));
            }
            let header = headers.get(&log.block_number).ok_or_else(|| {
                TrackerError::state(format!("Header for block {} was not fetched", log.block_number), None)
            })?;
            if header.hash != log.block_hash {
                return Err(TrackerError::chain_moved(
                    &self.stream_id,
                    log.block_number,
                    format!("log block hash {} differs from header {}", log.block_hash, header.hash),
                ));
            }
            log.block_timestamp.get_or_insert(header.timestamp);
        }

        let first = cursor.last_block_number + 1;
        let parent = match headers.get(&first) {
            Some(header) => header.parent_hash,
            None => self.client.block_hash(cursor.last_block_number).await?,
        };
        if parent != cursor.last_block_hash {
            return Err(TrackerError::chain_moved(
                &self.stream_id,
                cursor.last_block_number,
                "cursor block replaced during fetch",
            ));
        }
        Ok(())
    }

    /// Run cycles until `shutdown` turns true.
    ///
    /// # Errors
    ///
    /// Returns the error that halted the stream.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> TrackerResult<()> {
        info!(
            stream = %self.stream_id,
            start_block = self.start_block,
            writers = ?self.writers.names(),
            "Stream started"
        );

        let mut cursor: Option<Cursor> = None;
        let mut backoff = self.retry.start();
        let mut decode_failures = 0u32;

        loop {
            if *shutdown.borrow() {
                info!(stream = %self.stream_id, "Shutdown requested, stream stopped");
                return Ok(());
            }

            let result = match cursor.take() {
                Some(current) => self.run_cycle(current).await,
                None => match self.load_or_seed().await {
                    Ok(current) => self.run_cycle(current).await,
                    Err(e) => Err(e),
                },
            };

            let wait = match result {
                Ok(cycle) => {
                    backoff.reset();
                    decode_failures = 0;
                    let idle = matches!(cycle, Cycle::Idle(_));
                    if let Cycle::Reorged { cursor: c, reverted } = &cycle {
                        warn!(stream = %self.stream_id, ancestor = c.last_block_number, reverted, "Stream rolled back");
                    }
                    cursor = Some(cycle.into_cursor());
                    idle.then_some(self.poll_interval)
                }
                Err(e) => Some(self.retry_delay(e, &mut backoff, &mut decode_failures)?),
            };

            if let Some(wait) = wait {
                tokio::select! {
                    () = tokio::time::sleep(wait) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            info!(stream = %self.stream_id, "Shutdown channel closed, stream stopped");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    fn retry_delay(
        &self,
        err: TrackerError,
        backoff: &mut Backoff,
        decode_failures: &mut u32,
    ) -> TrackerResult<Duration> {
        match err.disposition() {
            Disposition::Halt => {
                error!(stream = %self.stream_id, kind = err.kind(), error = %err, "Stream halted");
                Err(err)
            }
            Disposition::RetryBounded => {
                *decode_failures += 1;
                if *decode_failures >= DECODE_RETRY_LIMIT {
                    error!(
                        stream = %self.stream_id,
                        kind = err.kind(),
                        attempts = *decode_failures,
                        error = %err,
                        "Stream halted after repeated decode failures"
                    );
                    return Err(err);
                }
                Ok(with_jitter(self.retry.delay_for(*decode_failures - 1)))
            }
            Disposition::Retry => {
                let delay = backoff.next_delay().unwrap_or(self.retry.max_delay);
                debug!(stream = %self.stream_id, kind = err.kind(), delay_ms = delay.as_millis() as u64, "Backing off");
                Ok(with_jitter(delay))
            }
        }
    }
}

/// Run every configured stream concurrently until shutdown or until each halts.
///
/// Returns the outcome of each stream by id.
pub async fn run_streams(
    config: &Config,
    client: Arc<dyn ChainClient>,
    repo: Repository,
    metadata: Arc<dyn MetadataFetcher>,
    shutdown: watch::Receiver<bool>,
) -> Vec<(String, TrackerResult<()>)> {
    let writers = Arc::new(ProjectionSet::standard());
    let mut tasks = JoinSet::new();

    for contract in config.contracts() {
        let indexer = StreamIndexer::new(config, contract.clone(), client.clone(), repo.clone())
            .with_writers(writers.clone())
            .with_metadata(metadata.clone());
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            let result = indexer.run(shutdown).await;
            (indexer.stream_id, result)
        });
    }

    let mut outcomes = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => {
                error!(error = %e, "Stream task aborted");
                outcomes.push((
                    "unknown".to_string(),
                    Err(TrackerError::state("Stream task aborted", Some(Box::new(e)))),
                ));
            }
        }
    }
    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContractKind;
    use crate::db::create_pool;
    use alloy::primitives::{address, Address};
    use async_trait::async_trait;

    struct FlatChain {
        head: u64,
    }

    #[async_trait]
    impl ChainClient for FlatChain {
        async fn latest_block_number(&self) -> TrackerResult<u64> {
            Ok(self.head)
        }

        async fn get_logs(&self, _: u64, _: u64, _: &[Address], _: &[B256]) -> TrackerResult<Vec<RawLog>> {
            Ok(Vec::new())
        }

        async fn block(&self, number: u64) -> TrackerResult<BlockRecord> {
            let hash = |n: u64| B256::left_padding_from(&n.to_be_bytes());
            Ok(BlockRecord::new(number, hash(number + 1), hash(number), number * 12))
        }
    }

    async fn indexer(head: u64, config: Config) -> StreamIndexer {
        let contract = TrackedContract::new(
            ContractKind::Erc20,
            address!("00000000000000000000000000000000000000aa"),
        );
        let repo = Repository::new(create_pool("sqlite::memory:").await.unwrap());
        StreamIndexer::new(&config, contract, Arc::new(FlatChain { head }), repo)
    }

    fn config() -> Config {
        Config::new("http://localhost:8545", "sqlite::memory:")
            .with_max_range_size(10)
            .with_max_reorg_depth(5)
    }

    #[tokio::test]
    async fn test_next_range_respects_bounds() {
        let indexer = indexer(100, config().with_confirmations(2)).await;
        let cursor = |n| Cursor::new("s", n, B256::ZERO);

        assert_eq!(indexer.next_range(&cursor(50), 100), Some((51, 60)));
        assert_eq!(indexer.next_range(&cursor(95), 100), Some((96, 98)));
        assert_eq!(indexer.next_range(&cursor(98), 100), None);
        assert_eq!(indexer.next_range(&cursor(99), 100), None);
    }

    #[tokio::test]
    async fn test_seed_then_catch_up() {
        let indexer = indexer(25, config().with_start_block(3)).await;

        let cursor = indexer.load_or_seed().await.unwrap();
        assert_eq!(cursor.last_block_number, 2);

        let cursor = match indexer.run_cycle(cursor).await.unwrap() {
            Cycle::Advanced { cursor, events, .. } => {
                assert_eq!((cursor.last_block_number, events), (12, 0));
                cursor
            }
            other => panic!("expected progress, got {other:?}"),
        };

        let cursor = indexer.run_cycle(cursor).await.unwrap().into_cursor();
        let cursor = indexer.run_cycle(cursor).await.unwrap().into_cursor();
        assert_eq!(cursor.last_block_number, 25);
        assert!(matches!(indexer.run_cycle(cursor).await.unwrap(), Cycle::Idle(_)));

        // A restart resumes from the stored cursor
        assert_eq!(indexer.load_or_seed().await.unwrap().last_block_number, 25);
    }

    #[tokio::test]
    async fn test_run_honors_shutdown() {
        let indexer = indexer(5, config()).await;
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        assert!(indexer.run(rx).await.is_ok());
    }

    #[tokio::test]
    async fn test_decode_failures_halt_after_limit() {
        let indexer = indexer(5, config()).await;
        let mut backoff = indexer.retry.start();
        let mut failures = 0;
        for _ in 1..DECODE_RETRY_LIMIT {
            assert!(indexer
                .retry_delay(TrackerError::decoding("bad", None), &mut backoff, &mut failures)
                .is_ok());
        }
        assert!(indexer
            .retry_delay(TrackerError::decoding("bad", None), &mut backoff, &mut failures)
            .is_err());
        assert!(indexer
            .retry_delay(TrackerError::rpc("down", None), &mut backoff, &mut failures)
            .is_ok());
    }
}

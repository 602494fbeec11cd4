//! Range-bounded log fetching.
//!
//! [`LogFetcher::fetch`] returns every matching log in an inclusive block range,
//! sorted by `(block_number, log_index)`. Two failure modes are handled here:
//!
//! - The node refuses the range as too large: the range is split in half and
//!   both halves are fetched, recursively, down to single blocks.
//! - Transient errors: the same sub-range is retried with exponential backoff
//!   and jitter until the attempt budget is spent.
//!
//! Partial results never leave this module; a range either completes or fails
//! as a whole.

use std::collections::VecDeque;
use std::sync::Arc;

use alloy::primitives::{Address, B256};
use tracing::{debug, instrument, warn};

use crate::error::{TrackerError, TrackerResult};
use crate::events::RawLog;
use crate::retry::{with_jitter, BackoffPolicy};
use crate::rpc::ChainClient;

/// Fetches logs for a block range with bisection and retry.
#[derive(Clone)]
pub struct LogFetcher {
    client: Arc<dyn ChainClient>,
    max_range: u64,
    retry: BackoffPolicy,
}

impl std::fmt::Debug for LogFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogFetcher")
            .field("max_range", &self.max_range)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl LogFetcher {
    /// Create a fetcher that accepts ranges of at most `max_range` blocks.
    #[must_use]
    pub fn new(client: Arc<dyn ChainClient>, max_range: u64, retry: BackoffPolicy) -> Self {
        Self {
            client,
            max_range,
            retry,
        }
    }

    /// Fetch all logs in `[from, to]` emitted by `addresses` with a topic0 in
    /// `signatures`.
    ///
    /// # Errors
    ///
    /// - [`TrackerError::State`] if the range is empty or wider than `max_range`
    /// - [`TrackerError::FetchFailed`] if a sub-range still fails after the retry
    ///   budget, or a single block is refused as too large
    #[instrument(skip(self, addresses, signatures), fields(logs = tracing::field::Empty, duration_ms = tracing::field::Empty))]
    pub async fn fetch(
        &self,
        from: u64,
        to: u64,
        addresses: &[Address],
        signatures: &[B256],
    ) -> TrackerResult<Vec<RawLog>> {
        if from > to {
            return Err(TrackerError::state(
                format!("Empty block range {from}..={to}"),
                None,
            ));
        }
        if to - from + 1 > self.max_range {
            return Err(TrackerError::state(
                format!(
                    "Block range {from}..={to} exceeds the maximum of {} blocks",
                    self.max_range
                ),
                None,
            ));
        }

        let start = std::time::Instant::now();
        let mut pending = VecDeque::from([(from, to)]);
        let mut logs = Vec::new();

        // Front of the queue is always the lowest unfetched sub-range
        while let Some((lo, hi)) = pending.pop_front() {
            match self.fetch_with_retry(lo, hi, addresses, signatures).await {
                Ok(mut batch) => logs.append(&mut batch),
                Err(TrackerError::RangeTooLarge { .. }) if lo < hi => {
                    let mid = lo + (hi - lo) / 2;
                    debug!(from = lo, to = hi, mid, "Range too large, bisecting");
                    pending.push_front((mid + 1, hi));
                    pending.push_front((lo, mid));
                }
                Err(TrackerError::RangeTooLarge { .. }) => {
                    return Err(TrackerError::FetchFailed {
                        from: lo,
                        to: hi,
                        attempts: 1,
                        last_error: "node refused a single-block range as too large".to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        logs.sort_by_key(|log| (log.block_number, log.log_index));

        let span = tracing::Span::current();
        span.record("logs", logs.len());
        span.record("duration_ms", start.elapsed().as_millis() as u64);
        Ok(logs)
    }

    async fn fetch_with_retry(
        &self,
        from: u64,
        to: u64,
        addresses: &[Address],
        signatures: &[B256],
    ) -> TrackerResult<Vec<RawLog>> {
        let mut backoff = self.retry.start();
        loop {
            let err = match self.client.get_logs(from, to, addresses, signatures).await {
                Ok(logs) => return Ok(logs),
                Err(e @ TrackerError::RangeTooLarge { .. }) => return Err(e),
                Err(e) => e,
            };

            let Some(delay) = backoff.next_delay() else {
                return Err(TrackerError::FetchFailed {
                    from,
                    to,
                    attempts: backoff.attempts(),
                    last_error: err.to_string(),
                });
            };
            let delay = with_jitter(delay);
            warn!(
                from,
                to,
                attempt = backoff.attempts(),
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Log fetch failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reorg::BlockRecord;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    /// One log per block; refuses ranges wider than `cap` and fails the first
    /// `failures` calls.
    struct ScriptedNode {
        cap: u64,
        failures: Mutex<u32>,
        calls: Mutex<Vec<(u64, u64)>>,
    }

    impl ScriptedNode {
        fn new(cap: u64, failures: u32) -> Arc<Self> {
            Arc::new(Self {
                cap,
                failures: Mutex::new(failures),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ChainClient for ScriptedNode {
        async fn latest_block_number(&self) -> TrackerResult<u64> {
            Ok(u64::MAX)
        }

        async fn get_logs(&self, from: u64, to: u64, _: &[Address], _: &[B256]) -> TrackerResult<Vec<RawLog>> {
            self.calls.lock().unwrap().push((from, to));
            {
                let mut failures = self.failures.lock().unwrap();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(TrackerError::rpc("connection reset", None));
                }
            }
            if to - from + 1 > self.cap {
                return Err(TrackerError::RangeTooLarge { from, to });
            }
            // Returned newest first to exercise sorting
            Ok((from..=to)
                .rev()
                .map(|n| RawLog {
                    block_number: n,
                    block_hash: B256::with_last_byte(n as u8),
                    tx_hash: B256::ZERO,
                    log_index: 0,
                    address: Address::ZERO,
                    topics: Vec::new(),
                    data: Default::default(),
                    removed: false,
                    block_timestamp: None,
                })
                .collect())
        }

        async fn block(&self, number: u64) -> TrackerResult<BlockRecord> {
            Ok(BlockRecord::new(number, B256::ZERO, B256::ZERO, 0))
        }
    }

    fn policy(attempts: u32) -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(2), attempts)
    }

    #[tokio::test]
    async fn test_bisection_covers_range_in_order() {
        let node = ScriptedNode::new(3, 0);
        let fetcher = LogFetcher::new(node.clone(), 100, policy(3));

        let logs = fetcher.fetch(10, 19, &[], &[]).await.unwrap();
        let blocks: Vec<u64> = logs.iter().map(|l| l.block_number).collect();
        assert_eq!(blocks, (10..=19).collect::<Vec<_>>());

        // Every accepted sub-range respected the node cap
        let calls = node.calls.lock().unwrap();
        assert_eq!(calls[0], (10, 19));
        assert!(calls.len() > 1);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let node = ScriptedNode::new(100, 2);
        let fetcher = LogFetcher::new(node.clone(), 100, policy(3));

        let logs = fetcher.fetch(1, 5, &[], &[]).await.unwrap();
        assert_eq!(logs.len(), 5);
        assert_eq!(node.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let node = ScriptedNode::new(100, 10);
        let fetcher = LogFetcher::new(node, 100, policy(3));

        let err = fetcher.fetch(1, 5, &[], &[]).await.unwrap_err();
        match err {
            TrackerError::FetchFailed {
                from,
                to,
                attempts,
                last_error,
            } => {
                assert_eq!((from, to, attempts), (1, 5, 3));
                assert!(last_error.contains("connection reset"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_single_block_refused() {
        let node = ScriptedNode::new(0, 0);
        let fetcher = LogFetcher::new(node, 100, policy(3));
        let err = fetcher.fetch(7, 8, &[], &[]).await.unwrap_err();
        assert!(matches!(err, TrackerError::FetchFailed { from: 7, to: 7, .. }));
    }

    #[tokio::test]
    async fn test_rejects_oversized_and_empty_ranges() {
        let fetcher = LogFetcher::new(ScriptedNode::new(100, 0), 10, policy(3));
        assert!(matches!(
            fetcher.fetch(1, 11, &[], &[]).await,
            Err(TrackerError::State { .. })
        ));
        assert!(matches!(
            fetcher.fetch(5, 4, &[], &[]).await,
            Err(TrackerError::State { .. })
        ));
        assert_eq!(fetcher.fetch(1, 10, &[], &[]).await.unwrap().len(), 10);
    }
}

//! Shared fixtures for integration tests: a scripted in-memory chain and
//! helpers to build indexers over it.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use alloy::primitives::{address, keccak256, Address, B256, U256};
use alloy::sol_types::SolEvent;
use async_trait::async_trait;
use sqlx::SqliteConnection;

use eth_event_indexer::config::{Config, ContractKind, TrackedContract};
use eth_event_indexer::cursor::Cursor;
use eth_event_indexer::db::{create_pool, Repository};
use eth_event_indexer::error::{TrackerError, TrackerResult};
use eth_event_indexer::events::abi::IERC20;
use eth_event_indexer::events::{DecodedEvent, RawLog};
use eth_event_indexer::indexer::{Cycle, StreamIndexer};
use eth_event_indexer::projections::{ApplyContext, ProjectionWriter};
use eth_event_indexer::reorg::BlockRecord;
use eth_event_indexer::rpc::ChainClient;

pub const TOKEN: Address = address!("00000000000000000000000000000000000000aa");
pub const ALICE: Address = address!("000000000000000000000000000000000000000a");
pub const BOB: Address = address!("000000000000000000000000000000000000000b");
pub const CAROL: Address = address!("000000000000000000000000000000000000000c");

/// Seconds between mock blocks.
pub const BLOCK_TIME: u64 = 12;
/// Timestamp of block 0.
pub const GENESIS_TIME: u64 = 1_700_000_000;

#[derive(Debug, Clone)]
struct MockBlock {
    hash: B256,
    parent_hash: B256,
    /// Logs without block identity; filled in when served
    logs: Vec<(Address, Vec<B256>, alloy::primitives::Bytes)>,
}

#[derive(Debug, Default)]
struct ChainState {
    blocks: Vec<MockBlock>,
    transient_failures: u32,
    range_cap: Option<u64>,
}

/// Scripted chain: blocks with deterministic hashes, logs per block, reorgs,
/// transient failures and a log range cap.
#[derive(Debug, Default)]
pub struct MockChain {
    state: Mutex<ChainState>,
    get_logs_calls: AtomicUsize,
}

/// Deterministic hash of block `number` on fork `fork`.
pub fn block_hash(number: u64, fork: u64) -> B256 {
    keccak256(format!("block:{number}:fork:{fork}"))
}

impl MockChain {
    /// A chain with blocks `0..=height` on fork 0.
    pub fn new(height: u64) -> Arc<Self> {
        let chain = Self::default();
        chain.extend_to(height, 0);
        Arc::new(chain)
    }

    /// Append blocks up to `height`, hashed with `fork`.
    pub fn extend_to(&self, height: u64, fork: u64) {
        let mut state = self.state.lock().unwrap();
        while (state.blocks.len() as u64) <= height {
            let number = state.blocks.len() as u64;
            let parent_hash = state.blocks.last().map_or(B256::ZERO, |b| b.hash);
            state.blocks.push(MockBlock {
                hash: block_hash(number, fork),
                parent_hash,
                logs: Vec::new(),
            });
        }
    }

    /// Replace blocks `from..` with empty blocks on `fork`, keeping the height.
    pub fn reorg_from(&self, from: u64, fork: u64) {
        let height = {
            let mut state = self.state.lock().unwrap();
            let height = state.blocks.len() as u64 - 1;
            state.blocks.truncate(from as usize);
            height
        };
        self.extend_to(height, fork);
    }

    /// Current canonical hash at `number`.
    pub fn hash(&self, number: u64) -> B256 {
        self.state.lock().unwrap().blocks[number as usize].hash
    }

    pub fn head(&self) -> u64 {
        self.state.lock().unwrap().blocks.len() as u64 - 1
    }

    /// Emit `event` from `address` in `block`.
    pub fn emit<E: SolEvent>(&self, block: u64, address: Address, event: &E) {
        let data = event.encode_log_data();
        self.state.lock().unwrap().blocks[block as usize].logs.push((
            address,
            data.topics().to_vec(),
            data.data,
        ));
    }

    /// Emit an ERC20 `Transfer` from [`TOKEN`].
    pub fn transfer(&self, block: u64, from: Address, to: Address, value: u64) {
        self.emit(
            block,
            TOKEN,
            &IERC20::Transfer {
                from,
                to,
                value: U256::from(value),
            },
        );
    }

    /// Fail the next `n` log queries with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.state.lock().unwrap().transient_failures = n;
    }

    /// Refuse log queries spanning more than `cap` blocks.
    pub fn set_range_cap(&self, cap: u64) {
        self.state.lock().unwrap().range_cap = Some(cap);
    }

    pub fn get_logs_calls(&self) -> usize {
        self.get_logs_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn latest_block_number(&self) -> TrackerResult<u64> {
        Ok(self.head())
    }

    async fn get_logs(
        &self,
        from: u64,
        to: u64,
        addresses: &[Address],
        signatures: &[B256],
    ) -> TrackerResult<Vec<RawLog>> {
        self.get_logs_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();

        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(TrackerError::rpc("503 Service Unavailable", None));
        }
        if state.range_cap.is_some_and(|cap| to - from + 1 > cap) {
            return Err(TrackerError::RangeTooLarge { from, to });
        }

        let mut logs = Vec::new();
        for number in from..=to.min(state.blocks.len() as u64 - 1) {
            let block = &state.blocks[number as usize];
            for (log_index, (address, topics, data)) in block.logs.iter().enumerate() {
                let matches_address = addresses.is_empty() || addresses.contains(address);
                let matches_topic = signatures.is_empty()
                    || topics.first().is_some_and(|t| signatures.contains(t));
                if matches_address && matches_topic {
                    logs.push(RawLog {
                        block_number: number,
                        block_hash: block.hash,
                        tx_hash: keccak256(format!("tx:{number}:{log_index}")),
                        log_index: log_index as u64,
                        address: *address,
                        topics: topics.clone(),
                        data: data.clone(),
                        removed: false,
                        block_timestamp: None,
                    });
                }
            }
        }
        Ok(logs)
    }

    async fn block(&self, number: u64) -> TrackerResult<BlockRecord> {
        let state = self.state.lock().unwrap();
        let block = state
            .blocks
            .get(number as usize)
            .ok_or_else(|| TrackerError::rpc(format!("block {number} not found"), None))?;
        Ok(BlockRecord::new(
            number,
            block.hash,
            block.parent_hash,
            GENESIS_TIME + number * BLOCK_TIME,
        ))
    }
}

/// Counts writer invocations; changes nothing. Clones share the counters.
#[derive(Debug, Clone, Default)]
pub struct CountingWriter {
    pub applied: Arc<AtomicUsize>,
    pub reverted: Arc<AtomicUsize>,
    pub pruned: Arc<AtomicUsize>,
}

#[async_trait]
impl ProjectionWriter for CountingWriter {
    fn name(&self) -> &'static str {
        "counting"
    }

    async fn apply(
        &self,
        _: &mut SqliteConnection,
        _: &ApplyContext<'_>,
        _: &DecodedEvent,
    ) -> TrackerResult<bool> {
        self.applied.fetch_add(1, Ordering::SeqCst);
        Ok(false)
    }

    async fn revert_block(&self, _: &mut SqliteConnection, _: &str, _: u64) -> TrackerResult<u64> {
        self.reverted.fetch_add(1, Ordering::SeqCst);
        Ok(0)
    }

    async fn prune_below(&self, _: &mut SqliteConnection, _: &str, _: u64) -> TrackerResult<()> {
        self.pruned.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn erc20_contract() -> TrackedContract {
    TrackedContract::new(ContractKind::Erc20, TOKEN)
}

pub fn test_config() -> Config {
    Config::new("http://localhost:8545", "sqlite::memory:")
        .with_start_block(1)
        .with_max_range_size(10)
        .with_max_reorg_depth(100)
        .with_retry(eth_event_indexer::retry::BackoffPolicy::new(
            std::time::Duration::from_millis(1),
            std::time::Duration::from_millis(5),
            4,
        ))
        .with_contracts(vec![erc20_contract()])
}

pub async fn memory_repo() -> Repository {
    Repository::new(create_pool("sqlite::memory:").await.unwrap())
}

pub fn indexer(config: &Config, chain: &Arc<MockChain>, repo: &Repository) -> StreamIndexer {
    StreamIndexer::new(config, erc20_contract(), chain.clone(), repo.clone())
}

/// Run cycles until the stream is idle; returns the final cursor.
pub async fn run_until_idle(indexer: &StreamIndexer) -> Cursor {
    let mut cursor = indexer.load_or_seed().await.unwrap();
    for _ in 0..1_000 {
        match indexer.run_cycle(cursor).await.unwrap() {
            Cycle::Idle(idle) => return idle,
            other => cursor = other.into_cursor(),
        }
    }
    panic!("stream did not catch up");
}

/// Everything a reader can observe in the projections, without row ids.
#[derive(Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub events: Vec<(i64, String, i64, String, String)>,
    pub erc20: Vec<(String, String, String, i64)>,
    pub charts: Vec<(String, i64, String, String, i64)>,
}

pub async fn snapshot(repo: &Repository) -> Snapshot {
    let pool = repo.pool();
    Snapshot {
        events: sqlx::query_as(
            "SELECT block_number, block_hash, log_index, kind, payload FROM events ORDER BY block_number, log_index",
        )
        .fetch_all(pool)
        .await
        .unwrap(),
        erc20: sqlx::query_as(
            "SELECT owner, token, balance, last_block_number FROM erc20_balances ORDER BY owner, token",
        )
        .fetch_all(pool)
        .await
        .unwrap(),
        charts: sqlx::query_as(
            "SELECT granularity, bucket_start, metric, value, last_block_number FROM chart_buckets ORDER BY granularity, bucket_start, metric",
        )
        .fetch_all(pool)
        .await
        .unwrap(),
    }
}

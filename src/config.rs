//! Configuration management for the event indexer.
//!
//! This module handles loading and validating configuration from environment variables
//! using the `dotenvy` crate. All operations return [`TrackerResult`] for comprehensive
//! error handling.
//!
//! ## Environment Variables
//!
//! Required:
//! - `RPC_URL`: Chain client endpoint (or `ALCHEMY_API_KEY` for an Alchemy mainnet URL)
//! - `TRACKED_CONTRACTS`: Comma-separated `kind:address[@start_block]` entries
//!
//! Optional (with defaults):
//! - `DATABASE_URL`: SQLite projection store (default: `sqlite:./eventindexer.db`)
//! - `CHAIN_ID`: Chain id recorded on event rows (default: 1)
//! - `START_BLOCK`: Start block for contracts without their own (default: 0)
//! - `MAX_RANGE_SIZE`: Maximum blocks per log query (default: 1000)
//! - `POLL_INTERVAL_SECS`: Idle wait when caught up with the head (default: 12)
//! - `MAX_REORG_DEPTH`: Walk-back bound before halting (default: 64)
//! - `CONFIRMATIONS`: Blocks behind head left unindexed (default: 0)
//! - `FETCH_MAX_ATTEMPTS`: Transient retry bound (default: 5)
//! - `RETRY_BASE_DELAY_MS` / `RETRY_MAX_DELAY_MS`: Backoff bounds (default: 500 / 30000)
//!
//! ## Example
//!
//! ```no_run
//! use eth_event_indexer::config::Config;
//! use eth_event_indexer::error::TrackerResult;
//!
//! # fn main() -> TrackerResult<()> {
//! let config = Config::from_env()?;
//! println!("Tracking {} contracts", config.contracts().len());
//! # Ok(())
//! # }
//! ```

use crate::error::{TrackerError, TrackerResult};
use crate::retry::BackoffPolicy;
use alloy::primitives::Address;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// The contract standard or protocol a tracked address implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContractKind {
    /// Fungible token emitting `Transfer(address,address,uint256)`.
    Erc20,
    /// Non-fungible token emitting `Transfer` with an indexed token id.
    Erc721,
    /// Multi-token contract emitting `TransferSingle` / `TransferBatch`.
    Erc1155,
    /// Cross-chain bridge emitting `MessageSent`.
    Bridge,
    /// Rollup inbox emitting `BlockProposed`.
    Rollup,
}

impl ContractKind {
    /// Lowercase name used in stream ids and configuration.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Erc20 => "erc20",
            Self::Erc721 => "erc721",
            Self::Erc1155 => "erc1155",
            Self::Bridge => "bridge",
            Self::Rollup => "rollup",
        }
    }
}

impl fmt::Display for ContractKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContractKind {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "erc20" => Ok(Self::Erc20),
            "erc721" => Ok(Self::Erc721),
            "erc1155" => Ok(Self::Erc1155),
            "bridge" => Ok(Self::Bridge),
            "rollup" => Ok(Self::Rollup),
            other => Err(TrackerError::config(
                format!("Unknown contract kind '{other}' (expected erc20, erc721, erc1155, bridge or rollup)"),
                None,
            )),
        }
    }
}

/// A contract the indexer follows. Each one is ingested as its own stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedContract {
    /// Contract standard
    pub kind: ContractKind,
    /// Contract address
    pub address: Address,
    /// First block to index; falls back to [`Config::start_block`]
    pub start_block: Option<u64>,
}

impl TrackedContract {
    /// Create a tracked contract without its own start block.
    #[must_use]
    pub const fn new(kind: ContractKind, address: Address) -> Self {
        Self {
            kind,
            address,
            start_block: None,
        }
    }

    /// Set the first block to index for this contract.
    #[must_use]
    pub const fn starting_at(mut self, block: u64) -> Self {
        self.start_block = Some(block);
        self
    }

    /// Stream identifier, `"<kind>:<address>"`.
    #[must_use]
    pub fn stream_id(&self) -> String {
        format!("{}:{:?}", self.kind, self.address)
    }
}

impl FromStr for TrackedContract {
    type Err = TrackerError;

    /// Parse `kind:address` or `kind:address@start_block`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, rest) = s.trim().split_once(':').ok_or_else(|| {
            TrackerError::config(
                format!("Tracked contract '{s}' must look like kind:address[@start_block]"),
                None,
            )
        })?;
        let kind = kind.parse::<ContractKind>()?;

        let (address, start_block) = match rest.split_once('@') {
            Some((address, start)) => {
                let start = start.trim().parse::<u64>().map_err(|e| {
                    TrackerError::config(
                        format!("Invalid start block in tracked contract '{s}'"),
                        Some(Box::new(e)),
                    )
                })?;
                (address, Some(start))
            }
            None => (rest, None),
        };

        let address = address.trim().parse::<Address>().map_err(|e| {
            TrackerError::config(
                format!("Invalid address in tracked contract '{s}'"),
                Some(Box::new(e)),
            )
        })?;

        Ok(Self {
            kind,
            address,
            start_block,
        })
    }
}

/// Main configuration struct for the indexer.
///
/// Contains all runtime configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Chain client endpoint
    rpc_url: String,

    /// SQLite connection string
    database_url: String,

    /// Chain id recorded on event rows
    chain_id: u64,

    /// Default first block for streams
    start_block: u64,

    /// Maximum blocks per log query
    max_range_size: u64,

    /// Idle wait when caught up
    poll_interval: Duration,

    /// Walk-back bound for reorg reconciliation
    max_reorg_depth: u64,

    /// Blocks behind head that are not indexed yet
    confirmations: u64,

    /// Retry policy for transient failures
    retry: BackoffPolicy,

    /// Contracts to index
    contracts: Vec<TrackedContract>,
}

impl Config {
    /// Create a configuration with default tuning and no tracked contracts.
    #[must_use]
    pub fn new(rpc_url: impl Into<String>, database_url: impl Into<String>) -> Self {
        Self {
            rpc_url: rpc_url.into(),
            database_url: database_url.into(),
            chain_id: 1,
            start_block: 0,
            max_range_size: 1000,
            poll_interval: Duration::from_secs(12),
            max_reorg_depth: 64,
            confirmations: 0,
            retry: BackoffPolicy::default(),
            contracts: Vec::new(),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// This function:
    /// 1. Loads `.env` file using `dotenvy` (if present)
    /// 2. Reads and validates all environment variables
    /// 3. Applies defaults for optional variables
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Neither `RPC_URL` nor `ALCHEMY_API_KEY` is set
    /// - `TRACKED_CONTRACTS` is missing or malformed
    /// - A numeric variable does not parse
    pub fn from_env() -> TrackerResult<Self> {
        // Load .env file if present (ignore error if file doesn't exist)
        dotenvy::dotenv().ok();

        let rpc_url = match env::var("RPC_URL") {
            Ok(url) if !url.is_empty() => url,
            _ => {
                let key = env::var("ALCHEMY_API_KEY").map_err(|e| {
                    TrackerError::config(
                        "RPC_URL or ALCHEMY_API_KEY environment variable is required",
                        Some(Box::new(e)),
                    )
                })?;
                if key.is_empty() || key == "your_alchemy_api_key_here" {
                    return Err(TrackerError::config(
                        "ALCHEMY_API_KEY must be set to a valid Alchemy API key",
                        None,
                    ));
                }
                format!("https://eth-mainnet.g.alchemy.com/v2/{key}")
            }
        };

        let database_url = database_url_from_env();

        let contracts = parse_contracts(&env::var("TRACKED_CONTRACTS").map_err(|e| {
            TrackerError::config(
                "TRACKED_CONTRACTS environment variable is required",
                Some(Box::new(e)),
            )
        })?)?;

        let retry = BackoffPolicy::new(
            Duration::from_millis(env_u64("RETRY_BASE_DELAY_MS", 500)?),
            Duration::from_millis(env_u64("RETRY_MAX_DELAY_MS", 30_000)?),
            u32::try_from(env_u64("FETCH_MAX_ATTEMPTS", 5)?).map_err(|e| {
                TrackerError::config("FETCH_MAX_ATTEMPTS is out of range", Some(Box::new(e)))
            })?,
        );

        let config = Self::new(rpc_url, database_url)
            .with_chain_id(env_u64("CHAIN_ID", 1)?)
            .with_start_block(env_u64("START_BLOCK", 0)?)
            .with_max_range_size(env_u64("MAX_RANGE_SIZE", 1000)?)
            .with_poll_interval(Duration::from_secs(env_u64("POLL_INTERVAL_SECS", 12)?))
            .with_max_reorg_depth(env_u64("MAX_REORG_DEPTH", 64)?)
            .with_confirmations(env_u64("CONFIRMATIONS", 0)?)
            .with_retry(retry)
            .with_contracts(contracts);

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a bound is zero, no contracts are
    /// tracked, or the same contract appears twice.
    pub fn validate(&self) -> TrackerResult<()> {
        if self.max_range_size == 0 {
            return Err(TrackerError::config("MAX_RANGE_SIZE must be at least 1", None));
        }
        if self.max_reorg_depth == 0 {
            return Err(TrackerError::config("MAX_REORG_DEPTH must be at least 1", None));
        }
        if self.retry.max_attempts == 0 {
            return Err(TrackerError::config("FETCH_MAX_ATTEMPTS must be at least 1", None));
        }
        if self.contracts.is_empty() {
            return Err(TrackerError::config(
                "At least one tracked contract is required",
                None,
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for contract in &self.contracts {
            if !seen.insert(contract.address) {
                return Err(TrackerError::config(
                    format!("Contract {:?} is tracked more than once", contract.address),
                    None,
                ));
            }
        }
        Ok(())
    }

    /// Set the chain id.
    #[must_use]
    pub const fn with_chain_id(mut self, chain_id: u64) -> Self {
        self.chain_id = chain_id;
        self
    }

    /// Set the default start block.
    #[must_use]
    pub const fn with_start_block(mut self, block: u64) -> Self {
        self.start_block = block;
        self
    }

    /// Set the maximum range size for log queries.
    #[must_use]
    pub const fn with_max_range_size(mut self, size: u64) -> Self {
        self.max_range_size = size;
        self
    }

    /// Set the idle poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the maximum reorg depth.
    #[must_use]
    pub const fn with_max_reorg_depth(mut self, depth: u64) -> Self {
        self.max_reorg_depth = depth;
        self
    }

    /// Set the number of confirmations to wait for.
    #[must_use]
    pub const fn with_confirmations(mut self, confirmations: u64) -> Self {
        self.confirmations = confirmations;
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: BackoffPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Replace the tracked contracts.
    #[must_use]
    pub fn with_contracts(mut self, contracts: Vec<TrackedContract>) -> Self {
        self.contracts = contracts;
        self
    }

    /// Get the chain client endpoint.
    #[must_use]
    pub fn rpc_url(&self) -> &str {
        &self.rpc_url
    }

    /// Get the database connection string.
    #[must_use]
    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    /// Get the chain id.
    #[must_use]
    pub const fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Get the default start block.
    #[must_use]
    pub const fn start_block(&self) -> u64 {
        self.start_block
    }

    /// Get the maximum blocks per log query.
    #[must_use]
    pub const fn max_range_size(&self) -> u64 {
        self.max_range_size
    }

    /// Get the idle poll interval.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Get the maximum reorg depth.
    #[must_use]
    pub const fn max_reorg_depth(&self) -> u64 {
        self.max_reorg_depth
    }

    /// Get the confirmation depth.
    #[must_use]
    pub const fn confirmations(&self) -> u64 {
        self.confirmations
    }

    /// Get the retry policy.
    #[must_use]
    pub const fn retry(&self) -> &BackoffPolicy {
        &self.retry
    }

    /// Get the tracked contracts.
    #[must_use]
    pub fn contracts(&self) -> &[TrackedContract] {
        &self.contracts
    }

    /// Effective first block for a contract.
    #[must_use]
    pub fn start_block_for(&self, contract: &TrackedContract) -> u64 {
        contract.start_block.unwrap_or(self.start_block)
    }
}

/// Projection store used when `DATABASE_URL` is unset.
pub const DEFAULT_DATABASE_URL: &str = "sqlite:./eventindexer.db";

/// `DATABASE_URL` from the environment (or `.env`), falling back to
/// [`DEFAULT_DATABASE_URL`].
///
/// Store-only commands use this instead of [`Config::from_env`], which also
/// requires an RPC endpoint and tracked contracts.
#[must_use]
pub fn database_url_from_env() -> String {
    dotenvy::dotenv().ok();
    env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string())
}

/// Parse a comma-separated list of tracked contracts.
///
/// # Errors
///
/// Returns a configuration error for the first malformed entry.
pub fn parse_contracts(raw: &str) -> TrackerResult<Vec<TrackedContract>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::parse)
        .collect()
}

fn env_u64(name: &str, default: u64) -> TrackerResult<u64> {
    match env::var(name) {
        Ok(value) => value.trim().parse::<u64>().map_err(|e| {
            TrackerError::config(format!("{name} must be a valid number"), Some(Box::new(e)))
        }),
        Err(_) => Ok(default),
    }
}

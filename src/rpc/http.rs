//! Alloy HTTP implementation of [`ChainClient`].
//!
//! ## Example
//!
//! ```no_run
//! use eth_event_indexer::rpc::{AlloyChainClient, ChainClient};
//! use eth_event_indexer::error::TrackerResult;
//!
//! # async fn example() -> TrackerResult<()> {
//! let client = AlloyChainClient::connect("https://eth-mainnet.g.alchemy.com/v2/API_KEY").await?;
//! let head = client.latest_block_number().await?;
//! println!("Head block: {head}");
//! # Ok(())
//! # }
//! ```

use std::time::Instant;

use alloy::primitives::{Address, B256};
use alloy::providers::{Provider as AlloyProvider, ProviderBuilder, RootProvider};
use alloy::rpc::types::{BlockTransactionsKind, Filter};
use alloy::transports::http::{Client, Http};
use alloy::transports::TransportError;
use async_trait::async_trait;
use tracing::{debug, info, instrument};

use super::ChainClient;
use crate::error::{TrackerError, TrackerResult};
use crate::events::RawLog;
use crate::reorg::BlockRecord;

/// Alloy HTTP provider type.
pub type Provider = RootProvider<Http<Client>>;

/// JSON-RPC error code several providers use for "limit exceeded".
const LIMIT_EXCEEDED_CODE: i64 = -32005;

/// Fragments of node error messages that mean the query was too big.
const RANGE_ERROR_HINTS: &[&str] = &[
    "range too large",
    "block range",
    "limit exceeded",
    "more than",
    "too many",
    "response size",
    "exceed maximum",
];

/// Create a new Ethereum RPC provider connected via HTTP.
///
/// # Errors
///
/// Returns an error if the RPC URL cannot be parsed.
#[allow(clippy::unused_async)]
#[instrument(skip(rpc_url), fields(rpc_host = tracing::field::Empty))]
pub async fn create_provider(rpc_url: &str) -> TrackerResult<Provider> {
    // Log the host only; Alchemy URLs carry the API key in the path
    let host = rpc_url.split("/v2/").next().unwrap_or("unknown");
    tracing::Span::current().record("rpc_host", host);

    let url = rpc_url.parse().map_err(|e| {
        let msg = if rpc_url.starts_with("http") {
            format!("Failed to parse RPC URL: '{host}'")
        } else {
            format!(
                "Invalid RPC URL: '{rpc_url}'. Expected an http(s) endpoint such as \
                 'https://eth-mainnet.g.alchemy.com/v2/YOUR_KEY'"
            )
        };
        TrackerError::rpc(msg, Some(Box::new(e)))
    })?;

    let provider = ProviderBuilder::new().on_http(url);
    info!("RPC provider initialized");
    Ok(provider)
}

/// [`ChainClient`] backed by an Alloy HTTP provider.
#[derive(Debug, Clone)]
pub struct AlloyChainClient {
    provider: Provider,
}

impl AlloyChainClient {
    /// Wrap an existing provider.
    #[must_use]
    pub const fn new(provider: Provider) -> Self {
        Self { provider }
    }

    /// Create a provider for `rpc_url` and wrap it.
    ///
    /// # Errors
    ///
    /// Returns an error if the RPC URL cannot be parsed.
    pub async fn connect(rpc_url: &str) -> TrackerResult<Self> {
        Ok(Self::new(create_provider(rpc_url).await?))
    }

    /// Underlying provider, for contract calls.
    #[must_use]
    pub const fn provider(&self) -> &Provider {
        &self.provider
    }
}

#[async_trait]
impl ChainClient for AlloyChainClient {
    #[instrument(skip(self), fields(block = tracing::field::Empty, duration_ms = tracing::field::Empty))]
    async fn latest_block_number(&self) -> TrackerResult<u64> {
        let start = Instant::now();
        let block_number = self
            .provider
            .get_block_number()
            .await
            .map_err(|e| TrackerError::rpc("Failed to fetch latest block number", Some(Box::new(e))))?;

        tracing::Span::current().record("block", block_number);
        tracing::Span::current().record("duration_ms", start.elapsed().as_millis() as u64);
        debug!(block = block_number, "Latest block fetched");

        Ok(block_number)
    }

    #[instrument(
        skip(self, addresses, signatures),
        fields(logs = tracing::field::Empty, duration_ms = tracing::field::Empty)
    )]
    async fn get_logs(
        &self,
        from: u64,
        to: u64,
        addresses: &[Address],
        signatures: &[B256],
    ) -> TrackerResult<Vec<RawLog>> {
        let start = Instant::now();

        let mut filter = Filter::new()
            .address(addresses.to_vec())
            .from_block(from)
            .to_block(to);
        if !signatures.is_empty() {
            filter = filter.event_signature(signatures.to_vec());
        }

        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(|e| classify_logs_error(from, to, e))?;

        let logs = logs
            .into_iter()
            .map(RawLog::try_from)
            .collect::<TrackerResult<Vec<_>>>()?;

        tracing::Span::current().record("logs", logs.len());
        tracing::Span::current().record("duration_ms", start.elapsed().as_millis() as u64);
        debug!(from, to, logs = logs.len(), "Logs fetched");

        Ok(logs)
    }

    #[instrument(skip(self))]
    async fn block(&self, number: u64) -> TrackerResult<BlockRecord> {
        let block = self
            .provider
            .get_block_by_number(number.into(), BlockTransactionsKind::Hashes)
            .await
            .map_err(|e| TrackerError::rpc(format!("Failed to fetch block {number}"), Some(Box::new(e))))?
            // A node that has not seen the block yet is a transient condition
            .ok_or_else(|| TrackerError::rpc(format!("Block {number} not found"), None))?;

        Ok(BlockRecord::from_block(&block))
    }
}

/// Map a failed `eth_getLogs` to either `RangeTooLarge` or a transient RPC error.
fn classify_logs_error(from: u64, to: u64, err: TransportError) -> TrackerError {
    let too_large = match err.as_error_resp() {
        Some(payload) => {
            payload.code == LIMIT_EXCEEDED_CODE || is_range_message(&payload.message)
        }
        None => false,
    };

    if too_large {
        TrackerError::RangeTooLarge { from, to }
    } else {
        TrackerError::rpc(
            format!("Failed to fetch logs for blocks {from}..={to}"),
            Some(Box::new(err)),
        )
    }
}

fn is_range_message(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    RANGE_ERROR_HINTS.iter().any(|hint| message.contains(hint))
}

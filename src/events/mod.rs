//! Raw logs and the typed events decoded from them.
//!
//! A [`RawLog`] is what the chain client returns: immutable once fetched and
//! identified by `(block_hash, log_index)`. The [`DecoderRegistry`] turns the logs
//! of tracked contracts into [`DecodedEvent`]s, each of which carries the
//! originating [`LogMeta`] so projection writers can key their idempotency and
//! rollback bookkeeping on it.
//!
//! ## Example
//!
//! ```
//! use eth_event_indexer::config::{ContractKind, TrackedContract};
//! use eth_event_indexer::events::{DecoderRegistry, EventPayload, RawLog};
//! use eth_event_indexer::events::abi::IERC20;
//! use alloy::primitives::{address, B256, U256};
//! use alloy::sol_types::SolEvent;
//!
//! let token = address!("00000000000000000000000000000000000000aa");
//! let registry = DecoderRegistry::for_contracts(&[TrackedContract::new(ContractKind::Erc20, token)]);
//!
//! let transfer = IERC20::Transfer {
//!     from: address!("0000000000000000000000000000000000000001"),
//!     to: address!("0000000000000000000000000000000000000002"),
//!     value: U256::from(5),
//! };
//! let log = RawLog::from_event(100, B256::repeat_byte(1), B256::ZERO, 0, token, &transfer);
//!
//! let event = registry.decode(&log).unwrap().unwrap();
//! assert!(matches!(event.payload, EventPayload::Erc20Transfer { .. }));
//! ```

pub mod abi;
pub mod decoder;

pub use decoder::DecoderRegistry;

use crate::error::{TrackerError, TrackerResult};
use alloy::primitives::{Address, Bytes, LogData, B256, U256};
use alloy::rpc::types::Log;
use alloy::sol_types::SolEvent;
use serde_json::{json, Value};

/// A log as returned by the chain client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    /// Block containing the log
    pub block_number: u64,
    /// Hash of that block at fetch time
    pub block_hash: B256,
    /// Emitting transaction
    pub tx_hash: B256,
    /// Position of the log within the block
    pub log_index: u64,
    /// Emitting contract
    pub address: Address,
    /// Indexed topics, signature first
    pub topics: Vec<B256>,
    /// ABI-encoded non-indexed data
    pub data: Bytes,
    /// Set by the node when the log was dropped by a reorg
    pub removed: bool,
    /// Block timestamp, when known
    pub block_timestamp: Option<u64>,
}

impl RawLog {
    /// Build a log by encoding a `sol!` event, as a node would return it.
    #[must_use]
    pub fn from_event<E: SolEvent>(
        block_number: u64,
        block_hash: B256,
        tx_hash: B256,
        log_index: u64,
        address: Address,
        event: &E,
    ) -> Self {
        let data = event.encode_log_data();
        Self {
            block_number,
            block_hash,
            tx_hash,
            log_index,
            address,
            topics: data.topics().to_vec(),
            data: data.data,
            removed: false,
            block_timestamp: None,
        }
    }

    /// The event signature, if the log has any topics.
    #[must_use]
    pub fn topic0(&self) -> Option<B256> {
        self.topics.first().copied()
    }

    /// Topics and data in the shape `sol!` decoders expect.
    #[must_use]
    pub fn log_data(&self) -> LogData {
        LogData::new_unchecked(self.topics.clone(), self.data.clone())
    }
}

impl TryFrom<Log> for RawLog {
    type Error = TrackerError;

    fn try_from(log: Log) -> TrackerResult<Self> {
        let missing = |field: &str| {
            TrackerError::rpc(
                format!("Log from {:?} is missing {field} (pending block?)", log.inner.address),
                None,
            )
        };

        Ok(Self {
            block_number: log.block_number.ok_or_else(|| missing("block_number"))?,
            block_hash: log.block_hash.ok_or_else(|| missing("block_hash"))?,
            tx_hash: log.transaction_hash.ok_or_else(|| missing("transaction_hash"))?,
            log_index: log.log_index.ok_or_else(|| missing("log_index"))?,
            address: log.inner.address,
            topics: log.inner.data.topics().to_vec(),
            data: log.inner.data.data.clone(),
            removed: log.removed,
            block_timestamp: log.block_timestamp,
        })
    }
}

/// Identity and provenance of the log an event was decoded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMeta {
    /// Block number
    pub block_number: u64,
    /// Block hash; with `log_index`, the event identity
    pub block_hash: B256,
    /// Emitting transaction
    pub tx_hash: B256,
    /// Position within the block
    pub log_index: u64,
    /// Emitting contract
    pub address: Address,
    /// Block timestamp (Unix seconds)
    pub timestamp: u64,
}

impl From<&RawLog> for LogMeta {
    fn from(log: &RawLog) -> Self {
        Self {
            block_number: log.block_number,
            block_hash: log.block_hash,
            tx_hash: log.tx_hash,
            log_index: log.log_index,
            address: log.address,
            timestamp: log.block_timestamp.unwrap_or_default(),
        }
    }
}

/// Kind-specific fields of a decoded event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    /// Fungible token transfer; mint and burn use the zero address.
    Erc20Transfer {
        /// Sender
        from: Address,
        /// Receiver
        to: Address,
        /// Amount in base units
        value: U256,
    },
    /// ERC721 or ERC1155 transfer of one or more `(token_id, amount)` pairs.
    NftTransfer {
        /// Sender
        from: Address,
        /// Receiver
        to: Address,
        /// Transferred ids with their amounts (always 1 for ERC721)
        tokens: Vec<(U256, U256)>,
        /// Whether the collection is ERC1155 (affects metadata lookup)
        multi_token: bool,
    },
    /// Outgoing bridge message.
    BridgeMessage {
        /// Message hash
        msg_hash: B256,
        /// Sender on this chain
        from: Address,
        /// Recipient on the destination chain
        to: Address,
        /// Destination chain id
        dest_chain_id: u64,
        /// Value carried
        value: U256,
    },
    /// Rollup block proposal.
    BlockProposed {
        /// Proposed L2 block id
        block_id: U256,
        /// Proposer address
        proposer: Address,
        /// Proposal time reported by the contract
        proposed_at: u64,
    },
}

/// A typed event with the identity of the log it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedEvent {
    /// Originating log identity
    pub meta: LogMeta,
    /// Kind-specific fields
    pub payload: EventPayload,
}

impl DecodedEvent {
    /// Stable kind name stored with event records.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self.payload {
            EventPayload::Erc20Transfer { .. } => "erc20_transfer",
            EventPayload::NftTransfer { .. } => "nft_transfer",
            EventPayload::BridgeMessage { .. } => "bridge_message",
            EventPayload::BlockProposed { .. } => "block_proposed",
        }
    }

    /// JSON rendering of the payload. Integers are decimal strings.
    #[must_use]
    pub fn payload_json(&self) -> Value {
        match &self.payload {
            EventPayload::Erc20Transfer { from, to, value } => json!({
                "from": format!("{from:?}"),
                "to": format!("{to:?}"),
                "value": value.to_string(),
            }),
            EventPayload::NftTransfer {
                from,
                to,
                tokens,
                multi_token,
            } => json!({
                "from": format!("{from:?}"),
                "to": format!("{to:?}"),
                "tokens": tokens
                    .iter()
                    .map(|(id, amount)| json!({ "id": id.to_string(), "amount": amount.to_string() }))
                    .collect::<Vec<_>>(),
                "multi_token": multi_token,
            }),
            EventPayload::BridgeMessage {
                msg_hash,
                from,
                to,
                dest_chain_id,
                value,
            } => json!({
                "msg_hash": format!("{msg_hash:?}"),
                "from": format!("{from:?}"),
                "to": format!("{to:?}"),
                "dest_chain_id": dest_chain_id,
                "value": value.to_string(),
            }),
            EventPayload::BlockProposed {
                block_id,
                proposer,
                proposed_at,
            } => json!({
                "block_id": block_id.to_string(),
                "proposer": format!("{proposer:?}"),
                "proposed_at": proposed_at,
            }),
        }
    }
}

//! Signature-dispatched log decoding.
//!
//! The registry maps `(contract address, topic0)` to a decode function. Logs
//! whose key is not registered are unrecognized and dropped by the caller; a
//! registered log that fails to decode is a [`TrackerError::Decoding`], which
//! must never be skipped because it would silently lose state-affecting data.

use std::collections::HashMap;

use alloy::primitives::{Address, B256, U256};
use alloy::sol_types::SolEvent;

use super::abi::{IBridge, IERC1155, IERC20, IERC721, IRollupInbox};
use super::{DecodedEvent, EventPayload, LogMeta, RawLog};
use crate::config::{ContractKind, TrackedContract};
use crate::error::{TrackerError, TrackerResult};

/// Decodes the payload of a log whose signature is already known.
pub type DecodeFn = fn(&RawLog) -> TrackerResult<EventPayload>;

/// Registered event shapes for one contract kind, as `(topic0, decoder)` pairs.
#[must_use]
pub fn decoders_for(kind: ContractKind) -> Vec<(B256, DecodeFn)> {
    match kind {
        ContractKind::Erc20 => vec![(IERC20::Transfer::SIGNATURE_HASH, decode_erc20_transfer as DecodeFn)],
        ContractKind::Erc721 => vec![(IERC721::Transfer::SIGNATURE_HASH, decode_erc721_transfer as DecodeFn)],
        ContractKind::Erc1155 => vec![
            (IERC1155::TransferSingle::SIGNATURE_HASH, decode_transfer_single as DecodeFn),
            (IERC1155::TransferBatch::SIGNATURE_HASH, decode_transfer_batch as DecodeFn),
        ],
        ContractKind::Bridge => vec![(IBridge::MessageSent::SIGNATURE_HASH, decode_message_sent as DecodeFn)],
        ContractKind::Rollup => vec![(IRollupInbox::BlockProposed::SIGNATURE_HASH, decode_block_proposed as DecodeFn)],
    }
}

/// Topic-0 values a contract kind emits; used to narrow log queries.
#[must_use]
pub fn signatures_for(kind: ContractKind) -> Vec<B256> {
    decoders_for(kind).into_iter().map(|(sig, _)| sig).collect()
}

/// Table of decoders keyed by contract address and event signature.
#[derive(Debug, Clone, Default)]
pub struct DecoderRegistry {
    decoders: HashMap<(Address, B256), DecodeFn>,
}

impl DecoderRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry with every shape of every given contract registered.
    #[must_use]
    pub fn for_contracts(contracts: &[TrackedContract]) -> Self {
        let mut registry = Self::new();
        for contract in contracts {
            registry.register_contract(contract.address, contract.kind);
        }
        registry
    }

    /// Register all event shapes of `kind` for `address`.
    pub fn register_contract(&mut self, address: Address, kind: ContractKind) {
        for (signature, decode) in decoders_for(kind) {
            self.register(address, signature, decode);
        }
    }

    /// Register a single decoder, replacing any previous one for the same key.
    pub fn register(&mut self, address: Address, signature: B256, decode: DecodeFn) {
        self.decoders.insert((address, signature), decode);
    }

    /// Whether a decoder exists for this address and signature.
    #[must_use]
    pub fn is_registered(&self, address: Address, signature: B256) -> bool {
        self.decoders.contains_key(&(address, signature))
    }

    /// Number of registered `(address, signature)` pairs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    /// Decode a log.
    ///
    /// Returns `Ok(None)` for unrecognized logs.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::Decoding`] when a registered signature carries a
    /// payload that does not match its ABI.
    pub fn decode(&self, log: &RawLog) -> TrackerResult<Option<DecodedEvent>> {
        let Some(signature) = log.topic0() else {
            return Ok(None);
        };
        let Some(decode) = self.decoders.get(&(log.address, signature)) else {
            return Ok(None);
        };

        let payload = decode(log).map_err(|e| {
            TrackerError::decoding(
                format!(
                    "Log {} in block {} ({:?}) from {:?}: {e}",
                    log.log_index, log.block_number, log.block_hash, log.address
                ),
                Some(Box::new(e)),
            )
        })?;

        Ok(Some(DecodedEvent {
            meta: LogMeta::from(log),
            payload,
        }))
    }
}

fn decode_as<E: SolEvent>(log: &RawLog) -> TrackerResult<E> {
    E::decode_log_data(&log.log_data(), true).map_err(|e| {
        TrackerError::decoding(format!("Malformed {} payload", E::SIGNATURE), Some(Box::new(e)))
    })
}

fn decode_erc20_transfer(log: &RawLog) -> TrackerResult<EventPayload> {
    let event = decode_as::<IERC20::Transfer>(log)?;
    Ok(EventPayload::Erc20Transfer {
        from: event.from,
        to: event.to,
        value: event.value,
    })
}

fn decode_erc721_transfer(log: &RawLog) -> TrackerResult<EventPayload> {
    let event = decode_as::<IERC721::Transfer>(log)?;
    Ok(EventPayload::NftTransfer {
        from: event.from,
        to: event.to,
        tokens: vec![(event.tokenId, U256::from(1))],
        multi_token: false,
    })
}

fn decode_transfer_single(log: &RawLog) -> TrackerResult<EventPayload> {
    let event = decode_as::<IERC1155::TransferSingle>(log)?;
    Ok(EventPayload::NftTransfer {
        from: event.from,
        to: event.to,
        tokens: vec![(event.id, event.value)],
        multi_token: true,
    })
}

fn decode_transfer_batch(log: &RawLog) -> TrackerResult<EventPayload> {
    let event = decode_as::<IERC1155::TransferBatch>(log)?;
    if event.ids.len() != event.values.len() {
        return Err(TrackerError::decoding(
            format!(
                "TransferBatch has {} ids but {} values",
                event.ids.len(),
                event.values.len()
            ),
            None,
        ));
    }
    Ok(EventPayload::NftTransfer {
        from: event.from,
        to: event.to,
        tokens: event.ids.into_iter().zip(event.values).collect(),
        multi_token: true,
    })
}

fn decode_message_sent(log: &RawLog) -> TrackerResult<EventPayload> {
    let event = decode_as::<IBridge::MessageSent>(log)?;
    Ok(EventPayload::BridgeMessage {
        msg_hash: event.msgHash,
        from: event.from,
        to: event.to,
        dest_chain_id: event.destChainId,
        value: event.value,
    })
}

fn decode_block_proposed(log: &RawLog) -> TrackerResult<EventPayload> {
    let event = decode_as::<IRollupInbox::BlockProposed>(log)?;
    Ok(EventPayload::BlockProposed {
        block_id: event.blockId,
        proposer: event.proposer,
        proposed_at: event.proposedAt,
    })
}

//! NFT metadata lookups.
//!
//! Token URIs are read from the collection contract (`tokenURI` for ERC721,
//! `uri` for ERC1155) before a range is committed. Lookups are best-effort: a
//! failure is logged and the token is simply left without metadata, to be
//! retried on its next transfer.

use std::collections::HashSet;

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tracing::{debug, warn};

use crate::db::Repository;
use crate::error::{TrackerError, TrackerResult};
use crate::events::abi::{IERC1155MetadataURI, IERC721Metadata};
use crate::events::{DecodedEvent, EventPayload};
use crate::projections::MetadataMap;
use crate::rpc::Provider;

/// Concurrent lookups per range.
const PREFETCH_CONCURRENCY: usize = 8;

/// Source of token URIs.
#[async_trait]
pub trait MetadataFetcher: Send + Sync {
    /// URI of `token_id` in `collection`.
    async fn token_uri(
        &self,
        collection: Address,
        token_id: U256,
        multi_token: bool,
    ) -> TrackerResult<String>;
}

/// Reads URIs from the chain through contract calls.
#[derive(Debug, Clone)]
pub struct ContractMetadataFetcher {
    provider: Provider,
}

impl ContractMetadataFetcher {
    /// Create a fetcher using `provider`.
    #[must_use]
    pub const fn new(provider: Provider) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl MetadataFetcher for ContractMetadataFetcher {
    async fn token_uri(
        &self,
        collection: Address,
        token_id: U256,
        multi_token: bool,
    ) -> TrackerResult<String> {
        let result = if multi_token {
            IERC1155MetadataURI::new(collection, self.provider.clone())
                .uri(token_id)
                .call()
                .await
                .map(|r| r._0)
        } else {
            IERC721Metadata::new(collection, self.provider.clone())
                .tokenURI(token_id)
                .call()
                .await
                .map(|r| r._0)
        };

        result.map_err(|e| {
            TrackerError::rpc(
                format!("Metadata lookup for {collection:?} #{token_id} failed"),
                Some(Box::new(e)),
            )
        })
    }
}

/// Fetcher that never finds anything; used when metadata is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMetadata;

#[async_trait]
impl MetadataFetcher for NoMetadata {
    async fn token_uri(&self, collection: Address, token_id: U256, _: bool) -> TrackerResult<String> {
        Err(TrackerError::rpc(
            format!("No metadata source for {collection:?} #{token_id}"),
            None,
        ))
    }
}

/// Fetch URIs for every token in `events` whose metadata is absent or stale.
///
/// # Errors
///
/// Only store errors are returned; lookup failures are logged and skipped.
pub async fn prefetch(
    fetcher: &dyn MetadataFetcher,
    repo: &Repository,
    events: &[DecodedEvent],
) -> TrackerResult<MetadataMap> {
    let mut wanted = Vec::new();
    let mut seen = HashSet::new();
    for event in events {
        if let EventPayload::NftTransfer {
            tokens, multi_token, ..
        } = &event.payload
        {
            for (token_id, _) in tokens {
                let key = (event.meta.address, *token_id);
                if seen.insert(key) && repo.metadata_needs_refresh(key.0, key.1).await? {
                    wanted.push((key, *multi_token));
                }
            }
        }
    }

    if wanted.is_empty() {
        return Ok(MetadataMap::new());
    }
    debug!(tokens = wanted.len(), "Fetching NFT metadata");

    let results: Vec<_> = stream::iter(wanted)
        .map(|((collection, token_id), multi_token)| async move {
            let uri = fetcher.token_uri(collection, token_id, multi_token).await;
            ((collection, token_id), uri)
        })
        .buffer_unordered(PREFETCH_CONCURRENCY)
        .collect()
        .await;

    let mut metadata = MetadataMap::new();
    for (key, uri) in results {
        match uri {
            Ok(uri) => {
                metadata.insert(key, uri);
            }
            Err(e) => warn!(
                collection = %key.0,
                token_id = %key.1,
                error = %e,
                "NFT metadata lookup failed"
            ),
        }
    }
    Ok(metadata)
}

//! Contract bindings generated with Alloy's `sol!` macro.
//!
//! ERC20 and ERC721 share the `Transfer(address,address,uint256)` signature and
//! differ only in whether the third argument is indexed, so each lives in its own
//! interface namespace. The decoder picks the binding from the contract kind, and
//! `decode_log_data` with validation rejects a log whose topic count does not
//! match.

use alloy::sol;

sol! {
    /// Fungible token transfers.
    interface IERC20 {
        /// Emitted on every transfer, mint (`from == 0`) and burn (`to == 0`).
        event Transfer(address indexed from, address indexed to, uint256 value);
    }
}

sol! {
    /// Non-fungible token transfers.
    interface IERC721 {
        /// Emitted when ownership of a single token changes.
        event Transfer(address indexed from, address indexed to, uint256 indexed tokenId);
    }
}

sol! {
    /// Multi-token transfers.
    interface IERC1155 {
        /// Single id/amount transfer.
        event TransferSingle(address indexed operator, address indexed from, address indexed to, uint256 id, uint256 value);

        /// Batched transfer; `ids` and `values` are parallel arrays.
        event TransferBatch(address indexed operator, address indexed from, address indexed to, uint256[] ids, uint256[] values);
    }
}

sol! {
    /// Cross-chain bridge outbox.
    interface IBridge {
        /// A message was queued for delivery to another chain.
        event MessageSent(bytes32 indexed msgHash, address indexed from, address indexed to, uint64 destChainId, uint256 value);
    }
}

sol! {
    /// Rollup block inbox.
    interface IRollupInbox {
        /// A new L2 block was proposed.
        event BlockProposed(uint256 indexed blockId, address indexed proposer, uint64 proposedAt);
    }
}

sol! {
    #[sol(rpc)]
    interface IERC721Metadata {
        function tokenURI(uint256 tokenId) external view returns (string);
    }
}

sol! {
    #[sol(rpc)]
    interface IERC1155MetadataURI {
        function uri(uint256 id) external view returns (string);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::keccak256;
    use alloy::sol_types::SolEvent;

    #[test]
    fn test_transfer_signatures_collide() {
        assert_eq!(
            IERC20::Transfer::SIGNATURE_HASH,
            IERC721::Transfer::SIGNATURE_HASH
        );
        assert_eq!(
            IERC20::Transfer::SIGNATURE_HASH,
            keccak256("Transfer(address,address,uint256)")
        );
    }

    #[test]
    fn test_event_signatures() {
        assert_eq!(
            IERC1155::TransferSingle::SIGNATURE,
            "TransferSingle(address,address,address,uint256,uint256)"
        );
        assert_eq!(
            IERC1155::TransferBatch::SIGNATURE,
            "TransferBatch(address,address,address,uint256[],uint256[])"
        );
        assert_eq!(
            IBridge::MessageSent::SIGNATURE,
            "MessageSent(bytes32,address,address,uint64,uint256)"
        );
        assert_eq!(
            IRollupInbox::BlockProposed::SIGNATURE,
            "BlockProposed(uint256,address,uint64)"
        );
    }
}

use alloy::primitives::B256;
use alloy::sol;
use alloy::sol_types::SolEvent;

sol! {
    #[derive(Debug, PartialEq, Eq)]
    event TreePlanted(address indexed planter, uint256 nonce);

    #[derive(Debug, PartialEq, Eq)]
    event TreeAssigned(uint256 indexed treeId);

    #[derive(Debug, PartialEq, Eq)]
    event TreeUpdated(uint256 indexed treeId);

    function trees(uint256 treeId) external view returns (address planter, uint256 assignNonce);
}

/// topic0 of every registry event the listener consumes.
pub const TREE_EVENT_SIGNATURES: [B256; 3] = [
    TreePlanted::SIGNATURE_HASH,
    TreeAssigned::SIGNATURE_HASH,
    TreeUpdated::SIGNATURE_HASH,
];

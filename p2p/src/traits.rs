use std::sync::Arc;

use anyhow::Result;
use thiserror::Error;
use types::{
    containers::BlobSidecar,
    primitives::{KzgCommitment, Slot, H256},
    traits::BeaconBlock,
};

use crate::verifier::VerificationError;

/// Acceptance check for blob sidecars received from peers.
pub trait BlobSidecarVerifier: Send + Sync {
    fn verify(
        &self,
        slot: Slot,
        block_root: H256,
        expected_commitments: &[KzgCommitment],
        sidecar: &BlobSidecar,
    ) -> Result<(), VerificationError>;
}

/// Access to blocks the node already knows about.
pub trait BlockLookup: Send + Sync {
    type Block: BeaconBlock;

    fn block_by_root(&self, block_root: H256) -> Result<Option<Self::Block>>;
}

/// The fork choice side of block processing.
pub trait ChainAcceptance<B>: Send + Sync {
    fn receive_block(
        &self,
        block: B,
        block_root: H256,
        sidecar: Option<Arc<BlobSidecar>>,
    ) -> Result<(), ChainError>;
}

#[derive(Debug, Error)]
pub enum ChainError {
    /// `block_root` is the root of the block found to be invalid, which may be an ancestor of the
    /// block being processed. `None` means the block being processed is itself invalid.
    #[error("invalid block (block_root: {block_root:?}, invalid_ancestors: {invalid_ancestors:?})")]
    InvalidBlock {
        block_root: Option<H256>,
        invalid_ancestors: Vec<H256>,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

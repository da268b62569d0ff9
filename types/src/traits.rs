use std::sync::Arc;

use crate::primitives::{KzgCommitment, Slot, H256};

/// Read access to the parts of a beacon block the blob sidecar subsystem needs.
///
/// Encoding blocks and computing their roots is done elsewhere.
pub trait BeaconBlock: Send + Sync {
    fn slot(&self) -> Slot;

    fn root(&self) -> H256;

    fn blob_kzg_commitments(&self) -> &[KzgCommitment];

    fn has_blobs(&self) -> bool {
        !self.blob_kzg_commitments().is_empty()
    }
}

impl<B: BeaconBlock + ?Sized> BeaconBlock for Arc<B> {
    fn slot(&self) -> Slot {
        B::slot(self)
    }

    fn root(&self) -> H256 {
        B::root(self)
    }

    fn blob_kzg_commitments(&self) -> &[KzgCommitment] {
        B::blob_kzg_commitments(self)
    }
}

use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use types::{
    containers::{BlobAndProof, BlobSidecar},
    primitives::{KzgCommitment, Slot, H256, H384},
    traits::BeaconBlock,
};

use crate::{traits::BlockLookup, verifier::KzgProofVerifier};

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TestBlock {
    pub slot: Slot,
    pub root: H256,
    pub commitments: Vec<KzgCommitment>,
}

impl BeaconBlock for TestBlock {
    fn slot(&self) -> Slot {
        self.slot
    }

    fn root(&self) -> H256 {
        self.root
    }

    fn blob_kzg_commitments(&self) -> &[KzgCommitment] {
        &self.commitments
    }
}

impl BlockLookup for HashMap<H256, TestBlock> {
    type Block = TestBlock;

    fn block_by_root(&self, block_root: H256) -> Result<Option<Self::Block>> {
        Ok(self.get(&block_root).cloned())
    }
}

pub struct AcceptAllProofs;

impl KzgProofVerifier for AcceptAllProofs {
    fn verify_blob_kzg_proof_batch(&self, _blobs: &[BlobAndProof]) -> bool {
        true
    }
}

pub fn block(slot: Slot, root_byte: u8, commitment_bytes: &[u8]) -> TestBlock {
    TestBlock {
        slot,
        root: H256::repeat_byte(root_byte),
        commitments: commitment_bytes
            .iter()
            .copied()
            .map(H384::repeat_byte)
            .collect(),
    }
}

pub fn sidecar(slot: Slot, root_byte: u8, commitment_bytes: &[u8]) -> Result<Arc<BlobSidecar>> {
    let blobs = commitment_bytes
        .iter()
        .map(|byte| {
            Ok(BlobAndProof {
                blob: vec![*byte; 16].try_into()?,
                kzg_commitment: H384::repeat_byte(*byte),
                kzg_proof: H384::zero(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Arc::new(BlobSidecar {
        slot,
        block_root: H256::repeat_byte(root_byte),
        blobs: blobs.try_into()?,
    }))
}

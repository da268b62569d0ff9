use thiserror::Error;
use types::{
    containers::{BlobAndProof, BlobSidecar},
    primitives::{KzgCommitment, Slot, H256},
};

use crate::traits::BlobSidecarVerifier;

/// KZG proof verification.
///
/// Implemented outside this crate on top of a KZG library loaded with the trusted setup.
pub trait KzgProofVerifier: Send + Sync {
    /// Returns `false` if any proof in `blobs` does not bind its blob to its commitment.
    fn verify_blob_kzg_proof_batch(&self, blobs: &[BlobAndProof]) -> bool;
}

/// Checks that a sidecar belongs to the block it claims to belong to and that its proofs verify.
pub struct CommitmentVerifier<V> {
    kzg: V,
}

impl<V> CommitmentVerifier<V> {
    #[must_use]
    pub const fn new(kzg: V) -> Self {
        Self { kzg }
    }
}

impl<V: KzgProofVerifier> BlobSidecarVerifier for CommitmentVerifier<V> {
    fn verify(
        &self,
        slot: Slot,
        block_root: H256,
        expected_commitments: &[KzgCommitment],
        sidecar: &BlobSidecar,
    ) -> Result<(), VerificationError> {
        if sidecar.slot != slot {
            return Err(VerificationError::SlotMismatch {
                expected: slot,
                actual: sidecar.slot,
            });
        }

        if sidecar.block_root != block_root {
            return Err(VerificationError::BlockRootMismatch {
                expected: block_root,
                actual: sidecar.block_root,
            });
        }

        if sidecar.blobs.len() != expected_commitments.len() {
            return Err(VerificationError::BlobCountMismatch {
                expected: expected_commitments.len(),
                actual: sidecar.blobs.len(),
            });
        }

        for (index, (actual, expected)) in sidecar
            .kzg_commitments()
            .zip(expected_commitments)
            .enumerate()
        {
            if actual != *expected {
                return Err(VerificationError::CommitmentMismatch { index });
            }
        }

        if !self.kzg.verify_blob_kzg_proof_batch(&sidecar.blobs) {
            return Err(VerificationError::InvalidProof);
        }

        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("sidecar slot {actual} does not match block slot {expected}")]
    SlotMismatch { expected: Slot, actual: Slot },
    #[error("sidecar block root {actual:?} does not match {expected:?}")]
    BlockRootMismatch { expected: H256, actual: H256 },
    #[error("sidecar has {actual} blobs but block commits to {expected}")]
    BlobCountMismatch { expected: usize, actual: usize },
    #[error("commitment {index} does not match block")]
    CommitmentMismatch { index: usize },
    #[error("KZG proof verification failed")]
    InvalidProof,
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use ssz::H384;

    use super::*;

    struct AcceptAll;

    impl KzgProofVerifier for AcceptAll {
        fn verify_blob_kzg_proof_batch(&self, _blobs: &[BlobAndProof]) -> bool {
            true
        }
    }

    struct RejectAll;

    impl KzgProofVerifier for RejectAll {
        fn verify_blob_kzg_proof_batch(&self, _blobs: &[BlobAndProof]) -> bool {
            false
        }
    }

    fn sidecar(commitments: &[u8]) -> Result<BlobSidecar> {
        let blobs = commitments
            .iter()
            .map(|byte| {
                Ok(BlobAndProof {
                    blob: vec![*byte; 4].try_into()?,
                    kzg_commitment: H384::repeat_byte(*byte),
                    kzg_proof: H384::zero(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(BlobSidecar {
            slot: 3,
            block_root: H256::repeat_byte(3),
            blobs: blobs.try_into()?,
        })
    }

    fn commitments(bytes: &[u8]) -> Vec<KzgCommitment> {
        bytes.iter().copied().map(H384::repeat_byte).collect()
    }

    #[test]
    fn matching_sidecar_is_accepted() -> Result<()> {
        let verifier = CommitmentVerifier::new(AcceptAll);

        verifier.verify(3, H256::repeat_byte(3), &commitments(&[1, 2]), &sidecar(&[1, 2])?)?;

        Ok(())
    }

    #[test]
    fn reordered_commitments_are_rejected() -> Result<()> {
        let verifier = CommitmentVerifier::new(AcceptAll);
        let sidecar = sidecar(&[1, 2])?;
        let result = verifier.verify(3, H256::repeat_byte(3), &commitments(&[2, 1]), &sidecar);

        assert!(matches!(
            result,
            Err(VerificationError::CommitmentMismatch { index: 0 }),
        ));

        Ok(())
    }

    #[test]
    fn sidecar_for_other_block_is_rejected() -> Result<()> {
        let verifier = CommitmentVerifier::new(AcceptAll);
        let result = verifier.verify(3, H256::repeat_byte(4), &commitments(&[1]), &sidecar(&[1])?);

        assert!(matches!(
            result,
            Err(VerificationError::BlockRootMismatch { .. }),
        ));

        Ok(())
    }

    #[test]
    fn missing_blob_is_rejected() -> Result<()> {
        let verifier = CommitmentVerifier::new(AcceptAll);
        let sidecar = sidecar(&[1])?;
        let result = verifier.verify(3, H256::repeat_byte(3), &commitments(&[1, 2]), &sidecar);

        assert!(matches!(
            result,
            Err(VerificationError::BlobCountMismatch {
                expected: 2,
                actual: 1,
            }),
        ));

        Ok(())
    }

    #[test]
    fn invalid_proof_is_rejected() -> Result<()> {
        let verifier = CommitmentVerifier::new(RejectAll);
        let result = verifier.verify(3, H256::repeat_byte(3), &commitments(&[1]), &sidecar(&[1])?);

        assert!(matches!(result, Err(VerificationError::InvalidProof)));

        Ok(())
    }
}

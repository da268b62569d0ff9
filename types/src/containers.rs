use ssz::{
    read_offset_unchecked, subslice, write_offset, ContiguousList, ReadError, Size, SszRead,
    SszSize, SszWrite, WriteError, BYTES_PER_LENGTH_OFFSET, H256, H384,
};

use crate::{
    consts::MaxBlobsPerSidecar,
    primitives::{Blob, KzgCommitment, KzgProof, Slot},
};

/// A blob together with the commitment it was published under and the proof binding the two.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct BlobAndProof {
    pub blob: Blob,
    pub kzg_commitment: KzgCommitment,
    pub kzg_proof: KzgProof,
}

/// All blobs belonging to a single beacon block.
///
/// Sidecars are created on receipt or read back from storage and are never mutated afterwards.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct BlobSidecar {
    pub slot: Slot,
    pub block_root: H256,
    pub blobs: ContiguousList<BlobAndProof, MaxBlobsPerSidecar>,
}

#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct BlobSidecarsByRangeRequest {
    pub start_slot: Slot,
    pub count: u64,
}

impl BlobSidecar {
    pub fn kzg_commitments(&self) -> impl ExactSizeIterator<Item = KzgCommitment> + '_ {
        self.blobs.iter().map(|blob_and_proof| blob_and_proof.kzg_commitment)
    }

    /// Whether the sidecar carries exactly `expected` commitments in the same order.
    #[must_use]
    pub fn commitments_match(&self, expected: &[KzgCommitment]) -> bool {
        self.kzg_commitments().eq(expected.iter().copied())
    }
}

impl BlobSidecarsByRangeRequest {
    /// First slot after the requested range, or `None` if it does not fit in a [`Slot`].
    #[must_use]
    pub const fn end_slot(self) -> Option<Slot> {
        self.start_slot.checked_add(self.count)
    }
}

const BLOB_AND_PROOF_FIXED_PART: usize = BYTES_PER_LENGTH_OFFSET + 2 * H384::len_bytes();

impl SszSize for BlobAndProof {
    const SIZE: Size = Size::Variable {
        minimum_size: BLOB_AND_PROOF_FIXED_PART,
    };
}

impl<C> SszRead<C> for BlobAndProof {
    fn from_ssz_unchecked(context: &C, bytes: &[u8]) -> Result<Self, ReadError> {
        let blob_offset = read_container_offset(bytes, 0, BLOB_AND_PROOF_FIXED_PART)?;

        let commitment_start = BYTES_PER_LENGTH_OFFSET;
        let proof_start = commitment_start + H384::len_bytes();

        Ok(Self {
            blob: Blob::from_ssz(context, subslice(bytes, blob_offset..bytes.len())?)?,
            kzg_commitment: H384::from_ssz(
                context,
                subslice(bytes, commitment_start..proof_start)?,
            )?,
            kzg_proof: H384::from_ssz(
                context,
                subslice(bytes, proof_start..BLOB_AND_PROOF_FIXED_PART)?,
            )?,
        })
    }
}

impl SszWrite for BlobAndProof {
    fn write_variable(&self, bytes: &mut Vec<u8>) -> Result<(), WriteError> {
        let start = bytes.len();
        let commitment_start = start + BYTES_PER_LENGTH_OFFSET;
        let proof_start = commitment_start + H384::len_bytes();

        bytes.resize(start + BLOB_AND_PROOF_FIXED_PART, 0);

        write_offset(bytes, start, BLOB_AND_PROOF_FIXED_PART)?;
        self.kzg_commitment
            .write_fixed(&mut bytes[commitment_start..proof_start]);
        self.kzg_proof
            .write_fixed(&mut bytes[proof_start..start + BLOB_AND_PROOF_FIXED_PART]);

        self.blob.write_variable(bytes)
    }
}

const BLOB_SIDECAR_FIXED_PART: usize =
    size_of::<Slot>() + H256::len_bytes() + BYTES_PER_LENGTH_OFFSET;

impl SszSize for BlobSidecar {
    const SIZE: Size = Size::Variable {
        minimum_size: BLOB_SIDECAR_FIXED_PART,
    };
}

impl<C> SszRead<C> for BlobSidecar {
    fn from_ssz_unchecked(context: &C, bytes: &[u8]) -> Result<Self, ReadError> {
        let root_start = size_of::<Slot>();
        let offset_start = root_start + H256::len_bytes();
        let blobs_offset = read_container_offset(bytes, offset_start, BLOB_SIDECAR_FIXED_PART)?;

        Ok(Self {
            slot: Slot::from_ssz(context, subslice(bytes, 0..root_start)?)?,
            block_root: H256::from_ssz(context, subslice(bytes, root_start..offset_start)?)?,
            blobs: ContiguousList::from_ssz(context, subslice(bytes, blobs_offset..bytes.len())?)?,
        })
    }
}

impl SszWrite for BlobSidecar {
    fn write_variable(&self, bytes: &mut Vec<u8>) -> Result<(), WriteError> {
        let start = bytes.len();
        let root_start = start + size_of::<Slot>();
        let offset_start = root_start + H256::len_bytes();

        bytes.resize(start + BLOB_SIDECAR_FIXED_PART, 0);

        self.slot.write_fixed(&mut bytes[start..root_start]);
        self.block_root
            .write_fixed(&mut bytes[root_start..offset_start]);
        write_offset(bytes, offset_start, BLOB_SIDECAR_FIXED_PART)?;

        self.blobs.write_variable(bytes)
    }
}

impl SszSize for BlobSidecarsByRangeRequest {
    const SIZE: Size = Size::Fixed {
        size: size_of::<Slot>() + size_of::<u64>(),
    };
}

impl<C> SszRead<C> for BlobSidecarsByRangeRequest {
    fn from_ssz_unchecked(context: &C, bytes: &[u8]) -> Result<Self, ReadError> {
        let (start_slot, count) = bytes.split_at(size_of::<Slot>());

        Ok(Self {
            start_slot: Slot::from_ssz(context, start_slot)?,
            count: u64::from_ssz(context, count)?,
        })
    }
}

impl SszWrite for BlobSidecarsByRangeRequest {
    fn write_fixed(&self, bytes: &mut [u8]) {
        let (start_slot, count) = bytes.split_at_mut(size_of::<Slot>());
        self.start_slot.write_fixed(start_slot);
        self.count.write_fixed(count);
    }
}

// Containers in this module have a single variable-size field, so the offset pointing to it must
// point right past the fixed part.
fn read_container_offset(
    bytes: &[u8],
    position: usize,
    fixed_part: usize,
) -> Result<usize, ReadError> {
    let offset_bytes = subslice(bytes, position..position + BYTES_PER_LENGTH_OFFSET)?;
    let offset = read_offset_unchecked(offset_bytes)?;

    if offset != fixed_part {
        return Err(ReadError::ContainerFirstOffsetMismatch {
            expected: fixed_part,
            actual: offset,
        });
    }

    Ok(offset)
}

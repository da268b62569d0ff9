pub use primitive_types::{H256, H384};
use ssz::ByteList;

use crate::consts::{BytesPerBlob, MaxErrorMessageLength};

pub type Blob = ByteList<BytesPerBlob>;
pub type Epoch = u64;
pub type KzgCommitment = H384;
pub type KzgProof = H384;
pub type Slot = u64;

/// Human readable error description sent in non-success response chunks.
pub type ErrorMessage = ByteList<MaxErrorMessageLength>;

use ssz::ReadError;
use thiserror::Error;
use types::primitives::{Slot, H256};

#[derive(Debug, Error)]
pub enum Error {
    #[error("stored key has length {actual} instead of {expected}: {key:02x?}")]
    KeyLengthMismatch {
        expected: usize,
        actual: usize,
        key: Vec<u8>,
    },
    #[error("stored sidecar for slot {slot} and block root {block_root:?} is corrupted")]
    Corrupted {
        slot: Slot,
        block_root: H256,
        #[source]
        reason: Corruption,
    },
}

#[derive(Debug, Error)]
pub enum Corruption {
    #[error("value could not be decoded")]
    Undecodable(#[from] ReadError),
    #[error("decoded sidecar has slot {0}")]
    SlotMismatch(Slot),
    #[error("decoded sidecar has block root {0:?}")]
    BlockRootMismatch(H256),
}

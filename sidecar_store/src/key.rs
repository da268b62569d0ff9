use core::num::NonZeroU64;

use derive_more::Display;
use types::primitives::{Slot, H256};

/// Key of a stored sidecar.
///
/// Serialized as `bucket ∥ slot ∥ block_root` with both integers in big-endian order, so that all
/// keys of a bucket are adjacent and ordered by slot.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
#[display("{bucket}/{slot}/{block_root:?}")]
pub struct StorageKey {
    pub bucket: u64,
    pub slot: Slot,
    pub block_root: H256,
}

impl StorageKey {
    pub const LENGTH: usize = BUCKET_LENGTH + SLOT_LENGTH + H256::len_bytes();

    #[must_use]
    pub const fn new(slot: Slot, block_root: H256, retention_window: NonZeroU64) -> Self {
        Self {
            bucket: Self::bucket_of(slot, retention_window),
            slot,
            block_root,
        }
    }

    #[must_use]
    pub const fn bucket_of(slot: Slot, retention_window: NonZeroU64) -> u64 {
        slot % retention_window.get()
    }

    #[must_use]
    pub const fn bucket_prefix(bucket: u64) -> [u8; BUCKET_LENGTH] {
        bucket.to_be_bytes()
    }

    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::LENGTH] {
        let mut bytes = [0; Self::LENGTH];
        let (bucket, rest) = bytes.split_at_mut(BUCKET_LENGTH);
        let (slot, block_root) = rest.split_at_mut(SLOT_LENGTH);

        bucket.copy_from_slice(&self.bucket.to_be_bytes());
        slot.copy_from_slice(&self.slot.to_be_bytes());
        block_root.copy_from_slice(self.block_root.as_bytes());

        bytes
    }

    /// Returns `None` if `bytes` is not exactly [`StorageKey::LENGTH`] bytes long.
    #[must_use]
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let bytes = <&[u8; Self::LENGTH]>::try_from(bytes).ok()?;
        let (bucket, rest) = bytes.split_at(BUCKET_LENGTH);
        let (slot, block_root) = rest.split_at(SLOT_LENGTH);

        Some(Self {
            bucket: u64::from_be_bytes(bucket.try_into().ok()?),
            slot: Slot::from_be_bytes(slot.try_into().ok()?),
            block_root: H256::from_slice(block_root),
        })
    }
}

const BUCKET_LENGTH: usize = size_of::<u64>();
const SLOT_LENGTH: usize = size_of::<Slot>();

use core::{num::NonZeroU64, ops::Range};
use std::sync::Arc;

use anyhow::{ensure, Result};
use database::{Database, Transaction, TransactionKind};
use log::debug;
use prometheus_metrics::Metrics;
use ssz::{SszReadDefault as _, SszWrite as _};
use types::{
    config::Config,
    containers::BlobSidecar,
    primitives::{Slot, H256},
};

use crate::{
    error::{Corruption, Error},
    key::StorageKey,
};

#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct StoreOccupancy {
    pub sidecars: usize,
    pub lowest_slot: Option<Slot>,
    pub highest_slot: Option<Slot>,
}

/// Durable storage of blob sidecars bounded to a sliding window of slots.
///
/// Every slot maps to one of `retention_window` buckets. A bucket holds sidecars of a single slot.
/// Writing a sidecar for a newer slot evicts everything in its bucket in the same transaction.
pub struct SidecarStore {
    database: Database,
    retention_window: NonZeroU64,
    metrics: Option<Arc<Metrics>>,
}

impl SidecarStore {
    pub fn new(database: Database, config: &Config, metrics: Option<Arc<Metrics>>) -> Result<Self> {
        let retention_window = config.retention_window()?;

        Ok(Self {
            database,
            retention_window,
            metrics,
        })
    }

    #[must_use]
    pub const fn retention_window(&self) -> NonZeroU64 {
        self.retention_window
    }

    /// Stores `sidecar` unless its bucket already holds a sidecar for the same or a newer slot.
    ///
    /// Writes of stale or duplicate sidecars succeed without changing anything.
    pub fn put(&self, sidecar: &BlobSidecar) -> Result<()> {
        let key = StorageKey::new(sidecar.slot, sidecar.block_root, self.retention_window);
        let value = sidecar.to_ssz()?;

        let evicted = self.database.update(|transaction| {
            let occupants = bucket_keys(transaction, key.bucket)?;

            if let Some(first) = occupants.first() {
                ensure!(
                    first.len() == StorageKey::LENGTH,
                    Error::KeyLengthMismatch {
                        expected: StorageKey::LENGTH,
                        actual: first.len(),
                        key: first.clone(),
                    },
                );

                let occupant_slot = StorageKey::parse(first).map(|occupant| occupant.slot);

                if occupant_slot >= Some(key.slot) {
                    return Ok(None);
                }

                for occupant in &occupants {
                    transaction.delete(occupant)?;
                }
            }

            transaction.put(key.to_bytes(), &value)?;

            Ok(Some(occupants.len()))
        })?;

        match evicted {
            Some(evicted) => {
                debug!("stored blob sidecar {key} (evicted: {evicted})");

                if let Some(metrics) = self.metrics.as_ref() {
                    metrics.sidecar_store_puts.inc();
                    metrics
                        .sidecar_store_evictions
                        .inc_by(u64::try_from(evicted).unwrap_or(u64::MAX));
                }
            }
            None => debug!("ignored blob sidecar {key} because its bucket holds a newer one"),
        }

        Ok(())
    }

    pub fn get_by_root(&self, block_root: H256) -> Result<Option<Arc<BlobSidecar>>> {
        self.database.view(|transaction| {
            let mut cursor = transaction.cursor()?;

            while let Some((key_bytes, value)) = cursor.next()? {
                if let Some(key) = StorageKey::parse(&key_bytes) {
                    if key.block_root == block_root {
                        return decode(key, &value).map(Some);
                    }
                }
            }

            Ok(None)
        })
    }

    pub fn get_by_slot(&self, slot: Slot) -> Result<Vec<Arc<BlobSidecar>>> {
        self.database
            .view(|transaction| self.sidecars_at_slot(transaction, slot))
    }

    /// Returns sidecars for all slots in `slots` in ascending order, read in a single transaction.
    pub fn get_by_range(&self, slots: Range<Slot>) -> Result<Vec<Arc<BlobSidecar>>> {
        self.database.view(|transaction| {
            let slot_count = slots.end.saturating_sub(slots.start);

            // Past a full window every bucket would be visited more than once.
            if slot_count <= self.retention_window.get() {
                let mut sidecars = vec![];

                for slot in slots {
                    sidecars.extend(self.sidecars_at_slot(transaction, slot)?);
                }

                return Ok(sidecars);
            }

            let mut cursor = transaction.cursor()?;
            let mut sidecars = vec![];

            while let Some((key_bytes, value)) = cursor.next()? {
                if let Some(key) = StorageKey::parse(&key_bytes) {
                    if slots.contains(&key.slot) {
                        sidecars.push(decode(key, &value)?);
                    }
                }
            }

            sidecars.sort_by_key(|sidecar| sidecar.slot);

            Ok(sidecars)
        })
    }

    /// Removes every stored sidecar for `block_root`.
    pub fn delete(&self, block_root: H256) -> Result<()> {
        let deleted = self.database.update(|transaction| {
            let keys = matching_keys(transaction, |key| key.block_root == block_root)?;

            for key in &keys {
                transaction.delete(key.to_bytes())?;
            }

            Ok(keys.len())
        })?;

        debug!("deleted {deleted} blob sidecars with block root {block_root:?}");

        Ok(())
    }

    pub fn has(&self, block_root: H256) -> Result<bool> {
        self.database.view(|transaction| {
            matching_keys(transaction, |key| key.block_root == block_root)
                .map(|keys| !keys.is_empty())
        })
    }

    pub fn occupancy(&self) -> Result<StoreOccupancy> {
        self.database.view(|transaction| {
            let keys = matching_keys(transaction, |_| true)?;
            let slots = keys.iter().map(|key| key.slot);

            if let Some(metrics) = self.metrics.as_ref() {
                metrics.set_sidecar_store_sidecars(keys.len());
            }

            Ok(StoreOccupancy {
                sidecars: keys.len(),
                lowest_slot: slots.clone().min(),
                highest_slot: slots.max(),
            })
        })
    }

    fn sidecars_at_slot<K: TransactionKind>(
        &self,
        transaction: &Transaction<K>,
        slot: Slot,
    ) -> Result<Vec<Arc<BlobSidecar>>> {
        let bucket = StorageKey::bucket_of(slot, self.retention_window);
        let prefix = StorageKey::bucket_prefix(bucket);
        let mut cursor = transaction.cursor()?;
        let mut sidecars = vec![];
        let mut entry = cursor.seek(prefix)?;

        while let Some((key_bytes, value)) = entry {
            if !key_bytes.starts_with(&prefix) {
                break;
            }

            if let Some(key) = StorageKey::parse(&key_bytes) {
                if key.slot == slot {
                    sidecars.push(decode(key, &value)?);
                }
            }

            entry = cursor.next()?;
        }

        Ok(sidecars)
    }
}

// Keys are returned as they are stored so that entries of unexpected length can be reported.
fn bucket_keys<K: TransactionKind>(
    transaction: &Transaction<K>,
    bucket: u64,
) -> Result<Vec<Vec<u8>>> {
    let prefix = StorageKey::bucket_prefix(bucket);
    let mut cursor = transaction.cursor()?;
    let mut keys = vec![];
    let mut entry = cursor.seek(prefix)?;

    while let Some((key_bytes, _)) = entry {
        if !key_bytes.starts_with(&prefix) {
            break;
        }

        keys.push(key_bytes);
        entry = cursor.next()?;
    }

    Ok(keys)
}

fn matching_keys<K: TransactionKind>(
    transaction: &Transaction<K>,
    mut predicate: impl FnMut(&StorageKey) -> bool,
) -> Result<Vec<StorageKey>> {
    let mut cursor = transaction.cursor()?;
    let mut keys = vec![];

    while let Some((key_bytes, _)) = cursor.next()? {
        if let Some(key) = StorageKey::parse(&key_bytes) {
            if predicate(&key) {
                keys.push(key);
            }
        }
    }

    Ok(keys)
}

fn decode(key: StorageKey, value: &[u8]) -> Result<Arc<BlobSidecar>> {
    let corrupted = |reason| Error::Corrupted {
        slot: key.slot,
        block_root: key.block_root,
        reason,
    };

    let sidecar = BlobSidecar::from_ssz_default(value)
        .map_err(|error| corrupted(Corruption::Undecodable(error)))?;

    ensure!(
        sidecar.slot == key.slot,
        corrupted(Corruption::SlotMismatch(sidecar.slot)),
    );

    ensure!(
        sidecar.block_root == key.block_root,
        corrupted(Corruption::BlockRootMismatch(sidecar.block_root)),
    );

    Ok(Arc::new(sidecar))
}

use std::sync::Arc;

use cached::{Cached as _, SizedCache};
use log::{debug, warn};
use parking_lot::Mutex;
use prometheus_metrics::Metrics;
use sidecar_store::SidecarStore;
use thiserror::Error;
use types::{
    containers::BlobSidecar,
    primitives::{Slot, H256},
    traits::BeaconBlock,
};

use crate::{
    pending_sidecars::{Enqueued, PendingSidecarQueue},
    traits::{ChainAcceptance, ChainError},
};

const BAD_BLOCK_CACHE_SIZE: usize = 1024;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IngestOutcome {
    /// The block was handed to the chain, together with its sidecar if it has one.
    Forwarded,
    /// The block or sidecar is waiting for its counterpart.
    Deferred,
}

#[derive(Debug, Error)]
pub enum BlockIngestError {
    #[error("block {block_root:?} is known to be invalid")]
    KnownBadBlock { block_root: H256 },
    #[error("chain rejected block {block_root:?}")]
    Rejected {
        block_root: H256,
        #[source]
        source: ChainError,
    },
    #[error("sidecar store error")]
    Storage(#[source] anyhow::Error),
}

/// Joins blocks with their blob sidecars before handing them to the chain.
pub struct BlockIngestPath<B, C> {
    queue: PendingSidecarQueue<B>,
    store: Arc<SidecarStore>,
    chain: C,
    bad_blocks: Mutex<SizedCache<H256, ()>>,
    metrics: Option<Arc<Metrics>>,
}

impl<B: BeaconBlock, C: ChainAcceptance<B>> BlockIngestPath<B, C> {
    #[must_use]
    pub fn new(store: Arc<SidecarStore>, chain: C, metrics: Option<Arc<Metrics>>) -> Self {
        Self {
            queue: PendingSidecarQueue::new(store.retention_window(), metrics.clone()),
            store,
            chain,
            bad_blocks: Mutex::new(SizedCache::with_size(BAD_BLOCK_CACHE_SIZE)),
            metrics,
        }
    }

    pub fn on_block(&self, block: B) -> Result<IngestOutcome, BlockIngestError> {
        let slot = block.slot();
        let block_root = block.root();

        self.ensure_not_bad(block_root)?;

        if !block.has_blobs() {
            self.forward(block, block_root, None)?;
            return Ok(IngestOutcome::Forwarded);
        }

        let commitments = block.blob_kzg_commitments().to_vec();

        if let Enqueued::Matched { block, sidecar } =
            self.queue.enqueue_block(slot, block, block_root)
        {
            self.forward_pair(block, block_root, sidecar)?;
            return Ok(IngestOutcome::Forwarded);
        }

        // The sidecar may have been persisted earlier and rotated out of the queue since.
        let stored = self
            .store
            .get_by_root(block_root)
            .map_err(BlockIngestError::Storage)?
            .filter(|sidecar| sidecar.slot == slot && sidecar.commitments_match(&commitments));

        if let Some(sidecar) = stored {
            if let Some(block) = self.queue.take_block(slot, block_root) {
                debug!("found blob sidecar for block {block_root:?} in sidecar store");
                self.forward_pair(block, block_root, sidecar)?;
                return Ok(IngestOutcome::Forwarded);
            }
        }

        debug!(
            "deferring block until its blob sidecar arrives \
             (slot: {slot}, block_root: {block_root:?})",
        );

        if let Some(metrics) = self.metrics.as_ref() {
            metrics.deferred_blocks.inc();
        }

        Ok(IngestOutcome::Deferred)
    }

    /// Persists a sidecar received through gossip and forwards its block if it is waiting.
    ///
    /// A waiting block has left the queue once matched, so it is forwarded before the sidecar is
    /// persisted and a storage error cannot lose it.
    pub fn on_sidecar(&self, sidecar: Arc<BlobSidecar>) -> Result<IngestOutcome, BlockIngestError> {
        match self.queue.enqueue_sidecar(Arc::clone(&sidecar)) {
            Enqueued::Matched { block, sidecar } => {
                let block_root = sidecar.block_root;

                self.ensure_not_bad(block_root)?;

                let forwarded = self.forward_pair(block, block_root, Arc::clone(&sidecar));

                self.persist(&sidecar)?;

                forwarded.map(|()| IngestOutcome::Forwarded)
            }
            Enqueued::Pending => {
                // Persisted so that a block arriving after the queue rotates can still find it.
                self.persist(&sidecar)?;

                Ok(IngestOutcome::Deferred)
            }
        }
    }

    /// Persists sidecars fetched and verified through range requests.
    pub fn on_synced_sidecars(
        &self,
        sidecars: &[Arc<BlobSidecar>],
    ) -> Result<(), BlockIngestError> {
        sidecars.iter().try_for_each(|sidecar| self.persist(sidecar))
    }

    pub fn on_slot(&self, slot: Slot) {
        self.queue.on_slot(slot);
    }

    #[must_use]
    pub fn is_bad_block(&self, block_root: H256) -> bool {
        self.bad_blocks.lock().cache_get(&block_root).is_some()
    }

    #[must_use]
    pub const fn pending(&self) -> &PendingSidecarQueue<B> {
        &self.queue
    }

    fn ensure_not_bad(&self, block_root: H256) -> Result<(), BlockIngestError> {
        if self.is_bad_block(block_root) {
            if let Some(metrics) = self.metrics.as_ref() {
                metrics.rejected_bad_blocks.inc();
            }

            return Err(BlockIngestError::KnownBadBlock { block_root });
        }

        Ok(())
    }

    fn persist(&self, sidecar: &BlobSidecar) -> Result<(), BlockIngestError> {
        self.store.put(sidecar).map_err(BlockIngestError::Storage)
    }

    fn forward_pair(
        &self,
        block: B,
        block_root: H256,
        sidecar: Arc<BlobSidecar>,
    ) -> Result<(), BlockIngestError> {
        if let Some(metrics) = self.metrics.as_ref() {
            metrics.matched_pairs.inc();
        }

        self.forward(block, block_root, Some(sidecar))
    }

    fn forward(
        &self,
        block: B,
        block_root: H256,
        sidecar: Option<Arc<BlobSidecar>>,
    ) -> Result<(), BlockIngestError> {
        let Err(error) = self.chain.receive_block(block, block_root, sidecar) else {
            return Ok(());
        };

        if let ChainError::InvalidBlock {
            block_root: invalid_root,
            invalid_ancestors,
        } = &error
        {
            let invalid_root = invalid_root.unwrap_or(block_root);

            warn!(
                "marking block {invalid_root:?} and {} ancestors as invalid \
                 (processing block {block_root:?})",
                invalid_ancestors.len(),
            );

            let mut bad_blocks = self.bad_blocks.lock();

            bad_blocks.cache_set(invalid_root, ());

            for ancestor in invalid_ancestors {
                bad_blocks.cache_set(*ancestor, ());
            }
        }

        Err(BlockIngestError::Rejected {
            block_root,
            source: error,
        })
    }
}

#[cfg(test)]
mod tests {
    use anyhow::{anyhow, Result};
    use database::Database;
    use nonzero_ext::nonzero;
    use sidecar_store::StorageKey;
    use types::config::Config;

    use crate::test_utils::{self, TestBlock};

    use super::*;

    #[derive(Default)]
    struct RecordingChain {
        received: Mutex<Vec<(H256, Option<Slot>)>>,
        verdict: Mutex<Option<ChainError>>,
    }

    impl RecordingChain {
        fn received(&self) -> Vec<(H256, Option<Slot>)> {
            self.received.lock().clone()
        }
    }

    impl ChainAcceptance<TestBlock> for Arc<RecordingChain> {
        fn receive_block(
            &self,
            _block: TestBlock,
            block_root: H256,
            sidecar: Option<Arc<BlobSidecar>>,
        ) -> Result<(), ChainError> {
            self.received
                .lock()
                .push((block_root, sidecar.map(|sidecar| sidecar.slot)));

            self.verdict.lock().take().map_or(Ok(()), Err)
        }
    }

    type TestIngestPath = BlockIngestPath<TestBlock, Arc<RecordingChain>>;

    fn ingest_path() -> Result<(TestIngestPath, Arc<RecordingChain>)> {
        ingest_path_with_database(Database::in_memory())
    }

    // Retention window of 10 slots with the clock at slot 10.
    fn ingest_path_with_database(
        database: Database,
    ) -> Result<(TestIngestPath, Arc<RecordingChain>)> {
        let config = Config {
            slots_per_epoch: nonzero!(2_u64),
            min_epochs_for_blob_sidecars_requests: 5,
            ..Config::default()
        };

        let store = SidecarStore::new(database, &config, None)?;
        let chain = Arc::new(RecordingChain::default());
        let ingest_path = BlockIngestPath::new(Arc::new(store), Arc::clone(&chain), None);

        ingest_path.on_slot(10);

        Ok((ingest_path, chain))
    }

    fn root(byte: u8) -> H256 {
        H256::repeat_byte(byte)
    }

    #[test]
    fn block_without_blobs_is_forwarded_directly() -> Result<()> {
        let (ingest_path, chain) = ingest_path()?;

        let outcome = ingest_path.on_block(test_utils::block(4, 1, &[]))?;

        assert_eq!(outcome, IngestOutcome::Forwarded);
        assert_eq!(chain.received(), [(root(1), None)]);

        Ok(())
    }

    #[test]
    fn block_waits_for_its_sidecar() -> Result<()> {
        let (ingest_path, chain) = ingest_path()?;

        let outcome = ingest_path.on_block(test_utils::block(4, 1, &[7]))?;

        assert_eq!(outcome, IngestOutcome::Deferred);
        assert!(chain.received().is_empty());
        assert_eq!(ingest_path.pending().blocks_len(), 1);

        let outcome = ingest_path.on_sidecar(test_utils::sidecar(4, 1, &[7])?)?;

        assert_eq!(outcome, IngestOutcome::Forwarded);
        assert_eq!(chain.received(), [(root(1), Some(4))]);
        assert!(ingest_path.store.has(root(1))?);
        assert_eq!(ingest_path.pending().blocks_len(), 0);

        Ok(())
    }

    #[test]
    fn sidecar_waits_for_its_block() -> Result<()> {
        let (ingest_path, chain) = ingest_path()?;

        let outcome = ingest_path.on_sidecar(test_utils::sidecar(4, 1, &[7])?)?;

        assert_eq!(outcome, IngestOutcome::Deferred);
        assert!(ingest_path.store.has(root(1))?);

        let outcome = ingest_path.on_block(test_utils::block(4, 1, &[7]))?;

        assert_eq!(outcome, IngestOutcome::Forwarded);
        assert_eq!(chain.received(), [(root(1), Some(4))]);
        assert_eq!(ingest_path.pending().sidecars_len(), 0);

        Ok(())
    }

    #[test]
    fn matched_block_is_forwarded_when_sidecar_cannot_be_stored() -> Result<()> {
        let database = Database::in_memory();

        // A key of unexpected length in the bucket of slot 4 makes every put into it fail.
        let mut malformed_key = StorageKey::bucket_prefix(4).to_vec();
        malformed_key.extend_from_slice(&[1, 2, 3]);

        database.update(|transaction| transaction.put(&malformed_key, [0_u8]))?;

        let (ingest_path, chain) = ingest_path_with_database(database)?;

        let outcome = ingest_path.on_block(test_utils::block(4, 1, &[7]))?;

        assert_eq!(outcome, IngestOutcome::Deferred);
        assert_eq!(ingest_path.pending().blocks_len(), 1);

        let result = ingest_path.on_sidecar(test_utils::sidecar(4, 1, &[7])?);

        assert!(matches!(result, Err(BlockIngestError::Storage(_))));
        assert_eq!(chain.received(), [(root(1), Some(4))]);
        assert_eq!(ingest_path.pending().blocks_len(), 0);

        Ok(())
    }

    #[test]
    fn rejected_block_does_not_prevent_storing_its_sidecar() -> Result<()> {
        let (ingest_path, chain) = ingest_path()?;

        ingest_path.on_block(test_utils::block(4, 1, &[7]))?;

        *chain.verdict.lock() = Some(ChainError::Other(anyhow!("execution engine offline")));

        let result = ingest_path.on_sidecar(test_utils::sidecar(4, 1, &[7])?);

        assert!(matches!(result, Err(BlockIngestError::Rejected { .. })));
        assert!(ingest_path.store.has(root(1))?);

        Ok(())
    }

    #[test]
    fn synced_sidecar_is_found_in_store() -> Result<()> {
        let (ingest_path, chain) = ingest_path()?;

        ingest_path.on_synced_sidecars(&[
            test_utils::sidecar(4, 1, &[7])?,
            test_utils::sidecar(5, 2, &[8])?,
        ])?;

        let outcome = ingest_path.on_block(test_utils::block(4, 1, &[7]))?;

        assert_eq!(outcome, IngestOutcome::Forwarded);
        assert_eq!(chain.received(), [(root(1), Some(4))]);
        assert_eq!(ingest_path.pending().blocks_len(), 0);

        // A stored sidecar with different commitments does not release the block.
        let outcome = ingest_path.on_block(test_utils::block(5, 2, &[9]))?;

        assert_eq!(outcome, IngestOutcome::Deferred);
        assert_eq!(ingest_path.pending().blocks_len(), 1);

        Ok(())
    }

    #[test]
    fn invalid_block_and_ancestors_are_marked_bad() -> Result<()> {
        let (ingest_path, chain) = ingest_path()?;

        *chain.verdict.lock() = Some(ChainError::InvalidBlock {
            block_root: None,
            invalid_ancestors: vec![root(8), root(9)],
        });

        let result = ingest_path.on_block(test_utils::block(4, 1, &[]));

        assert!(matches!(result, Err(BlockIngestError::Rejected { .. })));

        for byte in [1, 8, 9] {
            assert!(ingest_path.is_bad_block(root(byte)));
        }

        let result = ingest_path.on_block(test_utils::block(4, 1, &[]));

        assert!(matches!(
            result,
            Err(BlockIngestError::KnownBadBlock { block_root }) if block_root == root(1),
        ));
        assert_eq!(chain.received().len(), 1);

        Ok(())
    }

    #[test]
    fn reported_invalid_root_is_marked_instead_of_block() -> Result<()> {
        let (ingest_path, chain) = ingest_path()?;

        *chain.verdict.lock() = Some(ChainError::InvalidBlock {
            block_root: Some(root(5)),
            invalid_ancestors: vec![],
        });

        assert!(ingest_path.on_block(test_utils::block(4, 1, &[])).is_err());
        assert!(ingest_path.is_bad_block(root(5)));
        assert!(!ingest_path.is_bad_block(root(1)));

        Ok(())
    }

    #[test]
    fn other_chain_errors_do_not_mark_blocks() -> Result<()> {
        let (ingest_path, chain) = ingest_path()?;

        *chain.verdict.lock() = Some(ChainError::Other(anyhow!("execution engine offline")));

        assert!(ingest_path.on_block(test_utils::block(4, 1, &[])).is_err());
        assert!(!ingest_path.is_bad_block(root(1)));

        Ok(())
    }
}

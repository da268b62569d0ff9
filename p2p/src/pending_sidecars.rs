//! Rendezvous point for blocks and blob sidecars that arrive through independent channels.
//!
//! A block declaring blob commitments cannot be processed without its sidecar and a sidecar is
//! useless without its block. Whichever arrives first waits here for the other one. Entries for
//! slots that have left the retention window are dropped silently.
//!
//! The window is anchored to the wall clock slot passed to [`PendingSidecarQueue::on_slot`].
//! Arrivals only carry slots claimed by peers, so they never move it.

use core::num::NonZeroU64;
use std::{collections::BTreeMap, sync::Arc};

use log::{debug, warn};
use parking_lot::Mutex;
use prometheus_metrics::Metrics;
use types::{
    containers::BlobSidecar,
    primitives::{Slot, H256},
    traits::BeaconBlock,
};

/// Maximum number of blocks or sidecars buffered for a single slot.
pub const MAX_PENDING_PER_SLOT: usize = 16;

#[derive(Debug)]
pub enum Enqueued<B> {
    Matched { block: B, sidecar: Arc<BlobSidecar> },
    Pending,
}

impl<B> Enqueued<B> {
    #[must_use]
    pub const fn is_matched(&self) -> bool {
        matches!(self, Self::Matched { .. })
    }
}

pub struct PendingSidecarQueue<B> {
    retention_window: NonZeroU64,
    state: Mutex<State<B>>,
    metrics: Option<Arc<Metrics>>,
}

struct State<B> {
    blocks: BTreeMap<Slot, Vec<PendingBlock<B>>>,
    sidecars: BTreeMap<Slot, Vec<Arc<BlobSidecar>>>,
    current_slot: Slot,
}

struct PendingBlock<B> {
    block_root: H256,
    block: B,
}

impl<B: BeaconBlock> PendingSidecarQueue<B> {
    #[must_use]
    pub fn new(retention_window: NonZeroU64, metrics: Option<Arc<Metrics>>) -> Self {
        Self {
            retention_window,
            state: Mutex::new(State {
                blocks: BTreeMap::new(),
                sidecars: BTreeMap::new(),
                current_slot: 0,
            }),
            metrics,
        }
    }

    pub fn enqueue_block(&self, slot: Slot, block: B, block_root: H256) -> Enqueued<B> {
        let mut state = self.state.lock();

        if !state.accepts(slot, self.retention_window) {
            debug!(
                "dropping block outside of retention window \
                 (slot: {slot}, block_root: {block_root:?})",
            );
            self.track_lengths(&state);
            return Enqueued::Pending;
        }

        let matching_sidecar = state.sidecars.get_mut(&slot).and_then(|sidecars| {
            let position = sidecars.iter().position(|sidecar| {
                sidecar.block_root == block_root
                    && sidecar.commitments_match(block.blob_kzg_commitments())
            })?;

            Some(sidecars.remove(position))
        });

        let enqueued = match matching_sidecar {
            Some(sidecar) => {
                remove_if_empty(&mut state.sidecars, slot);
                Enqueued::Matched { block, sidecar }
            }
            None => {
                let pending = state.blocks.entry(slot).or_default();

                pending.retain(|pending_block| pending_block.block_root != block_root);

                if pending.len() >= MAX_PENDING_PER_SLOT {
                    let evicted = pending.remove(0);

                    warn!(
                        "too many pending blocks at slot {slot}; dropping block {:?}",
                        evicted.block_root,
                    );
                }

                pending.push(PendingBlock { block_root, block });

                Enqueued::Pending
            }
        };

        self.track_lengths(&state);

        enqueued
    }

    pub fn enqueue_sidecar(&self, sidecar: Arc<BlobSidecar>) -> Enqueued<B> {
        let slot = sidecar.slot;
        let block_root = sidecar.block_root;
        let mut state = self.state.lock();

        if !state.accepts(slot, self.retention_window) {
            debug!(
                "dropping blob sidecar outside of retention window \
                 (slot: {slot}, block_root: {block_root:?})",
            );
            self.track_lengths(&state);
            return Enqueued::Pending;
        }

        let matching_block = state.blocks.get_mut(&slot).and_then(|blocks| {
            let position = blocks.iter().position(|pending_block| {
                pending_block.block_root == block_root
                    && sidecar.commitments_match(pending_block.block.blob_kzg_commitments())
            })?;

            Some(blocks.remove(position))
        });

        let enqueued = match matching_block {
            Some(PendingBlock { block, .. }) => {
                remove_if_empty(&mut state.blocks, slot);
                Enqueued::Matched { block, sidecar }
            }
            None => {
                let pending = state.sidecars.entry(slot).or_default();

                pending.retain(|pending_sidecar| pending_sidecar.block_root != block_root);

                if pending.len() >= MAX_PENDING_PER_SLOT {
                    let evicted = pending.remove(0);

                    warn!(
                        "too many pending blob sidecars at slot {slot}; dropping sidecar for {:?}",
                        evicted.block_root,
                    );
                }

                pending.push(sidecar);

                Enqueued::Pending
            }
        };

        self.track_lengths(&state);

        enqueued
    }

    /// Removes a buffered block regardless of whether its sidecar has arrived.
    pub fn take_block(&self, slot: Slot, block_root: H256) -> Option<B> {
        let mut state = self.state.lock();

        let block = state.blocks.get_mut(&slot).and_then(|blocks| {
            let position = blocks
                .iter()
                .position(|pending_block| pending_block.block_root == block_root)?;

            Some(blocks.remove(position).block)
        });

        remove_if_empty(&mut state.blocks, slot);
        self.track_lengths(&state);

        block
    }

    /// Moves the window to end at `slot`. Slots earlier than the current one are ignored.
    pub fn on_slot(&self, slot: Slot) {
        let mut state = self.state.lock();
        state.current_slot = state.current_slot.max(slot);
        state.prune(self.retention_window);
        self.track_lengths(&state);
    }

    #[must_use]
    pub fn blocks_len(&self) -> usize {
        self.state.lock().blocks.values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn sidecars_len(&self) -> usize {
        self.state.lock().sidecars.values().map(Vec::len).sum()
    }

    fn track_lengths(&self, state: &State<B>) {
        if let Some(metrics) = self.metrics.as_ref() {
            metrics.set_pending_lengths(
                state.blocks.values().map(Vec::len).sum(),
                state.sidecars.values().map(Vec::len).sum(),
            );
        }
    }
}

impl<B> State<B> {
    /// Drops expired entries and checks whether `slot` lies in `[oldest retained, current]`.
    fn accepts(&mut self, slot: Slot, retention_window: NonZeroU64) -> bool {
        let oldest_retained_slot = self.prune(retention_window);
        (oldest_retained_slot..=self.current_slot).contains(&slot)
    }

    fn prune(&mut self, retention_window: NonZeroU64) -> Slot {
        let oldest_retained_slot = self
            .current_slot
            .saturating_add(1)
            .saturating_sub(retention_window.get());

        self.blocks = self.blocks.split_off(&oldest_retained_slot);
        self.sidecars = self.sidecars.split_off(&oldest_retained_slot);

        oldest_retained_slot
    }
}

fn remove_if_empty<T>(map: &mut BTreeMap<Slot, Vec<T>>, slot: Slot) {
    if map.get(&slot).is_some_and(Vec::is_empty) {
        map.remove(&slot);
    }
}

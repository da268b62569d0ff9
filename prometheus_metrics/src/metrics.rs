use std::sync::Arc;

use anyhow::Result;
use log::warn;
use once_cell::sync::OnceCell;
use prometheus::{histogram_opts, opts, Histogram, IntCounter, IntCounterVec, IntGauge};

pub static METRICS: OnceCell<Arc<Metrics>> = OnceCell::new();

#[derive(Debug)]
pub struct Metrics {
    // Sidecar store
    pub sidecar_store_puts: IntCounter,
    pub sidecar_store_evictions: IntCounter,
    pub sidecar_store_sidecars: IntGauge,

    // Range requests served
    pub range_requests: IntCounter,
    pub range_response_chunks: IntCounter,
    pub range_requests_rate_limited: IntCounter,
    pub range_error_responses: IntCounterVec,
    pub range_request_times: Histogram,

    // Range requests sent
    pub sidecar_verification_failures: IntCounter,

    // Pending queue
    pub pending_blocks: IntGauge,
    pub pending_sidecars: IntGauge,

    // Block ingest
    pub matched_pairs: IntCounter,
    pub deferred_blocks: IntCounter,
    pub rejected_bad_blocks: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        Ok(Self {
            // Sidecar store
            sidecar_store_puts: IntCounter::new(
                "SIDECAR_STORE_PUTS",
                "Number of blob sidecars written to the sidecar store",
            )?,

            sidecar_store_evictions: IntCounter::new(
                "SIDECAR_STORE_EVICTIONS",
                "Number of blob sidecars evicted by newer sidecars in the same bucket",
            )?,

            sidecar_store_sidecars: IntGauge::new(
                "SIDECAR_STORE_SIDECARS",
                "Number of blob sidecars in the sidecar store when last inspected",
            )?,

            // Range requests served
            range_requests: IntCounter::new(
                "BLOB_SIDECARS_BY_RANGE_REQUESTS",
                "Number of blob sidecar range requests received",
            )?,

            range_response_chunks: IntCounter::new(
                "BLOB_SIDECARS_BY_RANGE_RESPONSE_CHUNKS",
                "Number of blob sidecars sent in response to range requests",
            )?,

            range_requests_rate_limited: IntCounter::new(
                "BLOB_SIDECARS_BY_RANGE_RATE_LIMITED",
                "Number of range requests cut short by the rate limiter",
            )?,

            range_error_responses: IntCounterVec::new(
                opts!(
                    "BLOB_SIDECARS_BY_RANGE_ERROR_RESPONSES",
                    "Number of error chunks sent in response to range requests",
                ),
                &["code"],
            )?,

            range_request_times: Histogram::with_opts(histogram_opts!(
                "BLOB_SIDECARS_BY_RANGE_REQUEST_TIMES",
                "Time spent serving blob sidecar range requests",
            ))?,

            // Range requests sent
            sidecar_verification_failures: IntCounter::new(
                "BLOB_SIDECAR_VERIFICATION_FAILURES",
                "Number of fetched blob sidecars that failed verification",
            )?,

            // Pending queue
            pending_blocks: IntGauge::new(
                "PENDING_SIDECAR_QUEUE_BLOCKS",
                "Number of blocks waiting for their blob sidecar",
            )?,

            pending_sidecars: IntGauge::new(
                "PENDING_SIDECAR_QUEUE_SIDECARS",
                "Number of blob sidecars waiting for their block",
            )?,

            // Block ingest
            matched_pairs: IntCounter::new(
                "BLOCK_INGEST_MATCHED_PAIRS",
                "Number of blocks delivered together with their blob sidecar",
            )?,

            deferred_blocks: IntCounter::new(
                "BLOCK_INGEST_DEFERRED_BLOCKS",
                "Number of blocks deferred until their blob sidecar arrives",
            )?,

            rejected_bad_blocks: IntCounter::new(
                "BLOCK_INGEST_REJECTED_BAD_BLOCKS",
                "Number of blocks rejected because they were already known to be invalid",
            )?,
        })
    }

    pub fn register_with_default_metrics(&self) -> Result<()> {
        let default_registry = prometheus::default_registry();

        default_registry.register(Box::new(self.sidecar_store_puts.clone()))?;
        default_registry.register(Box::new(self.sidecar_store_evictions.clone()))?;
        default_registry.register(Box::new(self.sidecar_store_sidecars.clone()))?;
        default_registry.register(Box::new(self.range_requests.clone()))?;
        default_registry.register(Box::new(self.range_response_chunks.clone()))?;
        default_registry.register(Box::new(self.range_requests_rate_limited.clone()))?;
        default_registry.register(Box::new(self.range_error_responses.clone()))?;
        default_registry.register(Box::new(self.range_request_times.clone()))?;
        default_registry.register(Box::new(self.sidecar_verification_failures.clone()))?;
        default_registry.register(Box::new(self.pending_blocks.clone()))?;
        default_registry.register(Box::new(self.pending_sidecars.clone()))?;
        default_registry.register(Box::new(self.matched_pairs.clone()))?;
        default_registry.register(Box::new(self.deferred_blocks.clone()))?;
        default_registry.register(Box::new(self.rejected_bad_blocks.clone()))?;

        Ok(())
    }

    // Sidecar store
    pub fn set_sidecar_store_sidecars(&self, sidecars: usize) {
        self.sidecar_store_sidecars
            .set(i64::try_from(sidecars).unwrap_or(i64::MAX));
    }

    // Range requests served
    pub fn register_range_error_response(&self, code: &str) {
        match self.range_error_responses.get_metric_with_label_values(&[code]) {
            Ok(counter) => counter.inc(),
            Err(error) => warn!("unable to register range error response ({code}): {error:?}"),
        }
    }

    // Pending queue
    pub fn set_pending_lengths(&self, blocks: usize, sidecars: usize) {
        self.pending_blocks
            .set(i64::try_from(blocks).unwrap_or(i64::MAX));
        self.pending_sidecars
            .set(i64::try_from(sidecars).unwrap_or(i64::MAX));
    }
}

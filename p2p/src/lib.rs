pub use crate::{
    blobs_by_range::{BlobSidecarsByRangeClient, BlobSidecarsByRangeServer},
    block_ingest::{BlockIngestError, BlockIngestPath, IngestOutcome},
    codec::{RequestCodec, ResponseChunk, ResponseCodec},
    error::{Error, InvalidFetchedData, ProtocolError},
    misc::{PeerAction, ResponseCode, SIDECAR_REQUEST_COST},
    pending_sidecars::{Enqueued, PendingSidecarQueue, MAX_PENDING_PER_SLOT},
    rate_limiter::{RateLimited, RateLimiter},
    traits::{BlobSidecarVerifier, BlockLookup, ChainAcceptance, ChainError},
    verifier::{CommitmentVerifier, KzgProofVerifier, VerificationError},
};

mod blobs_by_range;
mod block_ingest;
mod codec;
mod error;
mod misc;
mod pending_sidecars;
mod rate_limiter;
mod traits;
mod verifier;

#[cfg(test)]
mod test_utils;

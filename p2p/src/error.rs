use std::io::Error as IoError;

use ssz::ReadError;
use thiserror::Error;
use types::primitives::{Slot, H256};

use crate::{
    misc::{PeerAction, ResponseCode},
    verifier::VerificationError,
};

/// Failures of the blob sidecar range protocol.
#[derive(Debug, Error)]
pub enum Error {
    #[error("transport error")]
    Transport(#[from] IoError),
    #[error("protocol violation")]
    Protocol(#[from] ProtocolError),
    #[error("storage error")]
    Storage(#[source] anyhow::Error),
    #[error("peer sent invalid data")]
    InvalidFetchedData(#[from] InvalidFetchedData),
    #[error("block for blob sidecar is unknown: {block_root:?}")]
    UnknownBlock { block_root: H256 },
    #[error("peer responded with {code}: {message}")]
    ErrorResponse { code: ResponseCode, message: String },
    #[error("request was rate limited")]
    RateLimited,
    #[error("request was cancelled")]
    Cancelled,
}

impl Error {
    /// Penalty the peer on the other side of the stream deserves, if any.
    #[must_use]
    pub const fn peer_action(&self) -> Option<PeerAction> {
        match self {
            Self::InvalidFetchedData(_) => Some(PeerAction::LowToleranceError),
            Self::Protocol(_) | Self::ErrorResponse { .. } => Some(PeerAction::MidToleranceError),
            Self::Transport(_) => Some(PeerAction::HighToleranceError),
            Self::Storage(_)
            | Self::UnknownBlock { .. }
            | Self::RateLimited
            | Self::Cancelled => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("chunk of {length} bytes exceeds maximum of {maximum} bytes")]
    ChunkTooLarge { length: usize, maximum: usize },
    #[error("invalid length prefix")]
    InvalidLengthPrefix,
    #[error("invalid Snappy frames")]
    InvalidSnappy(#[source] IoError),
    #[error("payload decompresses to more than the declared {declared} bytes")]
    PayloadLengthMismatch { declared: usize },
    #[error("invalid SSZ")]
    InvalidSsz(#[from] ReadError),
    #[error("unknown response code: {0}")]
    UnknownResponseCode(u8),
    #[error("stream ended in the middle of a chunk")]
    TruncatedChunk,
    #[error("stream ended before the request was received")]
    MissingRequest,
}

#[derive(Debug, Error)]
pub enum InvalidFetchedData {
    #[error("blob sidecar for slot {slot} failed verification")]
    VerificationFailed {
        slot: Slot,
        block_root: H256,
        #[source]
        source: VerificationError,
    },
    #[error("peer sent more than {maximum} blob sidecars")]
    TooManySidecars { maximum: u64 },
    #[error("blob sidecar for slot {slot} is outside requested range {start_slot}..{end_slot}")]
    SlotOutOfRange {
        slot: Slot,
        start_slot: Slot,
        end_slot: Slot,
    },
    #[error("blob sidecar for slot {slot} was sent after one for slot {previous_slot}")]
    SlotsNotAscending { previous_slot: Slot, slot: Slot },
}

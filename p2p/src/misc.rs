use strum::{AsRefStr, Display, FromRepr};

/// Rate limiter tokens charged for every slot served in response to a range request.
///
/// Roughly the number of bytes of an average sidecar on the wire.
pub const SIDECAR_REQUEST_COST: u64 = 1 << 10;

/// Result codes of response chunks.
#[derive(Clone, Copy, PartialEq, Eq, Debug, AsRefStr, Display, FromRepr)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum ResponseCode {
    Success = 0,
    InvalidRequest = 1,
    ServerError = 2,
    ResourceUnavailable = 3,
}

/// Penalty to apply to a peer whose request or response failed.
///
/// Mirrors the tolerance levels used by the peer manager: low tolerance errors get a peer banned
/// after a few occurrences, high tolerance errors only after many.
#[derive(Clone, Copy, PartialEq, Eq, Debug, AsRefStr)]
pub enum PeerAction {
    LowToleranceError,
    MidToleranceError,
    HighToleranceError,
}

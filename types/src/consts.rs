use typenum::{U131072, U16, U256};

pub type BytesPerBlob = U131072;
pub type MaxBlobsPerSidecar = U16;
pub type MaxErrorMessageLength = U256;

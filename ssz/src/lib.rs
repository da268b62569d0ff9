//! A subset of [SSZ] sufficient for blob sidecars and the messages that carry them.
//!
//! Merkleization is not implemented. Block roots are computed elsewhere and passed around as
//! opaque [`H256`] values.
//!
//! [SSZ]: https://github.com/ethereum/consensus-specs/blob/dev/ssz/simple-serialize.md

pub use primitive_types::{H256, H384};
pub use typenum;

pub use crate::{
    byte_list::ByteList,
    consts::{Endianness, Offset, BYTES_PER_LENGTH_OFFSET},
    contiguous_list::ContiguousList,
    error::{ReadError, WriteError},
    porcelain::{SszRead, SszReadDefault, SszSize, SszWrite},
    shared::{read_offset_unchecked, subslice, write_offset},
    size::Size,
};

mod basic;
mod byte_list;
mod consts;
mod contiguous_list;
mod error;
mod fixed_hashes;
mod porcelain;
mod shared;
mod size;

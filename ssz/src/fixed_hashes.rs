// Impls for types corresponding to the `BytesN` types from the SSZ specification.
// They are not basic types, so they are not packed.

use primitive_types::{H256, H384};

use crate::{
    error::ReadError,
    porcelain::{SszRead, SszSize, SszWrite},
    size::Size,
};

macro_rules! impl_fixed_hash {
    ($hash: ty) => {
        impl SszSize for $hash {
            const SIZE: Size = Size::Fixed {
                size: <$hash>::len_bytes(),
            };
        }

        impl<C> SszRead<C> for $hash {
            #[inline]
            fn from_ssz_unchecked(_context: &C, bytes: &[u8]) -> Result<Self, ReadError> {
                Ok(Self::from_slice(bytes))
            }
        }

        impl SszWrite for $hash {
            #[inline]
            fn write_fixed(&self, bytes: &mut [u8]) {
                bytes.copy_from_slice(self.as_bytes());
            }
        }
    };
}

impl_fixed_hash!(H256);
impl_fixed_hash!(H384);

use byteorder::ByteOrder as _;

use crate::{
    consts::Endianness,
    error::ReadError,
    porcelain::{SszRead, SszSize, SszWrite},
    size::Size,
};

impl SszSize for u8 {
    const SIZE: Size = Size::Fixed {
        size: size_of::<Self>(),
    };
}

impl<C> SszRead<C> for u8 {
    #[inline]
    fn from_ssz_unchecked(_context: &C, bytes: &[u8]) -> Result<Self, ReadError> {
        Ok(bytes[0])
    }
}

impl SszWrite for u8 {
    #[inline]
    fn write_fixed(&self, bytes: &mut [u8]) {
        bytes[0] = *self
    }
}

impl SszSize for u32 {
    const SIZE: Size = Size::Fixed {
        size: size_of::<Self>(),
    };
}

impl<C> SszRead<C> for u32 {
    #[inline]
    fn from_ssz_unchecked(_context: &C, bytes: &[u8]) -> Result<Self, ReadError> {
        Ok(Endianness::read_u32(bytes))
    }
}

impl SszWrite for u32 {
    #[inline]
    fn write_fixed(&self, bytes: &mut [u8]) {
        Endianness::write_u32(bytes, *self);
    }
}

impl SszSize for u64 {
    const SIZE: Size = Size::Fixed {
        size: size_of::<Self>(),
    };
}

impl<C> SszRead<C> for u64 {
    #[inline]
    fn from_ssz_unchecked(_context: &C, bytes: &[u8]) -> Result<Self, ReadError> {
        Ok(Endianness::read_u64(bytes))
    }
}

impl SszWrite for u64 {
    #[inline]
    fn write_fixed(&self, bytes: &mut [u8]) {
        Endianness::write_u64(bytes, *self);
    }
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use crate::porcelain::SszReadDefault as _;

    use super::*;

    #[test]
    fn u64_is_little_endian() -> Result<(), ReadError> {
        let bytes = hex!("0100000000000080");

        assert_eq!(u64::from_ssz_default(bytes)?, 0x8000_0000_0000_0001);
        assert_eq!(0x8000_0000_0000_0001_u64.to_ssz(), Ok(bytes.to_vec()));

        Ok(())
    }

    #[test]
    fn u64_rejects_wrong_length() {
        assert_eq!(
            u64::from_ssz_default([0; 7]),
            Err(ReadError::FixedSizeMismatch {
                expected: 8,
                actual: 7,
            }),
        );
    }
}

use core::fmt::{Debug, Formatter, Result as FmtResult};

use derivative::Derivative;
use derive_more::From;
use typenum::Unsigned;

use crate::{
    contiguous_list::ContiguousList,
    error::{ReadError, WriteError},
    porcelain::{SszRead, SszSize, SszWrite},
    size::Size,
};

#[derive(From, Derivative)]
#[derivative(
    Clone(bound = ""),
    PartialEq(bound = ""),
    Eq(bound = ""),
    Hash(bound = ""),
    Default(bound = "")
)]
pub struct ByteList<N> {
    bytes: ContiguousList<u8, N>,
}

impl<N> ByteList<N> {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl<N: Unsigned> TryFrom<Vec<u8>> for ByteList<N> {
    type Error = ReadError;

    fn try_from(bytes: Vec<u8>) -> Result<Self, ReadError> {
        ContiguousList::<u8, N>::try_from(bytes).map(|bytes| Self { bytes })
    }
}

impl<N: Unsigned> TryFrom<&[u8]> for ByteList<N> {
    type Error = ReadError;

    fn try_from(bytes: &[u8]) -> Result<Self, ReadError> {
        ContiguousList::<u8, N>::validate_length(bytes.len())?;
        let bytes = ContiguousList::new_unchecked(bytes.into());
        Ok(Self { bytes })
    }
}

// Blobs are large. Printing all of them in logs would be useless.
impl<N> Debug for ByteList<N> {
    fn fmt(&self, formatter: &mut Formatter) -> FmtResult {
        const SHOWN: usize = 32;

        formatter.write_str("0x")?;

        for byte in self.bytes.iter().take(SHOWN) {
            write!(formatter, "{byte:02x}")?;
        }

        if self.bytes.len() > SHOWN {
            write!(formatter, "… ({} bytes)", self.bytes.len())?;
        }

        Ok(())
    }
}

impl<N> SszSize for ByteList<N> {
    const SIZE: Size = Size::Variable { minimum_size: 0 };
}

impl<C, N: Unsigned> SszRead<C> for ByteList<N> {
    fn from_ssz_unchecked(_context: &C, bytes: &[u8]) -> Result<Self, ReadError> {
        // Do not forward to `ContiguousList::from_ssz_unchecked`.
        // Copying the slice directly is much faster for blobs.
        bytes.try_into()
    }
}

impl<N> SszWrite for ByteList<N> {
    fn write_variable(&self, bytes: &mut Vec<u8>) -> Result<(), WriteError> {
        bytes.extend_from_slice(self.as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use typenum::U4;

    use crate::porcelain::SszReadDefault as _;

    use super::*;

    #[test]
    fn byte_list_is_written_verbatim() -> Result<(), ReadError> {
        let list = ByteList::<U4>::try_from(vec![1, 2, 3])?;

        assert_eq!(list.to_ssz(), Ok(vec![1, 2, 3]));
        assert_eq!(ByteList::<U4>::from_ssz_default([1, 2, 3])?, list);

        Ok(())
    }

    #[test]
    fn byte_list_longer_than_maximum_is_rejected() {
        assert_eq!(
            ByteList::<U4>::from_ssz_default([0; 5]),
            Err(ReadError::ListTooLong {
                maximum: 4,
                actual: 5,
            }),
        );
    }

    #[test]
    fn long_byte_list_is_abbreviated_in_debug_output() -> Result<(), ReadError> {
        let list = ByteList::<typenum::U64>::try_from(vec![0xab; 40])?;

        assert_eq!(
            format!("{list:?}"),
            format!("0x{}… (40 bytes)", "ab".repeat(32)),
        );

        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Size {
    Fixed { size: usize },
    Variable { minimum_size: usize },
}

impl Size {
    /// Number of bytes the value occupies in the fixed part of an enclosing container.
    ///
    /// Variable-size values are represented there by an offset.
    #[must_use]
    pub const fn fixed_part(self) -> usize {
        match self {
            Self::Fixed { size } => size,
            Self::Variable { .. } => crate::consts::BYTES_PER_LENGTH_OFFSET,
        }
    }

    #[must_use]
    pub const fn is_variable(self) -> bool {
        matches!(self, Self::Variable { .. })
    }
}

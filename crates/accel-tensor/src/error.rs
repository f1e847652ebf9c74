use thiserror::Error;

/// An error type for shape validation and broadcast planning.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShapeError {
    /// Every axis of a device tensor must hold at least one element.
    #[error("Axis {axis} of shape {shape:?} is zero")]
    ZeroDimension {
        /// Index of the offending axis.
        axis: usize,
        /// The rejected shape.
        shape: Vec<u32>,
    },

    /// The source shape has more axes than the target it should be broadcast into.
    #[error("Cannot broadcast rank {source_rank} into rank {target_rank}")]
    RankMismatch {
        /// Rank of the operand being broadcast.
        source_rank: usize,
        /// Rank of the target shape.
        target_rank: usize,
    },

    /// A source axis does not evenly divide the matching target axis.
    #[error("Axis {axis}: size {size} does not divide target size {target}")]
    NotDivisible {
        /// Index of the offending axis.
        axis: usize,
        /// Source axis size.
        size: u32,
        /// Target axis size.
        target: u32,
    },

    /// A reinterpretation changes the number of elements.
    #[error("Element count mismatch: {0} != {1}")]
    ElementCountMismatch(u64, u64),

    /// The byte size of a tensor does not fit in a device address.
    #[error("Shape {shape:?} of {element_size}-byte elements is too large")]
    TooLarge {
        /// The rejected shape.
        shape: Vec<u32>,
        /// Byte width of one element.
        element_size: u64,
    },
}

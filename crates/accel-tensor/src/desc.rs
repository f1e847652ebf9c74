use crate::{dtype::DataType, error::ShapeError};

/// Rank of every tensor handled by the engine.
pub const TENSOR_RANK: usize = 4;

/// A rank-4 tensor shape.
pub type TensorShape = [u32; TENSOR_RANK];

/// Accelerator buffers holding tensors must be sized in multiples of this many bytes.
const BUFFER_SIZE_ALIGNMENT: u64 = 4;

/// Compute the packed (row-major) strides of a shape, in elements.
///
/// # Arguments
///
/// * `shape` - The sizes of each axis.
///
/// # Returns
///
/// The stride of each axis, the last axis being contiguous, or `None` if a stride does not
/// fit in a `u32`.
pub fn get_strides_from_shape<const N: usize>(shape: [u32; N]) -> Option<[u32; N]> {
    let mut strides: [u32; N] = [0; N];
    let mut stride: u64 = 1;
    for i in (0..shape.len()).rev() {
        strides[i] = u32::try_from(stride).ok()?;
        stride = stride.checked_mul(shape[i] as u64)?;
    }
    Some(strides)
}

/// Describes a tensor resident in device memory.
///
/// The shape and element type are fixed once the descriptor is created; the element count,
/// strides and byte sizes are derived from them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TensorDesc {
    /// The element type.
    pub data_type: DataType,
    /// The size of each axis.
    pub sizes: TensorShape,
    /// The packed stride of each axis, in elements.
    pub strides: TensorShape,
}

impl TensorDesc {
    /// Creates a packed descriptor for the given type and shape.
    ///
    /// # Errors
    ///
    /// Returns [`ShapeError::ZeroDimension`] if any axis is zero, and
    /// [`ShapeError::TooLarge`] if the strides or the buffer size overflow.
    pub fn new(data_type: DataType, sizes: TensorShape) -> Result<Self, ShapeError> {
        if let Some(axis) = sizes.iter().position(|&s| s == 0) {
            return Err(ShapeError::ZeroDimension {
                axis,
                shape: sizes.to_vec(),
            });
        }
        let too_large = || ShapeError::TooLarge {
            shape: sizes.to_vec(),
            element_size: data_type.size_in_bytes(),
        };
        let strides = get_strides_from_shape(sizes).ok_or_else(too_large)?;
        checked_buffer_size(data_type, &sizes).ok_or_else(too_large)?;
        Ok(Self {
            data_type,
            sizes,
            strides,
        })
    }

    /// Returns the number of elements in the tensor.
    pub fn element_count(&self) -> u64 {
        self.sizes
            .iter()
            .fold(1u64, |acc, &s| acc.saturating_mul(s as u64))
    }

    /// Returns the number of bytes the tensor data occupies when packed.
    ///
    /// This is the size of the host payload uploaded into, or read back from, the tensor.
    pub fn packed_size_in_bytes(&self) -> u64 {
        self.element_count()
            .saturating_mul(self.data_type.size_in_bytes())
    }

    /// Returns the size of the device buffer backing the tensor.
    ///
    /// The packed size rounded up to the buffer size alignment.
    pub fn total_size_in_bytes(&self) -> u64 {
        checked_buffer_size(self.data_type, &self.sizes).unwrap_or(u64::MAX)
    }

    /// Returns the same descriptor with a different shape.
    ///
    /// # Errors
    ///
    /// Returns an error if the new shape has a zero axis.
    pub fn with_sizes(&self, sizes: TensorShape) -> Result<Self, ShapeError> {
        Self::new(self.data_type, sizes)
    }

    /// Converts a flat element index into per-axis coordinates.
    pub fn coords_of(&self, mut index: u64) -> TensorShape {
        let mut coords = [0u32; TENSOR_RANK];
        for axis in (0..TENSOR_RANK).rev() {
            let size = self.sizes[axis] as u64;
            coords[axis] = (index % size) as u32;
            index /= size;
        }
        coords
    }

    /// Converts per-axis coordinates into a flat element index.
    pub fn index_of(&self, coords: &TensorShape) -> u64 {
        coords
            .iter()
            .zip(self.strides.iter())
            .map(|(&c, &s)| c as u64 * s as u64)
            .sum()
    }
}

fn checked_buffer_size(data_type: DataType, sizes: &TensorShape) -> Option<u64> {
    sizes
        .iter()
        .try_fold(data_type.size_in_bytes(), |acc, &s| acc.checked_mul(s as u64))?
        .checked_next_multiple_of(BUFFER_SIZE_ALIGNMENT)
}

impl std::fmt::Display for TensorDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{:?}", self.data_type, self.sizes)
    }
}

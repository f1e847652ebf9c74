/// Element type of a tensor.
///
/// The tag travels with every tensor descriptor and decides the byte width of an element.
/// Devices report separately which types they can actually compute with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DataType {
    /// IEEE 754 half precision float.
    Float16,
    /// IEEE 754 single precision float.
    #[default]
    Float32,
    /// Signed 32-bit integer.
    Int32,
    /// Unsigned 32-bit integer.
    UInt32,
}

impl DataType {
    /// Returns the size of one element in bytes.
    pub fn size_in_bytes(&self) -> u64 {
        match self {
            DataType::Float16 => 2,
            DataType::Float32 | DataType::Int32 | DataType::UInt32 => 4,
        }
    }

    /// Returns true for floating point types.
    pub fn is_float(&self) -> bool {
        matches!(self, DataType::Float16 | DataType::Float32)
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataType::Float16 => write!(f, "float16"),
            DataType::Float32 => write!(f, "float32"),
            DataType::Int32 => write!(f, "int32"),
            DataType::UInt32 => write!(f, "uint32"),
        }
    }
}

/// A host scalar type with a matching [`DataType`].
///
/// Used by the typed convenience methods that move `&[T]` in and `Vec<T>` out of device
/// memory instead of raw bytes.
pub trait Element: bytemuck::Pod + Send + Sync + 'static {
    /// The data type tag of this scalar.
    const DATA_TYPE: DataType;
}

impl Element for f32 {
    const DATA_TYPE: DataType = DataType::Float32;
}

impl Element for i32 {
    const DATA_TYPE: DataType = DataType::Int32;
}

impl Element for u32 {
    const DATA_TYPE: DataType = DataType::UInt32;
}

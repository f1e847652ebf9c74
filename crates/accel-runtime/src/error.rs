use accel_tensor::{ShapeError, TensorDesc, TensorShape};
use thiserror::Error;

use crate::{device::DeviceError, graph::GraphError};

/// An error type for engine operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// No suitable accelerator could be acquired.
    #[error("Device acquisition failed: {0}")]
    DeviceAcquisition(String),

    /// A payload does not match the established byte size or shape of a tensor.
    #[error("Shape mismatch for tensor '{name}': expected {expected} bytes, got {actual}")]
    ShapeMismatch {
        /// The tensor name.
        name: String,
        /// The byte size of the tensor.
        expected: u64,
        /// The byte size supplied.
        actual: u64,
    },

    /// A read names a shape or element type other than the one the tensor was declared with.
    #[error("Tensor '{name}' is declared as {declared}, not {requested}")]
    DescriptorMismatch {
        /// The tensor name.
        name: String,
        /// The descriptor the tensor was created with.
        declared: TensorDesc,
        /// The descriptor supplied by the caller.
        requested: TensorDesc,
    },

    /// The operands of an add cannot be broadcast together.
    #[error("Incompatible shapes: {lhs:?} and {rhs:?}")]
    IncompatibleShapes {
        /// The target shape.
        lhs: TensorShape,
        /// The shape that could not be broadcast into it.
        rhs: TensorShape,
    },

    /// No tensor is registered under the name.
    #[error("Tensor '{0}' not found")]
    NotFound(String),

    /// A shape is not valid for a device tensor.
    #[error(transparent)]
    InvalidShape(#[from] ShapeError),

    /// An operator graph could not be built.
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// The accelerator reported a failure.
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// A configuration value could not be parsed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A previous device error left the engine unusable.
    #[error("Engine is unusable after a device error; create a new one")]
    Poisoned,
}

impl EngineError {
    /// Returns true for errors after which the engine must be rebuilt.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::DeviceAcquisition(_) | EngineError::Device(_) | EngineError::Poisoned
        )
    }
}

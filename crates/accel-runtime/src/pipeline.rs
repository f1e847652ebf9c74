use accel_tensor::{broadcast, ShapeError, TensorDesc, TensorShape};
use log::debug;

use crate::{
    device::{BindingProperties, ComputeDevice, DeviceError, DispatchableHandle, ExecutionFlags},
    error::EngineError,
    graph::{GraphError, OperatorGraph},
};

/// Resources a compiled operator needs across initialization and execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceRequirements {
    /// Descriptors needed by the larger of the two binding tables.
    pub descriptor_count: u32,
    /// Scratch bytes needed by either phase.
    pub temporary_size: u64,
    /// Bytes written by the initializer and read by the operator.
    pub persistent_size: u64,
}

impl ResourceRequirements {
    /// Merges the binding properties of an initializer and its operator.
    pub fn merge(initializer: &BindingProperties, operator: &BindingProperties) -> Self {
        Self {
            descriptor_count: initializer
                .required_descriptor_count
                .max(operator.required_descriptor_count),
            temporary_size: initializer
                .temporary_resource_size
                .max(operator.temporary_resource_size),
            persistent_size: operator.persistent_resource_size,
        }
    }
}

/// A compiled broadcast add together with its initializer.
///
/// Must be released with [`CompiledAdd::release`] once dispatched.
#[derive(Debug)]
pub struct CompiledAdd {
    operator: DispatchableHandle,
    initializer: DispatchableHandle,
    output: TensorDesc,
    requirements: ResourceRequirements,
}

impl CompiledAdd {
    /// Returns the compiled operator.
    pub fn operator(&self) -> DispatchableHandle {
        self.operator
    }

    /// Returns the operator initializer.
    pub fn initializer(&self) -> DispatchableHandle {
        self.initializer
    }

    /// Returns the descriptor of the result.
    pub fn output(&self) -> &TensorDesc {
        &self.output
    }

    /// Returns the merged resource requirements.
    pub fn requirements(&self) -> &ResourceRequirements {
        &self.requirements
    }

    /// Releases the operator and its initializer.
    pub fn release(self, device: &mut dyn ComputeDevice) {
        device.release_dispatchable(self.initializer);
        device.release_dispatchable(self.operator);
    }
}

/// Builds the graph computing `lhs + broadcast(rhs)`.
///
/// `rhs` is tiled up to the shape of `lhs` when the shapes differ.
pub fn add_graph(lhs: &TensorDesc, rhs: &TensorDesc) -> Result<OperatorGraph, EngineError> {
    if !broadcast::can_broadcast(&lhs.sizes, &rhs.sizes) {
        return Err(EngineError::IncompatibleShapes {
            lhs: lhs.sizes,
            rhs: rhs.sizes,
        });
    }

    let mut graph = OperatorGraph::new();
    let a = graph.input(0, *lhs)?;
    let mut b = graph.input(1, *rhs)?;

    if lhs.sizes != rhs.sizes {
        let plan = broadcast::reconcile(&rhs.sizes, &lhs.sizes)?;
        if plan.reshaped {
            b = graph.reinterpret(b, to_shape(&plan.padded)?)?;
        }
        if !plan.is_identity() {
            b = graph.tile(b, to_shape(&plan.repeats)?)?;
        }
        debug!(
            "broadcasting {:?} into {:?} with repeats {:?}",
            rhs.sizes, lhs.sizes, plan.repeats
        );
    }

    let sum = graph.add(a, b)?;
    graph.mark_output(sum)?;
    Ok(graph)
}

fn to_shape(v: &[u32]) -> Result<TensorShape, ShapeError> {
    v.try_into().map_err(|_| ShapeError::RankMismatch {
        source_rank: v.len(),
        target_rank: accel_tensor::TENSOR_RANK,
    })
}

fn requirements_of(
    device: &dyn ComputeDevice,
    initializer: DispatchableHandle,
    operator: DispatchableHandle,
) -> Result<ResourceRequirements, DeviceError> {
    Ok(ResourceRequirements::merge(
        &device.binding_properties(initializer)?,
        &device.binding_properties(operator)?,
    ))
}

/// Compile the broadcast add of two tensors.
///
/// The shapes are checked before any device work. The operator is compiled, its
/// initializer created and the binding properties of both merged.
///
/// # Errors
///
/// Returns [`EngineError::IncompatibleShapes`] if `rhs` cannot be broadcast into `lhs`,
/// [`EngineError::Graph`] if the element types differ or the device cannot compute them,
/// and [`EngineError::Device`] if compilation fails.
pub fn build_add(
    device: &mut dyn ComputeDevice,
    lhs: &TensorDesc,
    rhs: &TensorDesc,
    flags: ExecutionFlags,
) -> Result<CompiledAdd, EngineError> {
    let graph = add_graph(lhs, rhs)?;
    if !device.supports_data_type(lhs.data_type) {
        return Err(GraphError::Unsupported(format!(
            "{} does not support {} operators",
            device.kind(),
            lhs.data_type
        ))
        .into());
    }

    let operator = device.compile_operator(&graph, flags)?;
    let initializer = match device.create_initializer(&[operator]) {
        Ok(initializer) => initializer,
        Err(e) => {
            device.release_dispatchable(operator);
            return Err(e.into());
        }
    };

    let requirements = match requirements_of(device, initializer, operator) {
        Ok(requirements) => requirements,
        Err(e) => {
            device.release_dispatchable(initializer);
            device.release_dispatchable(operator);
            return Err(e.into());
        }
    };
    debug!("compiled add {} with {:?}", lhs, requirements);

    Ok(CompiledAdd {
        operator,
        initializer,
        output: *lhs,
        requirements,
    })
}

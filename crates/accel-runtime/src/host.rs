//! Host reference device.
//!
//! [`HostDevice`] executes command lists in host memory. It enforces the same contracts a
//! hardware driver does (resource states, descriptor budgets, bindings, initialization
//! before execution, monotonic fences), so the engine behaves identically on it and on an
//! accelerator, and protocol mistakes surface as [`DeviceError`]s instead of corrupt data.

use std::collections::HashMap;

use accel_tensor::{DataType, TensorDesc};
use log::trace;

use crate::{
    adapter::{AdapterAttributes, AdapterInfo, DeviceProvider, FeatureLevel},
    device::{
        BindingProperties, BindingSet, BufferBinding, BufferHandle, Command, ComputeDevice,
        DescriptorHeapHandle, DeviceError, DeviceKind, DispatchableHandle, ExecutionFlags,
        HeapKind, ResourceState,
    },
    graph::{GraphError, Node, NodeId, OperatorGraph},
};

/// Provides the single host reference adapter.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostProvider;

impl DeviceProvider for HostProvider {
    fn enumerate_adapters(&self) -> Result<Vec<AdapterInfo>, DeviceError> {
        Ok(vec![HostDevice::adapter_info()])
    }

    fn create_device(
        &self,
        index: usize,
        _level: FeatureLevel,
        debug: bool,
    ) -> Result<Box<dyn ComputeDevice>, DeviceError> {
        if index != 0 {
            return Err(DeviceError::InvalidHandle(index as u64));
        }
        Ok(Box::new(HostDevice::new(debug)))
    }
}

struct HostBuffer {
    heap: HeapKind,
    data: Vec<u8>,
    state: ResourceState,
}

struct HostOperator {
    graph: OperatorGraph,
    inputs: Vec<TensorDesc>,
    output: TensorDesc,
    properties: BindingProperties,
    // tile repeats, written to the persistent resource by the initializer
    broadcast_table: Vec<u8>,
}

enum HostDispatchable {
    Operator(HostOperator),
    Initializer {
        operators: Vec<DispatchableHandle>,
        properties: BindingProperties,
    },
}

/// A compute device backed by host memory.
pub struct HostDevice {
    adapter: AdapterInfo,
    debug: bool,
    next_handle: u64,
    buffers: HashMap<u64, HostBuffer>,
    heaps: HashMap<u64, u32>,
    dispatchables: HashMap<u64, HostDispatchable>,
    signaled: u64,
    completed: u64,
}

impl HostDevice {
    /// Creates a host device. With `debug`, every executed command is traced.
    pub fn new(debug: bool) -> Self {
        Self {
            adapter: Self::adapter_info(),
            debug,
            next_handle: 1,
            buffers: HashMap::new(),
            heaps: HashMap::new(),
            dispatchables: HashMap::new(),
            signaled: 0,
            completed: 0,
        }
    }

    /// The adapter description reported by the host device.
    pub fn adapter_info() -> AdapterInfo {
        AdapterInfo {
            description: "Host Reference Device".to_string(),
            attributes: AdapterAttributes {
                core_compute: true,
                generic_ml: true,
            },
            hardware: false,
            high_performance: false,
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_handle;
        self.next_handle += 1;
        id
    }

    fn buffer(&self, handle: BufferHandle) -> Result<&HostBuffer, DeviceError> {
        self.buffers
            .get(&handle.0)
            .ok_or(DeviceError::InvalidHandle(handle.0))
    }

    fn buffer_mut(&mut self, handle: BufferHandle) -> Result<&mut HostBuffer, DeviceError> {
        self.buffers
            .get_mut(&handle.0)
            .ok_or(DeviceError::InvalidHandle(handle.0))
    }

    fn binding_bytes(&self, binding: &BufferBinding) -> Result<&[u8], DeviceError> {
        let buffer = self.buffer(binding.buffer)?;
        let end = binding.offset + binding.size;
        if end > buffer.data.len() as u64 {
            return Err(DeviceError::InvalidBinding(format!(
                "range {}..{} exceeds buffer {} of {} bytes",
                binding.offset,
                end,
                binding.buffer.0,
                buffer.data.len()
            )));
        }
        Ok(&buffer.data[binding.offset as usize..end as usize])
    }

    fn write_binding(&mut self, binding: &BufferBinding, bytes: &[u8]) -> Result<(), DeviceError> {
        let buffer = self.buffer_mut(binding.buffer)?;
        let start = binding.offset as usize;
        let end = start + bytes.len();
        if bytes.len() as u64 > binding.size || end > buffer.data.len() {
            return Err(DeviceError::InvalidBinding(format!(
                "{} bytes do not fit binding of {} bytes",
                bytes.len(),
                binding.size
            )));
        }
        buffer.data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn check_compute_state(
        &self,
        binding: &BufferBinding,
        allowed: &[ResourceState],
        slot: &str,
    ) -> Result<(), DeviceError> {
        let buffer = self.buffer(binding.buffer)?;
        if buffer.heap != HeapKind::Default {
            return Err(DeviceError::InvalidBinding(format!(
                "{slot} buffer {} is not on the default heap",
                binding.buffer.0
            )));
        }
        if !allowed.contains(&buffer.state) {
            return Err(DeviceError::InvalidState(format!(
                "{slot} buffer {} is in state {:?}",
                binding.buffer.0, buffer.state
            )));
        }
        Ok(())
    }

    fn copy(&mut self, dst: BufferHandle, src: BufferHandle, size: u64) -> Result<(), DeviceError> {
        let source = self.buffer(src)?;
        let readable = match source.state {
            ResourceState::CopySource | ResourceState::Common => true,
            ResourceState::GenericRead => source.heap == HeapKind::Upload,
            _ => false,
        };
        if !readable {
            return Err(DeviceError::InvalidState(format!(
                "copy source {} is in state {:?}",
                src.0, source.state
            )));
        }
        if size > source.data.len() as u64 {
            return Err(DeviceError::InvalidState(format!(
                "copy of {size} bytes overruns source {}",
                src.0
            )));
        }
        let bytes = source.data[..size as usize].to_vec();

        let target = self.buffer_mut(dst)?;
        if !matches!(target.state, ResourceState::CopyDest | ResourceState::Common) {
            return Err(DeviceError::InvalidState(format!(
                "copy destination {} is in state {:?}",
                dst.0, target.state
            )));
        }
        if size > target.data.len() as u64 {
            return Err(DeviceError::InvalidState(format!(
                "copy of {size} bytes overruns destination {}",
                dst.0
            )));
        }
        target.data[..size as usize].copy_from_slice(&bytes);
        Ok(())
    }

    fn transition(
        &mut self,
        handle: BufferHandle,
        before: ResourceState,
        after: ResourceState,
    ) -> Result<(), DeviceError> {
        let buffer = self.buffer_mut(handle)?;
        if buffer.heap != HeapKind::Default {
            return Err(DeviceError::InvalidState(format!(
                "buffer {} on the {:?} heap cannot change state",
                handle.0, buffer.heap
            )));
        }
        if buffer.state != before {
            return Err(DeviceError::InvalidState(format!(
                "transition of buffer {} expects {:?} but it is in {:?}",
                handle.0, before, buffer.state
            )));
        }
        buffer.state = after;
        Ok(())
    }

    fn dispatch(
        &mut self,
        handle: DispatchableHandle,
        bindings: &BindingSet,
        heap: Option<u32>,
    ) -> Result<(), DeviceError> {
        let properties = self.binding_properties(handle)?;
        let Some(heap_size) = heap else {
            return Err(DeviceError::InvalidState(
                "dispatch recorded without a descriptor heap".into(),
            ));
        };
        if heap_size < properties.required_descriptor_count {
            return Err(DeviceError::InvalidBinding(format!(
                "descriptor heap holds {heap_size} descriptors, {} required",
                properties.required_descriptor_count
            )));
        }

        match self.dispatchables.get(&handle.0) {
            Some(HostDispatchable::Initializer { operators, .. }) => {
                let operators = operators.clone();
                self.run_initializer(&operators, bindings)
            }
            Some(HostDispatchable::Operator(_)) => self.run_operator(handle, bindings),
            None => Err(DeviceError::InvalidHandle(handle.0)),
        }
    }

    fn run_initializer(
        &mut self,
        operators: &[DispatchableHandle],
        bindings: &BindingSet,
    ) -> Result<(), DeviceError> {
        for (i, op) in operators.iter().enumerate() {
            let table = match self.dispatchables.get(&op.0) {
                Some(HostDispatchable::Operator(operator)) => operator.broadcast_table.clone(),
                _ => return Err(DeviceError::InvalidHandle(op.0)),
            };
            if table.is_empty() {
                continue;
            }
            let Some(Some(binding)) = bindings.outputs.get(i) else {
                return Err(DeviceError::InvalidBinding(format!(
                    "initializer output {i} (persistent resource) is not bound"
                )));
            };
            self.check_compute_state(
                binding,
                &[ResourceState::Common, ResourceState::UnorderedAccess],
                "persistent",
            )?;
            self.write_binding(binding, &table)?;
        }
        Ok(())
    }

    fn run_operator(
        &mut self,
        handle: DispatchableHandle,
        bindings: &BindingSet,
    ) -> Result<(), DeviceError> {
        let Some(HostDispatchable::Operator(operator)) = self.dispatchables.get(&handle.0) else {
            return Err(DeviceError::InvalidHandle(handle.0));
        };
        let properties = operator.properties;
        let table = operator.broadcast_table.clone();
        let input_descs = operator.inputs.clone();
        let output_desc = operator.output;
        let graph = operator.graph.clone();

        if properties.persistent_resource_size > 0 {
            let binding = bindings.persistent.ok_or_else(|| {
                DeviceError::InvalidBinding("persistent resource is not bound".into())
            })?;
            if self.binding_bytes(&binding)?.get(..table.len()) != Some(table.as_slice()) {
                return Err(DeviceError::InvalidState(
                    "operator has not been initialized".into(),
                ));
            }
        }
        let temporary = if properties.temporary_resource_size > 0 {
            let binding = bindings.temporary.ok_or_else(|| {
                DeviceError::InvalidBinding("temporary resource is not bound".into())
            })?;
            if binding.size < properties.temporary_resource_size {
                return Err(DeviceError::InvalidBinding(format!(
                    "temporary binding of {} bytes, {} required",
                    binding.size, properties.temporary_resource_size
                )));
            }
            Some(binding)
        } else {
            None
        };

        if bindings.inputs.len() != input_descs.len() {
            return Err(DeviceError::InvalidBinding(format!(
                "{} inputs bound, operator has {}",
                bindings.inputs.len(),
                input_descs.len()
            )));
        }
        let mut inputs = Vec::with_capacity(input_descs.len());
        for (i, (binding, desc)) in bindings.inputs.iter().zip(input_descs.iter()).enumerate() {
            let binding = binding.ok_or_else(|| {
                DeviceError::InvalidBinding(format!("input {i} is not bound"))
            })?;
            self.check_compute_state(&binding, &[ResourceState::UnorderedAccess], "input")?;
            let bytes = self.binding_bytes(&binding)?;
            inputs.push(HostValues::decode(desc, bytes)?);
        }

        let [Some(output)] = bindings.outputs[..] else {
            return Err(DeviceError::InvalidBinding(
                "operator expects exactly one bound output".into(),
            ));
        };
        self.check_compute_state(&output, &[ResourceState::UnorderedAccess], "output")?;
        if output.size < output_desc.packed_size_in_bytes() {
            return Err(DeviceError::InvalidBinding(format!(
                "output binding of {} bytes, {} required",
                output.size,
                output_desc.packed_size_in_bytes()
            )));
        }

        let (result, scratch) = evaluate(&graph, inputs)?;
        if let Some(binding) = temporary {
            self.write_binding(&binding, &scratch)?;
        }
        self.write_binding(&output, result.as_bytes())
    }
}

impl ComputeDevice for HostDevice {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Host
    }

    fn adapter(&self) -> &AdapterInfo {
        &self.adapter
    }

    fn supports_data_type(&self, data_type: DataType) -> bool {
        !matches!(data_type, DataType::Float16)
    }

    fn create_buffer(
        &mut self,
        heap: HeapKind,
        size: u64,
        initial_state: ResourceState,
    ) -> Result<BufferHandle, DeviceError> {
        let required = match heap {
            HeapKind::Default => None,
            HeapKind::Upload => Some(ResourceState::GenericRead),
            HeapKind::Readback => Some(ResourceState::CopyDest),
        };
        if required.is_some_and(|state| state != initial_state) {
            return Err(DeviceError::InvalidState(format!(
                "{heap:?} heap buffers must start in {required:?}"
            )));
        }
        if size == 0 {
            return Err(DeviceError::InvalidState("zero sized buffer".into()));
        }
        let len = usize::try_from(size).map_err(|_| DeviceError::OutOfMemory(size))?;
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| DeviceError::OutOfMemory(size))?;
        data.resize(len, 0);

        let id = self.next_id();
        self.buffers.insert(
            id,
            HostBuffer {
                heap,
                data,
                state: initial_state,
            },
        );
        Ok(BufferHandle(id))
    }

    fn release_buffer(&mut self, buffer: BufferHandle) {
        self.buffers.remove(&buffer.0);
    }

    fn buffer_size(&self, buffer: BufferHandle) -> Result<u64, DeviceError> {
        Ok(self.buffer(buffer)?.data.len() as u64)
    }

    fn write_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<(), DeviceError> {
        let target = self.buffer_mut(buffer)?;
        if target.heap != HeapKind::Upload {
            return Err(DeviceError::InvalidState(format!(
                "buffer {} is not host writable",
                buffer.0
            )));
        }
        let start = offset as usize;
        let end = start + data.len();
        if end > target.data.len() {
            return Err(DeviceError::InvalidState(format!(
                "write of {} bytes at {offset} overruns buffer {}",
                data.len(),
                buffer.0
            )));
        }
        target.data[start..end].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: u64,
        out: &mut [u8],
    ) -> Result<(), DeviceError> {
        let source = self.buffer(buffer)?;
        if source.heap != HeapKind::Readback {
            return Err(DeviceError::InvalidState(format!(
                "buffer {} is not host readable",
                buffer.0
            )));
        }
        let start = offset as usize;
        let end = start + out.len();
        if end > source.data.len() {
            return Err(DeviceError::InvalidState(format!(
                "read of {} bytes at {offset} overruns buffer {}",
                out.len(),
                buffer.0
            )));
        }
        out.copy_from_slice(&source.data[start..end]);
        Ok(())
    }

    fn create_descriptor_heap(
        &mut self,
        count: u32,
    ) -> Result<DescriptorHeapHandle, DeviceError> {
        let id = self.next_id();
        self.heaps.insert(id, count);
        Ok(DescriptorHeapHandle(id))
    }

    fn release_descriptor_heap(&mut self, heap: DescriptorHeapHandle) {
        self.heaps.remove(&heap.0);
    }

    fn compile_operator(
        &mut self,
        graph: &OperatorGraph,
        flags: ExecutionFlags,
    ) -> Result<DispatchableHandle, DeviceError> {
        let compile_err = |e: GraphError| DeviceError::Compilation(e.to_string());
        let inputs = graph.input_descs().map_err(compile_err)?;
        let outputs = graph.output_descs().map_err(compile_err)?;
        let [output] = outputs[..] else {
            return Err(DeviceError::Compilation(format!(
                "expected a single output, got {}",
                outputs.len()
            )));
        };
        for node in graph.nodes() {
            if let Node::Input { desc, .. } = node {
                if !self.supports_data_type(desc.data_type) {
                    return Err(DeviceError::Unsupported(format!(
                        "{} tensors",
                        desc.data_type
                    )));
                }
            }
        }

        let mut broadcast_table = Vec::new();
        let mut temporary_resource_size = 0;
        for (i, node) in graph.nodes().iter().enumerate() {
            if let Node::Tile { repeats, .. } = node {
                broadcast_table.extend_from_slice(bytemuck::cast_slice(repeats));
                let tiled = graph.desc(NodeId(i)).map_err(compile_err)?;
                temporary_resource_size += tiled.total_size_in_bytes();
            }
        }
        let persistent_resource_size = broadcast_table.len() as u64;
        let required_descriptor_count = inputs.len() as u32
            + 1
            + u32::from(temporary_resource_size > 0)
            + u32::from(persistent_resource_size > 0);

        trace!(
            "compiled operator with {} nodes, half precision allowed: {}",
            graph.nodes().len(),
            flags.allow_half_precision
        );

        let id = self.next_id();
        self.dispatchables.insert(
            id,
            HostDispatchable::Operator(HostOperator {
                graph: graph.clone(),
                inputs,
                output,
                properties: BindingProperties {
                    required_descriptor_count,
                    temporary_resource_size,
                    persistent_resource_size,
                },
                broadcast_table,
            }),
        );
        Ok(DispatchableHandle(id))
    }

    fn create_initializer(
        &mut self,
        operators: &[DispatchableHandle],
    ) -> Result<DispatchableHandle, DeviceError> {
        let mut persistent_outputs = 0;
        for op in operators {
            match self.dispatchables.get(&op.0) {
                Some(HostDispatchable::Operator(operator)) => {
                    if operator.properties.persistent_resource_size > 0 {
                        persistent_outputs += 1;
                    }
                }
                _ => return Err(DeviceError::InvalidHandle(op.0)),
            }
        }
        let id = self.next_id();
        self.dispatchables.insert(
            id,
            HostDispatchable::Initializer {
                operators: operators.to_vec(),
                properties: BindingProperties {
                    required_descriptor_count: persistent_outputs.max(1),
                    temporary_resource_size: 0,
                    persistent_resource_size: 0,
                },
            },
        );
        Ok(DispatchableHandle(id))
    }

    fn binding_properties(
        &self,
        dispatchable: DispatchableHandle,
    ) -> Result<BindingProperties, DeviceError> {
        match self.dispatchables.get(&dispatchable.0) {
            Some(HostDispatchable::Operator(operator)) => Ok(operator.properties),
            Some(HostDispatchable::Initializer { properties, .. }) => Ok(*properties),
            None => Err(DeviceError::InvalidHandle(dispatchable.0)),
        }
    }

    fn release_dispatchable(&mut self, dispatchable: DispatchableHandle) {
        self.dispatchables.remove(&dispatchable.0);
    }

    fn execute(&mut self, commands: &[Command]) -> Result<(), DeviceError> {
        let mut heap = None;
        for command in commands {
            if self.debug {
                trace!("execute {command:?}");
            }
            match command {
                Command::CopyBuffer { dst, src, size } => self.copy(*dst, *src, *size)?,
                Command::Transition {
                    buffer,
                    before,
                    after,
                } => self.transition(*buffer, *before, *after)?,
                Command::SetDescriptorHeap(handle) => {
                    let count = self
                        .heaps
                        .get(&handle.0)
                        .ok_or(DeviceError::InvalidHandle(handle.0))?;
                    heap = Some(*count);
                }
                Command::Dispatch {
                    dispatchable,
                    bindings,
                } => self.dispatch(*dispatchable, bindings, heap)?,
            }
        }
        Ok(())
    }

    fn signal(&mut self, value: u64) -> Result<(), DeviceError> {
        if value <= self.signaled {
            return Err(DeviceError::InvalidState(format!(
                "fence value {value} does not increase past {}",
                self.signaled
            )));
        }
        self.signaled = value;
        // work is complete as soon as `execute` returns
        self.completed = value;
        Ok(())
    }

    fn wait(&mut self, value: u64) -> Result<(), DeviceError> {
        if value > self.completed {
            return Err(DeviceError::Lost(format!(
                "fence value {value} was never signaled"
            )));
        }
        Ok(())
    }

    fn completed_value(&self) -> u64 {
        self.completed
    }

    fn allocated_bytes(&self) -> u64 {
        self.buffers.values().map(|b| b.data.len() as u64).sum()
    }
}

enum HostValues {
    F32(Vec<f32>),
    I32(Vec<i32>),
    U32(Vec<u32>),
}

impl HostValues {
    fn decode(desc: &TensorDesc, bytes: &[u8]) -> Result<Self, DeviceError> {
        let len = desc.packed_size_in_bytes() as usize;
        let bytes = bytes.get(..len).ok_or_else(|| {
            DeviceError::InvalidBinding(format!(
                "binding of {} bytes, tensor {desc} needs {len}",
                bytes.len()
            ))
        })?;
        Ok(match desc.data_type {
            DataType::Float32 => HostValues::F32(bytemuck::pod_collect_to_vec(bytes)),
            DataType::Int32 => HostValues::I32(bytemuck::pod_collect_to_vec(bytes)),
            DataType::UInt32 => HostValues::U32(bytemuck::pod_collect_to_vec(bytes)),
            DataType::Float16 => {
                return Err(DeviceError::Unsupported("float16 tensors".into()));
            }
        })
    }

    fn as_bytes(&self) -> &[u8] {
        match self {
            HostValues::F32(v) => bytemuck::cast_slice(v),
            HostValues::I32(v) => bytemuck::cast_slice(v),
            HostValues::U32(v) => bytemuck::cast_slice(v),
        }
    }

    fn tile(&self, src: &TensorDesc, dst: &TensorDesc) -> Self {
        match self {
            HostValues::F32(v) => HostValues::F32(tile(v, src, dst)),
            HostValues::I32(v) => HostValues::I32(tile(v, src, dst)),
            HostValues::U32(v) => HostValues::U32(tile(v, src, dst)),
        }
    }

    fn add(&self, other: &Self) -> Result<Self, DeviceError> {
        Ok(match (self, other) {
            (HostValues::F32(a), HostValues::F32(b)) => {
                HostValues::F32(a.iter().zip(b).map(|(x, y)| x + y).collect())
            }
            (HostValues::I32(a), HostValues::I32(b)) => {
                HostValues::I32(a.iter().zip(b).map(|(x, y)| x.wrapping_add(*y)).collect())
            }
            (HostValues::U32(a), HostValues::U32(b)) => {
                HostValues::U32(a.iter().zip(b).map(|(x, y)| x.wrapping_add(*y)).collect())
            }
            _ => {
                return Err(DeviceError::InvalidState(
                    "add operands have different types".into(),
                ))
            }
        })
    }

    fn duplicate(&self) -> Self {
        match self {
            HostValues::F32(v) => HostValues::F32(v.clone()),
            HostValues::I32(v) => HostValues::I32(v.clone()),
            HostValues::U32(v) => HostValues::U32(v.clone()),
        }
    }
}

fn tile<T: Copy>(src: &[T], src_desc: &TensorDesc, dst_desc: &TensorDesc) -> Vec<T> {
    (0..dst_desc.element_count())
        .map(|i| {
            let mut coords = dst_desc.coords_of(i);
            for (c, s) in coords.iter_mut().zip(src_desc.sizes.iter()) {
                *c %= s;
            }
            src[src_desc.index_of(&coords) as usize]
        })
        .collect()
}

fn take(values: &[Option<HostValues>], id: NodeId) -> Result<&HostValues, DeviceError> {
    values
        .get(id.0)
        .and_then(Option::as_ref)
        .ok_or_else(|| DeviceError::Compilation(format!("node {} has no value", id.0)))
}

/// Evaluates the graph output, returning it with the materialized tiled operands.
fn evaluate(
    graph: &OperatorGraph,
    mut inputs: Vec<HostValues>,
) -> Result<(HostValues, Vec<u8>), DeviceError> {
    let compile_err = |e: GraphError| DeviceError::Compilation(e.to_string());
    let mut values: Vec<Option<HostValues>> = Vec::with_capacity(graph.nodes().len());
    let mut scratch = Vec::new();

    for (i, node) in graph.nodes().iter().enumerate() {
        let value = match node {
            Node::Input { index, .. } => {
                let slot = inputs.get_mut(*index as usize).ok_or_else(|| {
                    DeviceError::InvalidBinding(format!("input {index} is not bound"))
                })?;
                std::mem::replace(slot, HostValues::U32(Vec::new()))
            }
            Node::Reinterpret { input, .. } => take(&values, *input)?.duplicate(),
            Node::Tile { input, .. } => {
                let src = graph.desc(*input).map_err(compile_err)?;
                let dst = graph.desc(NodeId(i)).map_err(compile_err)?;
                let tiled = take(&values, *input)?.tile(src, dst);
                scratch.extend_from_slice(tiled.as_bytes());
                scratch.resize(scratch.len().next_multiple_of(4), 0);
                tiled
            }
            Node::Add { lhs, rhs } => take(&values, *lhs)?.add(take(&values, *rhs)?)?,
        };
        values.push(Some(value));
    }

    let [output] = graph.outputs()[..] else {
        return Err(DeviceError::Compilation("expected a single output".into()));
    };
    let result = values
        .get_mut(output.0)
        .and_then(Option::take)
        .ok_or(DeviceError::Compilation("output was not evaluated".into()))?;
    Ok((result, scratch))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_desc(sizes: [u32; 4]) -> TensorDesc {
        TensorDesc::new(DataType::Float32, sizes).unwrap()
    }

    fn upload(device: &mut HostDevice, values: &[f32]) -> Result<BufferHandle, DeviceError> {
        let bytes: &[u8] = bytemuck::cast_slice(values);
        let size = bytes.len() as u64;
        let staging = device.create_buffer(HeapKind::Upload, size, ResourceState::GenericRead)?;
        let buffer = device.create_buffer(HeapKind::Default, size, ResourceState::CopyDest)?;
        device.write_buffer(staging, 0, bytes)?;
        device.execute(&[
            Command::CopyBuffer {
                dst: buffer,
                src: staging,
                size,
            },
            Command::Transition {
                buffer,
                before: ResourceState::CopyDest,
                after: ResourceState::UnorderedAccess,
            },
        ])?;
        device.release_buffer(staging);
        Ok(buffer)
    }

    fn download(
        device: &mut HostDevice,
        buffer: BufferHandle,
        n: usize,
    ) -> Result<Vec<f32>, DeviceError> {
        let size = (n * 4) as u64;
        let readback = device.create_buffer(HeapKind::Readback, size, ResourceState::CopyDest)?;
        device.execute(&[
            Command::Transition {
                buffer,
                before: ResourceState::UnorderedAccess,
                after: ResourceState::CopySource,
            },
            Command::CopyBuffer {
                dst: readback,
                src: buffer,
                size,
            },
            Command::Transition {
                buffer,
                before: ResourceState::CopySource,
                after: ResourceState::UnorderedAccess,
            },
        ])?;
        let mut out = vec![0u8; size as usize];
        device.read_buffer(readback, 0, &mut out)?;
        device.release_buffer(readback);
        Ok(bytemuck::pod_collect_to_vec(&out))
    }

    #[test]
    fn test_upload_download() -> Result<(), DeviceError> {
        let mut device = HostDevice::new(false);
        let buffer = upload(&mut device, &[1.0, 2.0, 3.0])?;
        assert_eq!(download(&mut device, buffer, 3)?, vec![1.0, 2.0, 3.0]);
        device.release_buffer(buffer);
        assert_eq!(device.allocated_bytes(), 0);
        Ok(())
    }

    #[test]
    fn test_heap_rules() {
        let mut device = HostDevice::new(false);
        assert!(device
            .create_buffer(HeapKind::Upload, 4, ResourceState::CopyDest)
            .is_err());
        assert!(device
            .create_buffer(HeapKind::Default, 0, ResourceState::Common)
            .is_err());
        let default = device
            .create_buffer(HeapKind::Default, 4, ResourceState::CopyDest)
            .unwrap();
        assert!(device.write_buffer(default, 0, &[0; 4]).is_err());
        assert!(device.read_buffer(default, 0, &mut [0; 4]).is_err());
    }

    #[test]
    fn test_transition_must_match_state() -> Result<(), DeviceError> {
        let mut device = HostDevice::new(false);
        let buffer = device.create_buffer(HeapKind::Default, 16, ResourceState::CopyDest)?;
        let res = device.execute(&[Command::Transition {
            buffer,
            before: ResourceState::UnorderedAccess,
            after: ResourceState::CopySource,
        }]);
        assert!(matches!(res, Err(DeviceError::InvalidState(_))));
        Ok(())
    }

    #[test]
    fn test_copy_requires_copy_states() -> Result<(), DeviceError> {
        let mut device = HostDevice::new(false);
        let buffer = upload(&mut device, &[1.0])?;
        let readback = device.create_buffer(HeapKind::Readback, 4, ResourceState::CopyDest)?;
        // still in unordered access
        let res = device.execute(&[Command::CopyBuffer {
            dst: readback,
            src: buffer,
            size: 4,
        }]);
        assert!(matches!(res, Err(DeviceError::InvalidState(_))));
        Ok(())
    }

    #[test]
    fn test_fence_must_increase() -> Result<(), DeviceError> {
        let mut device = HostDevice::new(false);
        device.signal(1)?;
        device.wait(1)?;
        assert_eq!(device.completed_value(), 1);
        assert!(device.signal(1).is_err());
        assert!(device.wait(5).is_err());
        device.signal(2)?;
        assert_eq!(device.completed_value(), 2);
        Ok(())
    }

    #[test]
    fn test_compile_rejects_float16() -> Result<(), Box<dyn std::error::Error>> {
        let mut device = HostDevice::new(false);
        let desc = TensorDesc::new(DataType::Float16, [1, 1, 2, 1])?;
        let mut graph = OperatorGraph::new();
        let a = graph.input(0, desc)?;
        let b = graph.input(1, desc)?;
        let out = graph.add(a, b)?;
        graph.mark_output(out)?;
        let res = device.compile_operator(&graph, ExecutionFlags::default());
        assert!(matches!(res, Err(DeviceError::Unsupported(_))));
        Ok(())
    }

    #[test]
    fn test_tiled_operator_requires_initialization() -> Result<(), Box<dyn std::error::Error>> {
        let mut device = HostDevice::new(false);
        let mut graph = OperatorGraph::new();
        let a = graph.input(0, f32_desc([1, 1, 4, 1]))?;
        let b = graph.input(1, f32_desc([1, 1, 1, 1]))?;
        let t = graph.tile(b, [1, 1, 4, 1])?;
        let out = graph.add(a, t)?;
        graph.mark_output(out)?;

        let op = device.compile_operator(&graph, ExecutionFlags::default())?;
        let props = device.binding_properties(op)?;
        assert_eq!(props.persistent_resource_size, 16);
        assert_eq!(props.temporary_resource_size, 16);
        assert_eq!(props.required_descriptor_count, 5);

        let lhs = upload(&mut device, &[1.0, 2.0, 3.0, 4.0])?;
        let rhs = upload(&mut device, &[10.0])?;
        let dst = upload(&mut device, &[0.0; 4])?;
        let temp = device.create_buffer(HeapKind::Default, 16, ResourceState::Common)?;
        let persistent = device.create_buffer(HeapKind::Default, 16, ResourceState::Common)?;
        let heap = device.create_descriptor_heap(props.required_descriptor_count)?;

        let bindings = BindingSet {
            inputs: vec![
                Some(BufferBinding::whole(lhs, 16)),
                Some(BufferBinding::whole(rhs, 4)),
            ],
            outputs: vec![Some(BufferBinding::whole(dst, 16))],
            temporary: Some(BufferBinding::whole(temp, 16)),
            persistent: Some(BufferBinding::whole(persistent, 16)),
        };
        let execute = [
            Command::SetDescriptorHeap(heap),
            Command::Dispatch {
                dispatchable: op,
                bindings,
            },
        ];
        assert!(matches!(
            device.execute(&execute),
            Err(DeviceError::InvalidState(_))
        ));

        let init = device.create_initializer(&[op])?;
        device.execute(&[
            Command::SetDescriptorHeap(heap),
            Command::Dispatch {
                dispatchable: init,
                bindings: BindingSet {
                    outputs: vec![Some(BufferBinding::whole(persistent, 16))],
                    ..Default::default()
                },
            },
        ])?;
        device.execute(&execute)?;
        assert_eq!(download(&mut device, dst, 4)?, vec![11.0, 12.0, 13.0, 14.0]);
        Ok(())
    }

    #[test]
    fn test_dispatch_requires_descriptor_heap() -> Result<(), Box<dyn std::error::Error>> {
        let mut device = HostDevice::new(false);
        let mut graph = OperatorGraph::new();
        let a = graph.input(0, f32_desc([1, 1, 2, 1]))?;
        let b = graph.input(1, f32_desc([1, 1, 2, 1]))?;
        let out = graph.add(a, b)?;
        graph.mark_output(out)?;
        let op = device.compile_operator(&graph, ExecutionFlags::default())?;

        let res = device.execute(&[Command::Dispatch {
            dispatchable: op,
            bindings: BindingSet::default(),
        }]);
        assert!(matches!(res, Err(DeviceError::InvalidState(_))));

        let small = device.create_descriptor_heap(1)?;
        let res = device.execute(&[
            Command::SetDescriptorHeap(small),
            Command::Dispatch {
                dispatchable: op,
                bindings: BindingSet::default(),
            },
        ]);
        assert!(matches!(res, Err(DeviceError::InvalidBinding(_))));
        Ok(())
    }

    #[test]
    fn test_provider() -> Result<(), DeviceError> {
        let provider = HostProvider;
        let adapters = provider.enumerate_adapters()?;
        assert_eq!(adapters.len(), 1);
        assert!(!adapters[0].hardware);
        let device = provider.create_device(0, FeatureLevel::GenericMl1_0, false)?;
        assert_eq!(device.kind(), DeviceKind::Host);
        assert!(provider
            .create_device(1, FeatureLevel::GenericMl1_0, false)
            .is_err());
        Ok(())
    }
}

//! GPU device through wgpu.
//!
//! Default heap buffers are storage buffers, upload and readback buffers are copy staging
//! buffers. A compiled add lowers to a WGSL compute shader in which every operand is read
//! at `coord % sizes`, which covers both identical shapes and tiled broadcasts without
//! materializing the tiled operand.

use std::collections::HashMap;

use accel_tensor::DataType;
use log::{debug, info};
use wgpu::util::DeviceExt;

use crate::{
    adapter::{AdapterAttributes, AdapterInfo, DeviceProvider, FeatureLevel},
    device::{
        BindingProperties, BindingSet, BufferBinding, BufferHandle, Command, ComputeDevice,
        DescriptorHeapHandle, DeviceError, DeviceKind, DispatchableHandle, ExecutionFlags,
        HeapKind, ResourceState,
    },
    graph::OperatorGraph,
};

const WORKGROUP_SIZE: u32 = 64;
const MAX_WORKGROUPS_PER_DIM: u32 = 65535;

const ADD_SHADER: &str = r#"
struct Params {
    out_sizes: vec4<u32>,
    lhs_sizes: vec4<u32>,
    rhs_sizes: vec4<u32>,
    count: vec4<u32>,
};

@group(0) @binding(0) var<storage, read> lhs: array<ELEM>;
@group(0) @binding(1) var<storage, read> rhs: array<ELEM>;
@group(0) @binding(2) var<storage, read_write> dst: array<ELEM>;
@group(0) @binding(3) var<uniform> params: Params;

fn offset_of(coord: vec4<u32>, sizes: vec4<u32>) -> u32 {
    let c = coord % sizes;
    return ((c.x * sizes.y + c.y) * sizes.z + c.z) * sizes.w + c.w;
}

@compute @workgroup_size(64)
fn main(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) groups: vec3<u32>,
) {
    let index = gid.x + gid.y * groups.x * 64u;
    if (index >= params.count.x) {
        return;
    }
    let s = params.out_sizes;
    var rem = index;
    let w = rem % s.w;
    rem = rem / s.w;
    let z = rem % s.z;
    rem = rem / s.z;
    let y = rem % s.y;
    rem = rem / s.y;
    let coord = vec4<u32>(rem, y, z, w);
    dst[index] = lhs[offset_of(coord, params.lhs_sizes)] + rhs[offset_of(coord, params.rhs_sizes)];
}
"#;

fn instance(debug: bool) -> wgpu::Instance {
    wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        flags: if debug {
            wgpu::InstanceFlags::debugging()
        } else {
            wgpu::InstanceFlags::default()
        },
        ..Default::default()
    })
}

fn adapter_info(adapter: &wgpu::Adapter) -> AdapterInfo {
    let info = adapter.get_info();
    AdapterInfo {
        description: format!("{} ({:?})", info.name, info.backend),
        attributes: AdapterAttributes {
            core_compute: true,
            generic_ml: false,
        },
        hardware: !matches!(info.device_type, wgpu::DeviceType::Cpu),
        high_performance: matches!(info.device_type, wgpu::DeviceType::DiscreteGpu),
    }
}

/// Provides the adapters visible to wgpu on every native backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct WgpuProvider;

impl WgpuProvider {
    /// Creates a provider.
    pub fn new() -> Self {
        Self
    }
}

impl DeviceProvider for WgpuProvider {
    fn enumerate_adapters(&self) -> Result<Vec<AdapterInfo>, DeviceError> {
        Ok(instance(false)
            .enumerate_adapters(wgpu::Backends::all())
            .iter()
            .map(adapter_info)
            .collect())
    }

    fn create_device(
        &self,
        index: usize,
        _level: FeatureLevel,
        debug: bool,
    ) -> Result<Box<dyn ComputeDevice>, DeviceError> {
        let adapter = instance(debug)
            .enumerate_adapters(wgpu::Backends::all())
            .into_iter()
            .nth(index)
            .ok_or(DeviceError::InvalidHandle(index as u64))?;
        let device = WgpuDevice::new(adapter, index)?;
        Ok(Box::new(device))
    }
}

struct GpuBuffer {
    buffer: wgpu::Buffer,
    heap: HeapKind,
    size: u64,
    state: ResourceState,
}

struct GpuOperator {
    pipeline: wgpu::ComputePipeline,
    params: wgpu::Buffer,
    // operator input bound to shader bindings 0 and 1
    operand_inputs: [usize; 2],
    element_count: u32,
    properties: BindingProperties,
}

enum GpuDispatchable {
    Operator(GpuOperator),
    Initializer,
}

/// A compute device backed by a wgpu adapter.
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter: AdapterInfo,
    adapter_index: usize,
    shader_f16: bool,
    next_handle: u64,
    buffers: HashMap<u64, GpuBuffer>,
    heaps: HashMap<u64, u32>,
    dispatchables: HashMap<u64, GpuDispatchable>,
    last_submission: Option<wgpu::SubmissionIndex>,
    signaled: Option<(u64, wgpu::SubmissionIndex)>,
    last_signaled: u64,
    completed: u64,
}

impl WgpuDevice {
    /// Opens a device on `adapter`.
    pub fn new(adapter: wgpu::Adapter, adapter_index: usize) -> Result<Self, DeviceError> {
        let info = adapter_info(&adapter);
        let shader_f16 = adapter.features().contains(wgpu::Features::SHADER_F16);
        let required_features = if shader_f16 {
            wgpu::Features::SHADER_F16
        } else {
            wgpu::Features::empty()
        };

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("accel device"),
            required_features,
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            ..Default::default()
        }))
        .map_err(|e| DeviceError::Lost(format!("failed to create device: {e}")))?;
        info!("wgpu device created on {}", info.description);

        Ok(Self {
            device,
            queue,
            adapter: info,
            adapter_index,
            shader_f16,
            next_handle: 1,
            buffers: HashMap::new(),
            heaps: HashMap::new(),
            dispatchables: HashMap::new(),
            last_submission: None,
            signaled: None,
            last_signaled: 0,
            completed: 0,
        })
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_handle;
        self.next_handle += 1;
        id
    }

    fn buffer(&self, handle: BufferHandle) -> Result<&GpuBuffer, DeviceError> {
        self.buffers
            .get(&handle.0)
            .ok_or(DeviceError::InvalidHandle(handle.0))
    }

    fn wait_idle(&self) -> Result<(), DeviceError> {
        self.device
            .poll(wgpu::PollType::Wait {
                submission_index: None,
                timeout: None,
            })
            .map(|_| ())
            .map_err(|e| DeviceError::Lost(e.to_string()))
    }

    fn pop_scope(&self, wrap: fn(String) -> DeviceError) -> Result<(), DeviceError> {
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(e) => Err(wrap(e.to_string())),
            None => Ok(()),
        }
    }

    fn element_type(&self, data_type: DataType) -> Option<&'static str> {
        match data_type {
            DataType::Float32 => Some("f32"),
            DataType::Int32 => Some("i32"),
            DataType::UInt32 => Some("u32"),
            DataType::Float16 if self.shader_f16 => Some("f16"),
            DataType::Float16 => None,
        }
    }

    fn transition(
        &mut self,
        handle: BufferHandle,
        before: ResourceState,
        after: ResourceState,
    ) -> Result<(), DeviceError> {
        let buffer = self
            .buffers
            .get_mut(&handle.0)
            .ok_or(DeviceError::InvalidHandle(handle.0))?;
        if buffer.heap != HeapKind::Default || buffer.state != before {
            return Err(DeviceError::InvalidState(format!(
                "transition of buffer {} expects {:?} but it is in {:?}",
                handle.0, before, buffer.state
            )));
        }
        // wgpu tracks usage itself; the state is kept to validate the command stream
        buffer.state = after;
        Ok(())
    }

    fn storage_binding(
        &self,
        binding: &Option<BufferBinding>,
        slot: &str,
    ) -> Result<wgpu::BindingResource<'_>, DeviceError> {
        let binding =
            binding.ok_or_else(|| DeviceError::InvalidBinding(format!("{slot} is not bound")))?;
        let buffer = self.buffer(binding.buffer)?;
        if buffer.heap != HeapKind::Default || buffer.state != ResourceState::UnorderedAccess {
            return Err(DeviceError::InvalidState(format!(
                "{slot} buffer {} is in state {:?}",
                binding.buffer.0, buffer.state
            )));
        }
        Ok(wgpu::BindingResource::Buffer(wgpu::BufferBinding {
            buffer: &buffer.buffer,
            offset: binding.offset,
            size: wgpu::BufferSize::new(binding.size),
        }))
    }

    fn encode_dispatch(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        handle: DispatchableHandle,
        bindings: &BindingSet,
        heap: Option<u32>,
    ) -> Result<(), DeviceError> {
        let properties = self.binding_properties(handle)?;
        match heap {
            Some(count) if count >= properties.required_descriptor_count => {}
            Some(count) => {
                return Err(DeviceError::InvalidBinding(format!(
                    "descriptor heap holds {count} descriptors, {} required",
                    properties.required_descriptor_count
                )))
            }
            None => {
                return Err(DeviceError::InvalidState(
                    "dispatch recorded without a descriptor heap".into(),
                ))
            }
        }

        let operator = match self.dispatchables.get(&handle.0) {
            Some(GpuDispatchable::Operator(operator)) => operator,
            // operators carry no persistent state to initialize
            Some(GpuDispatchable::Initializer) => return Ok(()),
            None => return Err(DeviceError::InvalidHandle(handle.0)),
        };

        if bindings.inputs.len() != 2 || bindings.outputs.len() != 1 {
            return Err(DeviceError::InvalidBinding(format!(
                "add expects 2 inputs and 1 output, got {} and {}",
                bindings.inputs.len(),
                bindings.outputs.len()
            )));
        }
        let output = bindings.outputs[0];
        let aliased = output.is_some_and(|out| {
            bindings
                .inputs
                .iter()
                .flatten()
                .any(|input| input.buffer == out.buffer)
        });

        // an output aliasing an input is written to scratch and copied back
        let output_resource = self.storage_binding(&output, "output")?;
        let staged = match (aliased, output) {
            (true, Some(out)) => Some((
                self.device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("accel in-place output"),
                    size: out.size.next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT),
                    usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
                    mapped_at_creation: false,
                }),
                out,
            )),
            _ => None,
        };
        let output_resource = match &staged {
            Some((scratch, _)) => scratch.as_entire_binding(),
            None => output_resource,
        };

        let [first, second] = operator.operand_inputs;
        let entries = [
            self.storage_binding(&bindings.inputs[first], "input")?,
            self.storage_binding(&bindings.inputs[second], "input")?,
            output_resource,
            operator.params.as_entire_binding(),
        ];
        let entries: Vec<wgpu::BindGroupEntry> = entries
            .into_iter()
            .enumerate()
            .map(|(i, resource)| wgpu::BindGroupEntry {
                binding: i as u32,
                resource,
            })
            .collect();
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("accel add bindings"),
            layout: &operator.pipeline.get_bind_group_layout(0),
            entries: &entries,
        });

        let groups = operator.element_count.div_ceil(WORKGROUP_SIZE).max(1);
        let x = groups.min(MAX_WORKGROUPS_PER_DIM);
        let y = groups.div_ceil(x);

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("accel add"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&operator.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(x, y, 1);
        drop(pass);

        if let Some((scratch, out)) = &staged {
            let dst = self.buffer(out.buffer)?;
            encoder.copy_buffer_to_buffer(scratch, 0, &dst.buffer, out.offset, out.size);
            debug!("copied in-place result into buffer {}", out.buffer.0);
        }
        Ok(())
    }
}

impl ComputeDevice for WgpuDevice {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Wgpu {
            adapter_index: self.adapter_index,
        }
    }

    fn adapter(&self) -> &AdapterInfo {
        &self.adapter
    }

    fn supports_data_type(&self, data_type: DataType) -> bool {
        self.element_type(data_type).is_some()
    }

    fn create_buffer(
        &mut self,
        heap: HeapKind,
        size: u64,
        initial_state: ResourceState,
    ) -> Result<BufferHandle, DeviceError> {
        let usage = match heap {
            HeapKind::Default => {
                wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_SRC
                    | wgpu::BufferUsages::COPY_DST
            }
            HeapKind::Upload => wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
            HeapKind::Readback => wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        };
        let size = size.next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("accel buffer"),
            size,
            usage,
            mapped_at_creation: false,
        });
        if pollster::block_on(self.device.pop_error_scope()).is_some() {
            return Err(DeviceError::OutOfMemory(size));
        }

        let id = self.next_id();
        self.buffers.insert(
            id,
            GpuBuffer {
                buffer,
                heap,
                size,
                state: initial_state,
            },
        );
        Ok(BufferHandle(id))
    }

    fn release_buffer(&mut self, buffer: BufferHandle) {
        if let Some(b) = self.buffers.remove(&buffer.0) {
            b.buffer.destroy();
        }
    }

    fn buffer_size(&self, buffer: BufferHandle) -> Result<u64, DeviceError> {
        Ok(self.buffer(buffer)?.size)
    }

    fn write_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<(), DeviceError> {
        let target = self.buffer(buffer)?;
        if target.heap != HeapKind::Upload || offset + data.len() as u64 > target.size {
            return Err(DeviceError::InvalidState(format!(
                "buffer {} cannot take {} bytes at {offset}",
                buffer.0,
                data.len()
            )));
        }
        let padded = data.len().next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT as usize);
        if padded == data.len() {
            self.queue.write_buffer(&target.buffer, offset, data);
        } else {
            let mut bytes = data.to_vec();
            bytes.resize(padded, 0);
            self.queue.write_buffer(&target.buffer, offset, &bytes);
        }
        Ok(())
    }

    fn read_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: u64,
        out: &mut [u8],
    ) -> Result<(), DeviceError> {
        let source = self.buffer(buffer)?;
        let end = offset + out.len() as u64;
        if source.heap != HeapKind::Readback || end > source.size {
            return Err(DeviceError::InvalidState(format!(
                "buffer {} cannot provide {} bytes at {offset}",
                buffer.0,
                out.len()
            )));
        }

        let slice = source.buffer.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.wait_idle()?;
        rx.recv()
            .map_err(|e| DeviceError::Lost(e.to_string()))?
            .map_err(|e| DeviceError::Submission(e.to_string()))?;

        {
            let mapped = slice.get_mapped_range();
            out.copy_from_slice(&mapped[offset as usize..end as usize]);
        }
        source.buffer.unmap();
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
        let program = graph
            .lower_elementwise()
            .map_err(|e| DeviceError::Compilation(e.to_string()))?;
        let data_type = program.output.data_type;
        let element = self
            .element_type(data_type)
            .ok_or_else(|| DeviceError::Unsupported(format!("{data_type} tensors")))?;
        let element_count = u32::try_from(program.output.element_count()).map_err(|_| {
            DeviceError::Unsupported(format!("{} elements", program.output.element_count()))
        })?;

        let mut source = ADD_SHADER.replace("ELEM", element);
        if element == "f16" {
            source.insert_str(0, "enable f16;\n");
        }

        let [lhs, rhs] = program.operands;
        let mut params = [0u32; 16];
        params[0..4].copy_from_slice(&program.output.sizes);
        params[4..8].copy_from_slice(&lhs.sizes);
        params[8..12].copy_from_slice(&rhs.sizes);
        params[12] = element_count;

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("accel add shader"),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("accel add pipeline"),
                layout: None,
                module: &module,
                entry_point: Some("main"),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            });
        let params = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("accel add params"),
                contents: bytemuck::cast_slice(&params),
                usage: wgpu::BufferUsages::UNIFORM,
            });
        self.pop_scope(DeviceError::Compilation)?;
        debug!(
            "compiled {} add shader for {} elements, half precision allowed: {}",
            element, element_count, flags.allow_half_precision
        );

        let id = self.next_id();
        self.dispatchables.insert(
            id,
            GpuDispatchable::Operator(GpuOperator {
                pipeline,
                params,
                operand_inputs: [lhs.input_index as usize, rhs.input_index as usize],
                element_count,
                properties: BindingProperties {
                    required_descriptor_count: 3,
                    temporary_resource_size: 0,
                    persistent_resource_size: 0,
                },
            }),
        );
        Ok(DispatchableHandle(id))
    }

    fn create_initializer(
        &mut self,
        operators: &[DispatchableHandle],
    ) -> Result<DispatchableHandle, DeviceError> {
        let unknown = operators.iter().find(|op| {
            !matches!(
                self.dispatchables.get(&op.0),
                Some(GpuDispatchable::Operator(_))
            )
        });
        if let Some(op) = unknown {
            return Err(DeviceError::InvalidHandle(op.0));
        }
        let id = self.next_id();
        self.dispatchables.insert(id, GpuDispatchable::Initializer);
        Ok(DispatchableHandle(id))
    }

    fn binding_properties(
        &self,
        dispatchable: DispatchableHandle,
    ) -> Result<BindingProperties, DeviceError> {
        match self.dispatchables.get(&dispatchable.0) {
            Some(GpuDispatchable::Operator(operator)) => Ok(operator.properties),
            Some(GpuDispatchable::Initializer) => Ok(BindingProperties {
                required_descriptor_count: 1,
                ..Default::default()
            }),
            None => Err(DeviceError::InvalidHandle(dispatchable.0)),
        }
    }

    fn release_dispatchable(&mut self, dispatchable: DispatchableHandle) {
        if let Some(GpuDispatchable::Operator(operator)) =
            self.dispatchables.remove(&dispatchable.0)
        {
            operator.params.destroy();
        }
    }

    fn execute(&mut self, commands: &[Command]) -> Result<(), DeviceError> {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("accel commands"),
            });
        let mut heap = None;

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let mut encoded = Ok(());
        for command in commands {
            encoded = match command {
                Command::CopyBuffer { dst, src, size } => {
                    match (self.buffer(*src), self.buffer(*dst)) {
                        (Ok(s), Ok(d)) => {
                            encoder.copy_buffer_to_buffer(&s.buffer, 0, &d.buffer, 0, *size);
                            Ok(())
                        }
                        (Err(e), _) | (_, Err(e)) => Err(e),
                    }
                }
                Command::Transition {
                    buffer,
                    before,
                    after,
                } => self.transition(*buffer, *before, *after),
                Command::SetDescriptorHeap(handle) => match self.heaps.get(&handle.0) {
                    Some(count) => {
                        heap = Some(*count);
                        Ok(())
                    }
                    None => Err(DeviceError::InvalidHandle(handle.0)),
                },
                Command::Dispatch {
                    dispatchable,
                    bindings,
                } => self.encode_dispatch(&mut encoder, *dispatchable, bindings, heap),
            };
            if encoded.is_err() {
                break;
            }
        }
        let scope = self.pop_scope(DeviceError::Submission);
        encoded?;
        scope?;

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let index = self.queue.submit(Some(encoder.finish()));
        self.pop_scope(DeviceError::Submission)?;
        self.last_submission = Some(index);
        Ok(())
    }

    fn signal(&mut self, value: u64) -> Result<(), DeviceError> {
        if value <= self.last_signaled {
            return Err(DeviceError::InvalidState(format!(
                "fence value {value} does not increase past {}",
                self.last_signaled
            )));
        }
        let index = match self.last_submission.take() {
            Some(index) => index,
            None => self.queue.submit(None),
        };
        self.signaled = Some((value, index));
        self.last_signaled = value;
        Ok(())
    }

    fn wait(&mut self, value: u64) -> Result<(), DeviceError> {
        if value <= self.completed {
            return Ok(());
        }
        match self.signaled.take() {
            Some((signaled, index)) if signaled >= value => {
                self.device
                    .poll(wgpu::PollType::Wait {
                        submission_index: Some(index),
                        timeout: None,
                    })
                    .map_err(|e| DeviceError::Lost(e.to_string()))?;
                self.completed = signaled;
                Ok(())
            }
            _ => Err(DeviceError::Lost(format!(
                "fence value {value} was never signaled"
            ))),
        }
    }

    fn completed_value(&self) -> u64 {
        self.completed
    }

    fn allocated_bytes(&self) -> u64 {
        self.buffers.values().map(|b| b.size).sum()
    }
}

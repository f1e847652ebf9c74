//! Device abstraction for accelerator operations.
//!
//! This module provides the trait-based boundary between the engine and an accelerator
//! driver. The engine records [`Command`]s and hands closed command lists to a
//! [`ComputeDevice`]; everything behind the trait (memory, compilation, queues, fences) is
//! specific to one implementation.

use accel_tensor::DataType;
use thiserror::Error;

use crate::{adapter::AdapterInfo, graph::OperatorGraph};

/// An error reported by an accelerator driver.
///
/// Every variant is fatal for the operation that produced it. The engine does not roll back
/// partially recorded work, so it refuses further calls after seeing one of these.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The device could not allocate the requested memory.
    #[error("Out of device memory allocating {0} bytes")]
    OutOfMemory(u64),

    /// A handle does not name a live object on this device.
    #[error("Invalid device handle {0}")]
    InvalidHandle(u64),

    /// A resource or object is not in the state an operation requires.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A binding table does not satisfy the dispatchable it is used with.
    #[error("Invalid binding: {0}")]
    InvalidBinding(String),

    /// An operator graph could not be compiled.
    #[error("Operator compilation failed: {0}")]
    Compilation(String),

    /// The device does not support the requested feature.
    #[error("Unsupported by device: {0}")]
    Unsupported(String),

    /// A command list failed to execute.
    #[error("Command list submission failed: {0}")]
    Submission(String),

    /// The device stopped responding or was removed.
    #[error("Device lost: {0}")]
    Lost(String),
}

/// Identifies the kind of device behind a [`ComputeDevice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    /// The host reference device.
    Host,
    /// A wgpu adapter with its enumeration index.
    #[cfg(feature = "wgpu")]
    Wgpu {
        /// The adapter index
        adapter_index: usize,
    },
}

impl DeviceKind {
    /// Returns the device type as a string.
    pub fn device_type(&self) -> &str {
        match self {
            DeviceKind::Host => "host",
            #[cfg(feature = "wgpu")]
            DeviceKind::Wgpu { .. } => "wgpu",
        }
    }

    /// Returns true if the device is the host reference device.
    pub fn is_host(&self) -> bool {
        matches!(self, DeviceKind::Host)
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceKind::Host => write!(f, "host"),
            #[cfg(feature = "wgpu")]
            DeviceKind::Wgpu { adapter_index } => write!(f, "wgpu:{}", adapter_index),
        }
    }
}

/// Handle to a device buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u64);

/// Handle to a shader-visible descriptor heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorHeapHandle(pub u64);

/// Handle to a compiled operator or an operator initializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DispatchableHandle(pub u64);

/// The memory heap a buffer is allocated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapKind {
    /// Device local memory, readable and writable by compute work.
    Default,
    /// Host-writable memory used as the source of uploads.
    Upload,
    /// Host-readable memory used as the destination of readbacks.
    Readback,
}

/// Usage state of a buffer, as tracked for transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    /// No particular usage; promotable by the device.
    Common,
    /// Destination of a copy.
    CopyDest,
    /// Source of a copy.
    CopySource,
    /// Read and written by compute dispatches.
    UnorderedAccess,
    /// Readable by any device operation. The permanent state of upload buffers.
    GenericRead,
}

/// A byte range of a buffer bound to an operator slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBinding {
    /// The bound buffer.
    pub buffer: BufferHandle,
    /// Byte offset of the range.
    pub offset: u64,
    /// Byte length of the range.
    pub size: u64,
}

impl BufferBinding {
    /// Binds the first `size` bytes of a buffer.
    pub fn whole(buffer: BufferHandle, size: u64) -> Self {
        Self {
            buffer,
            offset: 0,
            size,
        }
    }
}

/// The resolved bindings a dispatch is recorded with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingSet {
    /// Operator inputs, by input index. `None` leaves a slot unbound.
    pub inputs: Vec<Option<BufferBinding>>,
    /// Operator outputs, by output index.
    pub outputs: Vec<Option<BufferBinding>>,
    /// Scratch memory valid for the duration of the dispatch.
    pub temporary: Option<BufferBinding>,
    /// Memory that survives from initialization to execution.
    pub persistent: Option<BufferBinding>,
}

/// Memory and descriptor requirements of a dispatchable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BindingProperties {
    /// Number of descriptors the binding table needs.
    pub required_descriptor_count: u32,
    /// Bytes of scratch memory needed while dispatching.
    pub temporary_resource_size: u64,
    /// Bytes of memory that must outlive initialization.
    pub persistent_resource_size: u64,
}

/// Compilation hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionFlags {
    /// Allows the device to compute float32 operators at half precision.
    pub allow_half_precision: bool,
}

impl Default for ExecutionFlags {
    fn default() -> Self {
        Self {
            allow_half_precision: true,
        }
    }
}

/// A unit of recorded work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Copies `size` bytes from the start of `src` to the start of `dst`.
    CopyBuffer {
        /// Destination buffer.
        dst: BufferHandle,
        /// Source buffer.
        src: BufferHandle,
        /// Number of bytes.
        size: u64,
    },
    /// Moves a buffer from one usage state to another.
    Transition {
        /// The buffer.
        buffer: BufferHandle,
        /// The state the buffer is in.
        before: ResourceState,
        /// The state the buffer moves to.
        after: ResourceState,
    },
    /// Makes a descriptor heap current for later dispatches.
    SetDescriptorHeap(DescriptorHeapHandle),
    /// Runs an operator or an initializer with the given bindings.
    Dispatch {
        /// The operator or initializer.
        dispatchable: DispatchableHandle,
        /// The buffers bound to its slots.
        bindings: BindingSet,
    },
}

/// Trait defining the operations of an accelerator driver.
///
/// A device owns one command queue. Work is handed over as closed command lists through
/// [`ComputeDevice::execute`], and completion is observed through a fence driven by
/// [`ComputeDevice::signal`] and [`ComputeDevice::wait`].
///
/// # Thread Safety
///
/// Implementations must be `Send` so that a device can be moved into a dedicated executor
/// thread. They are never shared between threads.
pub trait ComputeDevice: Send {
    /// Returns the device type for this backend.
    fn kind(&self) -> DeviceKind;

    /// Returns the adapter the device was created on.
    fn adapter(&self) -> &AdapterInfo;

    /// Returns true if operators on the given element type can be compiled.
    fn supports_data_type(&self, data_type: DataType) -> bool;

    /// Allocates a buffer.
    ///
    /// # Arguments
    ///
    /// * `heap` - The heap to allocate from
    /// * `size` - The size in bytes
    /// * `initial_state` - The usage state the buffer starts in
    ///
    /// # Errors
    ///
    /// Returns an error if the allocation fails.
    fn create_buffer(
        &mut self,
        heap: HeapKind,
        size: u64,
        initial_state: ResourceState,
    ) -> Result<BufferHandle, DeviceError>;

    /// Releases a buffer. Releasing an unknown handle is a no-op.
    fn release_buffer(&mut self, buffer: BufferHandle);

    /// Returns the size in bytes of a buffer.
    fn buffer_size(&self, buffer: BufferHandle) -> Result<u64, DeviceError>;

    /// Writes host data into an upload buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is not on the upload heap or the range is out of
    /// bounds.
    fn write_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<(), DeviceError>;

    /// Reads a readback buffer into host memory.
    ///
    /// The caller must have waited for the work that filled the buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is not on the readback heap or the range is out of
    /// bounds.
    fn read_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: u64,
        out: &mut [u8],
    ) -> Result<(), DeviceError>;

    /// Creates a shader-visible descriptor heap with room for `count` descriptors.
    fn create_descriptor_heap(&mut self, count: u32)
        -> Result<DescriptorHeapHandle, DeviceError>;

    /// Releases a descriptor heap.
    fn release_descriptor_heap(&mut self, heap: DescriptorHeapHandle);

    /// Compiles an operator graph into a dispatchable operator.
    fn compile_operator(
        &mut self,
        graph: &OperatorGraph,
        flags: ExecutionFlags,
    ) -> Result<DispatchableHandle, DeviceError>;

    /// Creates an initializer for the given compiled operators.
    fn create_initializer(
        &mut self,
        operators: &[DispatchableHandle],
    ) -> Result<DispatchableHandle, DeviceError>;

    /// Returns the binding requirements of an operator or initializer.
    fn binding_properties(
        &self,
        dispatchable: DispatchableHandle,
    ) -> Result<BindingProperties, DeviceError>;

    /// Releases an operator or initializer.
    fn release_dispatchable(&mut self, dispatchable: DispatchableHandle);

    /// Submits a closed command list to the queue.
    fn execute(&mut self, commands: &[Command]) -> Result<(), DeviceError>;

    /// Makes the queue set the fence to `value` once all submitted work completes.
    fn signal(&mut self, value: u64) -> Result<(), DeviceError>;

    /// Blocks until the fence reaches `value`.
    fn wait(&mut self, value: u64) -> Result<(), DeviceError>;

    /// Returns the last fence value reached.
    fn completed_value(&self) -> u64;

    /// Returns the total size in bytes of the live buffers.
    fn allocated_bytes(&self) -> u64;
}

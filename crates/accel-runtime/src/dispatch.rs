//! Two-phase dispatch of compiled operators.
//!
//! A compiled operator runs in two submissions sharing one descriptor heap: first its
//! initializer fills the persistent resource, then the operator itself executes with its
//! inputs, outputs and scratch memory bound.

use log::debug;

use crate::{
    context::ComputeContext,
    device::{
        BindingProperties, BindingSet, BufferBinding, ComputeDevice, DescriptorHeapHandle,
        DeviceError, DispatchableHandle, HeapKind, ResourceState,
    },
    error::EngineError,
    pipeline::CompiledAdd,
    registry::TensorRegistry,
};

/// Binds buffers to the slots of one dispatchable within a descriptor budget.
#[derive(Debug, Clone)]
pub struct BindingTable {
    dispatchable: DispatchableHandle,
    properties: BindingProperties,
    descriptor_capacity: u32,
    set: BindingSet,
}

impl BindingTable {
    /// Creates an empty table for `dispatchable` on a heap of `descriptor_capacity`.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::InvalidBinding`] if the heap is smaller than the
    /// dispatchable requires.
    pub fn new(
        dispatchable: DispatchableHandle,
        properties: BindingProperties,
        descriptor_capacity: u32,
    ) -> Result<Self, DeviceError> {
        let mut table = Self {
            dispatchable,
            properties,
            descriptor_capacity,
            set: BindingSet::default(),
        };
        table.reset(dispatchable, properties)?;
        Ok(table)
    }

    /// Clears the bindings and retargets the table at another dispatchable.
    pub fn reset(
        &mut self,
        dispatchable: DispatchableHandle,
        properties: BindingProperties,
    ) -> Result<(), DeviceError> {
        if properties.required_descriptor_count > self.descriptor_capacity {
            return Err(DeviceError::InvalidBinding(format!(
                "dispatchable needs {} descriptors, heap holds {}",
                properties.required_descriptor_count, self.descriptor_capacity
            )));
        }
        self.dispatchable = dispatchable;
        self.properties = properties;
        self.set = BindingSet::default();
        Ok(())
    }

    /// Returns the dispatchable the table binds.
    pub fn dispatchable(&self) -> DispatchableHandle {
        self.dispatchable
    }

    /// Returns the number of descriptors the current bindings occupy.
    pub fn descriptors_used(&self) -> u32 {
        let bound = |b: &Option<BufferBinding>| u32::from(b.is_some());
        self.set.inputs.iter().map(bound).sum::<u32>()
            + self.set.outputs.iter().map(bound).sum::<u32>()
            + bound(&self.set.temporary)
            + bound(&self.set.persistent)
    }

    fn check_budget(&self) -> Result<(), DeviceError> {
        let used = self.descriptors_used();
        if used > self.descriptor_capacity {
            return Err(DeviceError::InvalidBinding(format!(
                "{used} bindings exceed the {} descriptors of the heap",
                self.descriptor_capacity
            )));
        }
        Ok(())
    }

    /// Binds the inputs in slot order.
    pub fn bind_inputs(&mut self, bindings: &[Option<BufferBinding>]) -> Result<(), DeviceError> {
        self.set.inputs = bindings.to_vec();
        self.check_budget()
    }

    /// Binds the outputs in slot order.
    pub fn bind_outputs(&mut self, bindings: &[Option<BufferBinding>]) -> Result<(), DeviceError> {
        self.set.outputs = bindings.to_vec();
        self.check_budget()
    }

    /// Binds the scratch resource.
    pub fn bind_temporary(&mut self, binding: Option<BufferBinding>) -> Result<(), DeviceError> {
        if let Some(b) = binding {
            if b.size < self.properties.temporary_resource_size {
                return Err(DeviceError::InvalidBinding(format!(
                    "temporary binding of {} bytes, {} required",
                    b.size, self.properties.temporary_resource_size
                )));
            }
        }
        self.set.temporary = binding;
        self.check_budget()
    }

    /// Binds the persistent resource.
    pub fn bind_persistent(&mut self, binding: Option<BufferBinding>) -> Result<(), DeviceError> {
        if let Some(b) = binding {
            if b.size < self.properties.persistent_resource_size {
                return Err(DeviceError::InvalidBinding(format!(
                    "persistent binding of {} bytes, {} required",
                    b.size, self.properties.persistent_resource_size
                )));
            }
        }
        self.set.persistent = binding;
        self.check_budget()
    }

    /// Returns the bindings to record with a dispatch.
    pub fn to_binding_set(&self) -> BindingSet {
        self.set.clone()
    }
}

struct Scratch {
    heap: DescriptorHeapHandle,
    temporary: Option<BufferBinding>,
    persistent: Option<BufferBinding>,
}

/// Runs compiled operators against registered tensors.
pub struct DispatchRunner;

impl DispatchRunner {
    /// Initialize and execute `compiled`, writing `inputs[0] + inputs[1]` into `output`.
    ///
    /// Tensors are bound by their full buffer extent and moved to
    /// [`ResourceState::UnorderedAccess`] when needed. The descriptor heap and scratch
    /// buffers are released before returning, whether the dispatch succeeded or not.
    ///
    /// # Arguments
    ///
    /// * `ctx` - The context to record and submit with
    /// * `registry` - The tensors the names refer to
    /// * `compiled` - The operator to run
    /// * `inputs` - The names of the left and right operand
    /// * `output` - The name of the destination tensor
    pub fn run(
        ctx: &mut ComputeContext,
        registry: &mut TensorRegistry,
        compiled: &CompiledAdd,
        inputs: [&str; 2],
        output: &str,
    ) -> Result<(), EngineError> {
        let scratch = Self::allocate(ctx, compiled)?;
        let result = Self::dispatch(ctx, registry, compiled, &scratch, inputs, output);

        let device = ctx.device_mut();
        for binding in [scratch.temporary, scratch.persistent].into_iter().flatten() {
            device.release_buffer(binding.buffer);
        }
        device.release_descriptor_heap(scratch.heap);
        result
    }

    fn allocate(ctx: &mut ComputeContext, compiled: &CompiledAdd) -> Result<Scratch, DeviceError> {
        let requirements = compiled.requirements();
        let device = ctx.device_mut();
        let heap = device.create_descriptor_heap(requirements.descriptor_count.max(1))?;

        let temporary = match scratch_buffer(device, requirements.temporary_size) {
            Ok(temporary) => temporary,
            Err(e) => {
                device.release_descriptor_heap(heap);
                return Err(e);
            }
        };
        let persistent = match scratch_buffer(device, requirements.persistent_size) {
            Ok(persistent) => persistent,
            Err(e) => {
                if let Some(b) = temporary {
                    device.release_buffer(b.buffer);
                }
                device.release_descriptor_heap(heap);
                return Err(e);
            }
        };
        debug!(
            "allocated {} descriptors, {} temporary bytes, {} persistent bytes",
            requirements.descriptor_count, requirements.temporary_size, requirements.persistent_size
        );
        Ok(Scratch {
            heap,
            temporary,
            persistent,
        })
    }

    fn bind_tensor(
        ctx: &mut ComputeContext,
        registry: &mut TensorRegistry,
        name: &str,
    ) -> Result<BufferBinding, EngineError> {
        let record = registry
            .get_mut(name)
            .ok_or_else(|| EngineError::NotFound(name.to_string()))?;
        ctx.record_transition(
            record.buffer(),
            record.state(),
            ResourceState::UnorderedAccess,
        )?;
        record.set_state(ResourceState::UnorderedAccess);
        Ok(BufferBinding::whole(
            record.buffer(),
            record.desc().total_size_in_bytes(),
        ))
    }

    fn dispatch(
        ctx: &mut ComputeContext,
        registry: &mut TensorRegistry,
        compiled: &CompiledAdd,
        scratch: &Scratch,
        inputs: [&str; 2],
        output: &str,
    ) -> Result<(), EngineError> {
        let capacity = compiled.requirements().descriptor_count.max(1);

        // initialize
        let initializer = compiled.initializer();
        let properties = ctx.device().binding_properties(initializer)?;
        let mut table = BindingTable::new(initializer, properties, capacity)?;
        if properties.temporary_resource_size > 0 {
            table.bind_temporary(scratch.temporary)?;
        }
        table.bind_outputs(&[scratch.persistent])?;
        ctx.set_descriptor_heap(scratch.heap)?;
        ctx.record_dispatch(initializer, table.to_binding_set())?;
        ctx.submit_and_wait()?;
        debug!("initialized operator {:?}", compiled.operator());

        // execute
        let operator = compiled.operator();
        let properties = ctx.device().binding_properties(operator)?;
        table.reset(operator, properties)?;
        if properties.temporary_resource_size > 0 {
            table.bind_temporary(scratch.temporary)?;
        }
        if properties.persistent_resource_size > 0 {
            table.bind_persistent(scratch.persistent)?;
        }
        let lhs = Self::bind_tensor(ctx, registry, inputs[0])?;
        let rhs = Self::bind_tensor(ctx, registry, inputs[1])?;
        let dst = Self::bind_tensor(ctx, registry, output)?;
        table.bind_inputs(&[Some(lhs), Some(rhs)])?;
        table.bind_outputs(&[Some(dst)])?;

        ctx.set_descriptor_heap(scratch.heap)?;
        ctx.record_dispatch(operator, table.to_binding_set())?;
        ctx.submit_and_wait()?;
        debug!(
            "dispatched {} + {} into {} ({} descriptors bound)",
            inputs[0],
            inputs[1],
            output,
            table.descriptors_used()
        );
        Ok(())
    }
}

fn scratch_buffer(
    device: &mut dyn ComputeDevice,
    size: u64,
) -> Result<Option<BufferBinding>, DeviceError> {
    if size == 0 {
        return Ok(None);
    }
    let buffer = device.create_buffer(HeapKind::Default, size, ResourceState::UnorderedAccess)?;
    Ok(Some(BufferBinding::whole(buffer, size)))
}

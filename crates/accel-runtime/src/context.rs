use log::debug;

use crate::device::{
    BindingSet, BufferHandle, Command, ComputeDevice, DescriptorHeapHandle, DeviceError,
    DispatchableHandle, ResourceState,
};

/// State of the command recorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    /// Commands can be recorded.
    Recording,
    /// The list was handed to the queue and the recorder has not been reset.
    Submitted,
}

/// Owns a device, its command recorder and the fence counter.
///
/// Work is recorded into a single command list and only reaches the device on
/// [`ComputeContext::submit_and_wait`], which blocks until the queue has finished it.
pub struct ComputeContext {
    device: Box<dyn ComputeDevice>,
    commands: Vec<Command>,
    state: RecorderState,
    fence_value: u64,
}

impl ComputeContext {
    /// Creates a context recording for `device`.
    pub fn new(device: Box<dyn ComputeDevice>) -> Self {
        Self {
            device,
            commands: Vec::new(),
            state: RecorderState::Recording,
            fence_value: 0,
        }
    }

    /// Returns the device.
    pub fn device(&self) -> &dyn ComputeDevice {
        self.device.as_ref()
    }

    /// Returns the device for resource creation.
    pub fn device_mut(&mut self) -> &mut dyn ComputeDevice {
        self.device.as_mut()
    }

    /// Returns the recorder state.
    pub fn state(&self) -> RecorderState {
        self.state
    }

    /// Returns the commands recorded since the last submission.
    pub fn pending(&self) -> &[Command] {
        &self.commands
    }

    /// Returns the fence value of the last completed submission.
    pub fn fence_value(&self) -> u64 {
        self.fence_value
    }

    fn record(&mut self, command: Command) -> Result<(), DeviceError> {
        if self.state != RecorderState::Recording {
            return Err(DeviceError::InvalidState(
                "command list was not reset after a failed submission".into(),
            ));
        }
        self.commands.push(command);
        Ok(())
    }

    /// Records a state transition. Transitions to the current state are skipped.
    pub fn record_transition(
        &mut self,
        buffer: BufferHandle,
        before: ResourceState,
        after: ResourceState,
    ) -> Result<(), DeviceError> {
        if before == after {
            return Ok(());
        }
        self.record(Command::Transition {
            buffer,
            before,
            after,
        })
    }

    /// Records a copy of `size` bytes from `src` to `dst`.
    pub fn record_copy(
        &mut self,
        dst: BufferHandle,
        src: BufferHandle,
        size: u64,
    ) -> Result<(), DeviceError> {
        self.record(Command::CopyBuffer { dst, src, size })
    }

    /// Makes a descriptor heap current for the following dispatches.
    pub fn set_descriptor_heap(&mut self, heap: DescriptorHeapHandle) -> Result<(), DeviceError> {
        self.record(Command::SetDescriptorHeap(heap))
    }

    /// Records a dispatch of an operator or initializer.
    pub fn record_dispatch(
        &mut self,
        dispatchable: DispatchableHandle,
        bindings: BindingSet,
    ) -> Result<(), DeviceError> {
        self.record(Command::Dispatch {
            dispatchable,
            bindings,
        })
    }

    /// Writes `data` into `staging` and records its upload into `dst`.
    ///
    /// `dst` is moved to [`ResourceState::CopyDest`] if needed and left in
    /// [`ResourceState::UnorderedAccess`], which is returned as its new state.
    ///
    /// # Arguments
    ///
    /// * `dst` - The default heap buffer to fill
    /// * `dst_state` - The state `dst` is in when the recorded commands run
    /// * `staging` - An upload heap buffer at least as large as `data`
    /// * `data` - The bytes to upload
    pub fn record_upload(
        &mut self,
        dst: BufferHandle,
        dst_state: ResourceState,
        staging: BufferHandle,
        data: &[u8],
    ) -> Result<ResourceState, DeviceError> {
        self.device.write_buffer(staging, 0, data)?;
        let size = (data.len() as u64).next_multiple_of(4);
        self.record_transition(dst, dst_state, ResourceState::CopyDest)?;
        self.record_copy(dst, staging, size)?;
        self.record_transition(dst, ResourceState::CopyDest, ResourceState::UnorderedAccess)?;
        Ok(ResourceState::UnorderedAccess)
    }

    /// Records a copy of `src` into `readback`.
    ///
    /// `src` is moved to [`ResourceState::CopySource`] for the copy and restored to
    /// [`ResourceState::UnorderedAccess`], which is returned as its new state.
    pub fn record_readback(
        &mut self,
        src: BufferHandle,
        src_state: ResourceState,
        readback: BufferHandle,
        size: u64,
    ) -> Result<ResourceState, DeviceError> {
        self.record_transition(src, src_state, ResourceState::CopySource)?;
        self.record_copy(readback, src, size)?;
        self.record_transition(src, ResourceState::CopySource, ResourceState::UnorderedAccess)?;
        Ok(ResourceState::UnorderedAccess)
    }

    /// Submits the recorded commands and blocks until the device has executed them.
    ///
    /// Every submission signals the next fence value, even when nothing was recorded.
    /// After a failure the recorder stays in [`RecorderState::Submitted`] and refuses new
    /// commands.
    ///
    /// Returns the fence value that was reached.
    pub fn submit_and_wait(&mut self) -> Result<u64, DeviceError> {
        if self.state != RecorderState::Recording {
            return Err(DeviceError::InvalidState(
                "command list was not reset after a failed submission".into(),
            ));
        }
        self.state = RecorderState::Submitted;
        let commands = std::mem::take(&mut self.commands);
        let value = self.fence_value + 1;

        debug!("submitting {} commands, fence {}", commands.len(), value);
        self.device.execute(&commands)?;
        self.device.signal(value)?;
        self.device.wait(value)?;

        self.fence_value = value;
        self.state = RecorderState::Recording;
        Ok(value)
    }

    /// Submits pending commands, if any.
    pub fn flush(&mut self) -> Result<(), DeviceError> {
        if !self.commands.is_empty() {
            self.submit_and_wait()?;
        }
        Ok(())
    }
}

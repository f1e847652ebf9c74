use std::collections::HashMap;

use accel_tensor::TensorDesc;
use log::{debug, warn};

use crate::{
    context::ComputeContext,
    device::{BufferHandle, DeviceError, HeapKind, ResourceState},
    error::EngineError,
};

/// A named tensor resident on the device.
///
/// The shape and element type are fixed when the record is created. The staging buffer is
/// kept alive and reused by later writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorRecord {
    name: String,
    desc: TensorDesc,
    buffer: BufferHandle,
    staging: BufferHandle,
    state: ResourceState,
}

impl TensorRecord {
    /// Returns the tensor name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the tensor descriptor.
    pub fn desc(&self) -> &TensorDesc {
        &self.desc
    }

    /// Returns the default heap buffer holding the tensor.
    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    /// Returns the upload buffer used to fill the tensor.
    pub fn staging(&self) -> BufferHandle {
        self.staging
    }

    /// Returns the state the buffer is in once the recorded work has run.
    pub fn state(&self) -> ResourceState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ResourceState) {
        self.state = state;
    }
}

/// Named tensors owned by an engine.
#[derive(Debug, Default)]
pub struct TensorRegistry {
    records: HashMap<String, TensorRecord>,
}

impl TensorRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or overwrite the tensor `name` with `data`.
    ///
    /// The first write creates the device buffers. Later writes must supply the same number
    /// of bytes and reuse them; a different shape or type is ignored with a warning. The
    /// upload is recorded but not submitted.
    ///
    /// # Arguments
    ///
    /// * `ctx` - The context to record into
    /// * `name` - The tensor name
    /// * `desc` - The declared descriptor
    /// * `data` - The packed tensor bytes
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ShapeMismatch`] without touching the device if the byte size
    /// is wrong.
    pub fn write(
        &mut self,
        ctx: &mut ComputeContext,
        name: &str,
        desc: TensorDesc,
        data: &[u8],
    ) -> Result<(), EngineError> {
        if let Some(record) = self.records.get_mut(name) {
            let expected = record.desc.packed_size_in_bytes();
            if data.len() as u64 != expected {
                return Err(EngineError::ShapeMismatch {
                    name: name.to_string(),
                    expected,
                    actual: data.len() as u64,
                });
            }
            if record.desc != desc {
                warn!(
                    "tensor '{}' is {}, ignoring re-declaration as {}",
                    name, record.desc, desc
                );
            }
            debug!("reusing buffers of tensor '{}'", name);
            record.state = ctx.record_upload(record.buffer, record.state, record.staging, data)?;
            return Ok(());
        }

        let expected = desc.packed_size_in_bytes();
        if data.len() as u64 != expected {
            return Err(EngineError::ShapeMismatch {
                name: name.to_string(),
                expected,
                actual: data.len() as u64,
            });
        }

        let size = desc.total_size_in_bytes();
        let device = ctx.device_mut();
        let buffer = device.create_buffer(HeapKind::Default, size, ResourceState::CopyDest)?;
        let staging = match device.create_buffer(HeapKind::Upload, size, ResourceState::GenericRead)
        {
            Ok(staging) => staging,
            Err(e) => {
                device.release_buffer(buffer);
                return Err(e.into());
            }
        };
        debug!("created tensor '{}' {} ({} bytes)", name, desc, size);

        let state = match ctx.record_upload(buffer, ResourceState::CopyDest, staging, data) {
            Ok(state) => state,
            Err(e) => {
                ctx.device_mut().release_buffer(staging);
                ctx.device_mut().release_buffer(buffer);
                return Err(e.into());
            }
        };
        self.records.insert(
            name.to_string(),
            TensorRecord {
                name: name.to_string(),
                desc,
                buffer,
                staging,
                state,
            },
        );
        Ok(())
    }

    /// Read the tensor `name` into `out`.
    ///
    /// Submits all recorded work and blocks until the copy has finished. The buffer is left
    /// usable by later dispatches.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for an unknown name and
    /// [`EngineError::ShapeMismatch`] if `out` is not the size of the tensor.
    pub fn read(
        &mut self,
        ctx: &mut ComputeContext,
        name: &str,
        out: &mut [u8],
    ) -> Result<(), EngineError> {
        let record = self
            .records
            .get_mut(name)
            .ok_or_else(|| EngineError::NotFound(name.to_string()))?;
        let expected = record.desc.packed_size_in_bytes();
        if out.len() as u64 != expected {
            return Err(EngineError::ShapeMismatch {
                name: name.to_string(),
                expected,
                actual: out.len() as u64,
            });
        }

        let size = record.desc.total_size_in_bytes();
        let readback =
            ctx.device_mut()
                .create_buffer(HeapKind::Readback, size, ResourceState::CopyDest)?;

        let result = (|| -> Result<ResourceState, DeviceError> {
            let state = ctx.record_readback(record.buffer, record.state, readback, size)?;
            ctx.submit_and_wait()?;
            ctx.device_mut().read_buffer(readback, 0, out)?;
            Ok(state)
        })();
        ctx.device_mut().release_buffer(readback);

        record.state = result?;
        debug!("read tensor '{}' ({} bytes)", name, expected);
        Ok(())
    }

    /// Release the buffers of one tensor and forget it.
    ///
    /// Pending work is submitted first since it may reference the buffers.
    pub fn release(&mut self, ctx: &mut ComputeContext, name: &str) -> Result<(), EngineError> {
        if !self.records.contains_key(name) {
            return Err(EngineError::NotFound(name.to_string()));
        }
        ctx.flush()?;
        if let Some(record) = self.records.remove(name) {
            Self::release_record(ctx, &record);
        }
        Ok(())
    }

    /// Release every tensor.
    pub fn release_all(&mut self, ctx: &mut ComputeContext) -> Result<(), EngineError> {
        ctx.flush()?;
        for (_, record) in self.records.drain() {
            Self::release_record(ctx, &record);
        }
        Ok(())
    }

    fn release_record(ctx: &mut ComputeContext, record: &TensorRecord) {
        debug!("releasing tensor '{}'", record.name);
        ctx.device_mut().release_buffer(record.buffer);
        ctx.device_mut().release_buffer(record.staging);
    }

    /// Returns the record of `name`.
    pub fn get(&self, name: &str) -> Option<&TensorRecord> {
        self.records.get(name)
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Option<&mut TensorRecord> {
        self.records.get_mut(name)
    }

    /// Returns true if `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.records.contains_key(name)
    }

    /// Returns the number of tensors.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if no tensor is registered.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Returns the registered names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.records.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

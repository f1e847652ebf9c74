use accel_tensor::{broadcast, DataType, Element, ShapeError, TensorDesc, TensorShape};
use log::{debug, error, info};

use crate::{
    adapter::{acquire_device, AdapterInfo, DeviceProvider},
    config::{BackendKind, EngineConfig},
    context::ComputeContext,
    device::{ComputeDevice, DeviceKind, ExecutionFlags},
    dispatch::DispatchRunner,
    error::EngineError,
    host::HostProvider,
    pipeline,
    registry::TensorRegistry,
};

/// Named device tensors and the broadcast add between them.
///
/// Tensors are uploaded with [`Engine::set_tensor`], combined with
/// [`Engine::add_broadcast`] and read back with [`Engine::get_tensor`]. Every call blocks
/// until the device work it needs has finished.
///
/// A device error leaves recorded state unknown, so after one every call fails with
/// [`EngineError::Poisoned`].
///
/// # Example
///
/// ```
/// use accel_runtime::{Engine, EngineConfig};
///
/// let mut engine = Engine::new(EngineConfig::default())?;
/// engine.set_tensor_from_slice("a", [1, 1, 4, 1], &[1.0f32, 2.0, 3.0, 4.0])?;
/// engine.set_tensor_from_slice("b", [1, 1, 1, 1], &[10.0f32])?;
/// engine.set_tensor_from_slice("c", [1, 1, 4, 1], &[0.0f32; 4])?;
/// engine.add_broadcast("a", "b", "c")?;
/// assert_eq!(engine.get_tensor_vec::<f32>("c", [1, 1, 4, 1])?, vec![11.0, 12.0, 13.0, 14.0]);
/// # Ok::<(), accel_runtime::EngineError>(())
/// ```
pub struct Engine {
    ctx: ComputeContext,
    registry: TensorRegistry,
    config: EngineConfig,
    poisoned: bool,
}

impl Engine {
    /// Acquire a device for the configured backend and create an engine on it.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::DeviceAcquisition`] if no adapter matches the configuration.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let provider: Box<dyn DeviceProvider> = match config.backend {
            BackendKind::Host => Box::new(HostProvider),
            #[cfg(feature = "wgpu")]
            BackendKind::Wgpu => Box::new(crate::gpu::WgpuProvider::new()),
            #[cfg(not(feature = "wgpu"))]
            BackendKind::Wgpu => {
                return Err(EngineError::DeviceAcquisition(
                    "built without the wgpu feature".into(),
                ))
            }
        };
        let device = acquire_device(provider.as_ref(), &config.adapter_filter, config.debug)?;
        Ok(Self::with_device(device, config))
    }

    /// Create an engine on an already opened device.
    pub fn with_device(device: Box<dyn ComputeDevice>, config: EngineConfig) -> Self {
        info!(
            "{}: float16 compute {}supported",
            device.adapter().description,
            if device.supports_data_type(DataType::Float16) {
                ""
            } else {
                "not "
            }
        );
        Self {
            ctx: ComputeContext::new(device),
            registry: TensorRegistry::new(),
            config,
            poisoned: false,
        }
    }

    fn check(&self) -> Result<(), EngineError> {
        if self.poisoned {
            return Err(EngineError::Poisoned);
        }
        Ok(())
    }

    fn track<T>(&mut self, result: Result<T, EngineError>) -> Result<T, EngineError> {
        if let Err(EngineError::Device(e)) = &result {
            error!("device error, engine is no longer usable: {e}");
            self.poisoned = true;
        }
        result
    }

    /// Create or overwrite a tensor from packed bytes.
    ///
    /// The upload is recorded and submitted with the next operation that needs the device.
    ///
    /// # Arguments
    ///
    /// * `name` - The tensor name
    /// * `shape` - The 4-D shape
    /// * `data_type` - The element type
    /// * `data` - The packed elements
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ShapeMismatch`] if `data` is not the byte size of the tensor,
    /// and [`EngineError::InvalidShape`] if the shape has a zero axis.
    pub fn set_tensor(
        &mut self,
        name: &str,
        shape: TensorShape,
        data_type: DataType,
        data: &[u8],
    ) -> Result<(), EngineError> {
        self.check()?;
        let desc = TensorDesc::new(data_type, shape)?;
        let result = self.registry.write(&mut self.ctx, name, desc, data);
        self.track(result)
    }

    /// Create or overwrite a tensor from typed elements.
    pub fn set_tensor_from_slice<T: Element>(
        &mut self,
        name: &str,
        shape: TensorShape,
        data: &[T],
    ) -> Result<(), EngineError> {
        self.set_tensor(name, shape, T::DATA_TYPE, bytemuck::cast_slice(data))
    }

    /// Read a tensor into packed bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for an unknown name,
    /// [`EngineError::DescriptorMismatch`] if the shape or type differ from the tensor's,
    /// and [`EngineError::ShapeMismatch`] if `out` is not the byte size of the tensor.
    pub fn get_tensor(
        &mut self,
        name: &str,
        shape: TensorShape,
        data_type: DataType,
        out: &mut [u8],
    ) -> Result<(), EngineError> {
        self.check()?;
        self.check_declaration(name, shape, data_type)?;
        let result = self.registry.read(&mut self.ctx, name, out);
        self.track(result)
    }

    /// Read a tensor into a vector of typed elements.
    pub fn get_tensor_vec<T: Element>(
        &mut self,
        name: &str,
        shape: TensorShape,
    ) -> Result<Vec<T>, EngineError> {
        self.check()?;
        let desc = self.check_declaration(name, shape, T::DATA_TYPE)?;
        let count = usize::try_from(desc.element_count()).map_err(|_| ShapeError::TooLarge {
            shape: shape.to_vec(),
            element_size: T::DATA_TYPE.size_in_bytes(),
        })?;
        let mut out = vec![T::zeroed(); count];
        self.get_tensor(name, shape, T::DATA_TYPE, bytemuck::cast_slice_mut(&mut out))?;
        Ok(out)
    }

    fn check_declaration(
        &self,
        name: &str,
        shape: TensorShape,
        data_type: DataType,
    ) -> Result<TensorDesc, EngineError> {
        let declared = self.tensor_desc(name)?;
        if declared.sizes != shape || declared.data_type != data_type {
            return Err(EngineError::DescriptorMismatch {
                name: name.to_string(),
                declared,
                requested: TensorDesc::new(data_type, shape)?,
            });
        }
        Ok(declared)
    }

    /// Compute `dst = lhs + broadcast(rhs)` on the device.
    ///
    /// `rhs` is broadcast into the shape of `lhs` when every axis of `rhs` divides the
    /// matching axis of `lhs`. `dst` must already exist with the shape and type of `lhs`.
    /// `dst` may name one of the operands.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] if a name is unknown and
    /// [`EngineError::IncompatibleShapes`] if the shapes do not broadcast or `dst` has the
    /// wrong shape. Neither touches the device.
    pub fn add_broadcast(&mut self, lhs: &str, rhs: &str, dst: &str) -> Result<(), EngineError> {
        self.check()?;
        let [a, b, d] = [lhs, rhs, dst].map(|name| {
            self.registry
                .get(name)
                .map(|r| *r.desc())
                .ok_or_else(|| EngineError::NotFound(name.to_string()))
        });
        let (a, b, d) = (a?, b?, d?);

        if !broadcast::can_broadcast(&a.sizes, &b.sizes) {
            return Err(EngineError::IncompatibleShapes {
                lhs: a.sizes,
                rhs: b.sizes,
            });
        }
        if d.sizes != a.sizes || d.data_type != a.data_type {
            return Err(EngineError::IncompatibleShapes {
                lhs: a.sizes,
                rhs: d.sizes,
            });
        }

        let flags = ExecutionFlags {
            allow_half_precision: self.config.allow_half_precision,
        };
        let result = self.run_add(&a, &b, flags, [lhs, rhs], dst);
        self.track(result)?;
        debug!("{} = {} + {}", dst, lhs, rhs);
        Ok(())
    }

    fn run_add(
        &mut self,
        lhs: &TensorDesc,
        rhs: &TensorDesc,
        flags: ExecutionFlags,
        inputs: [&str; 2],
        output: &str,
    ) -> Result<(), EngineError> {
        let compiled = pipeline::build_add(self.ctx.device_mut(), lhs, rhs, flags)?;
        let result = DispatchRunner::run(
            &mut self.ctx,
            &mut self.registry,
            &compiled,
            inputs,
            output,
        );
        compiled.release(self.ctx.device_mut());
        result
    }

    /// Release one tensor.
    pub fn release_tensor(&mut self, name: &str) -> Result<(), EngineError> {
        self.check()?;
        let result = self.registry.release(&mut self.ctx, name);
        self.track(result)
    }

    /// Release every tensor. Names become unknown until written again.
    pub fn release_all(&mut self) -> Result<(), EngineError> {
        self.check()?;
        let result = self.registry.release_all(&mut self.ctx);
        self.track(result)
    }

    /// Returns the descriptor of a tensor.
    pub fn tensor_desc(&self, name: &str) -> Result<TensorDesc, EngineError> {
        self.registry
            .get(name)
            .map(|r| *r.desc())
            .ok_or_else(|| EngineError::NotFound(name.to_string()))
    }

    /// Returns true if a tensor is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.registry.contains(name)
    }

    /// Returns the registered tensor names in sorted order.
    pub fn tensor_names(&self) -> Vec<&str> {
        self.registry.names()
    }

    /// Returns the adapter the device was created on.
    pub fn adapter(&self) -> &AdapterInfo {
        self.ctx.device().adapter()
    }

    /// Returns the kind of device.
    pub fn device_kind(&self) -> DeviceKind {
        self.ctx.device().kind()
    }

    /// Returns the fence value of the last completed submission.
    pub fn fence_value(&self) -> u64 {
        self.ctx.fence_value()
    }

    /// Returns the bytes held by live device buffers.
    pub fn allocated_bytes(&self) -> u64 {
        self.ctx.device().allocated_bytes()
    }

    /// Returns the configuration the engine was created with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns true once a device error has made the engine unusable.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }
}

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use accel_runtime::{
    device::{
        BindingProperties, BufferHandle, Command, DescriptorHeapHandle, DispatchableHandle,
        HeapKind, ResourceState,
    },
    AdapterInfo, ComputeDevice, DeviceError, DeviceKind, Engine, EngineConfig, EngineError,
    ExecutionFlags, HostDevice, OperatorGraph,
};
use accel_tensor::{DataType, ShapeError};
use approx::assert_relative_eq;
use rand::Rng;

fn engine() -> Result<Engine, EngineError> {
    let _ = env_logger::builder().is_test(true).try_init();
    Engine::new(EngineConfig::default())
}

fn random_vec(n: usize) -> Vec<f32> {
    let mut rng = rand::rng();
    (0..n).map(|_| rng.random_range(-100.0..100.0)).collect()
}

#[test]
fn test_add_identical_shapes() -> Result<(), Box<dyn std::error::Error>> {
    let mut engine = engine()?;
    let a = random_vec(8);
    let b = random_vec(8);
    engine.set_tensor_from_slice("A", [1, 1, 8, 1], &a)?;
    engine.set_tensor_from_slice("B", [1, 1, 8, 1], &b)?;
    engine.set_tensor_from_slice("D", [1, 1, 8, 1], &[0.0f32; 8])?;

    engine.add_broadcast("A", "B", "D")?;

    let d = engine.get_tensor_vec::<f32>("D", [1, 1, 8, 1])?;
    for i in 0..8 {
        assert_relative_eq!(d[i], a[i] + b[i]);
    }
    Ok(())
}

#[test]
fn test_add_sample_values() -> Result<(), Box<dyn std::error::Error>> {
    let mut engine = engine()?;
    let a: Vec<f32> = (1..=8).map(|x| x as f32).collect();
    let b: Vec<f32> = (1..=8).map(|x| (x * 10) as f32).collect();
    engine.set_tensor_from_slice("a", [1, 1, 8, 1], &a)?;
    engine.set_tensor_from_slice("b", [1, 1, 8, 1], &b)?;
    engine.set_tensor_from_slice("dst", [1, 1, 8, 1], &[0.0f32; 8])?;
    engine.add_broadcast("a", "b", "dst")?;
    assert_eq!(
        engine.get_tensor_vec::<f32>("dst", [1, 1, 8, 1])?,
        vec![11.0, 22.0, 33.0, 44.0, 55.0, 66.0, 77.0, 88.0]
    );
    Ok(())
}

#[test]
fn test_add_scalar_broadcast() -> Result<(), Box<dyn std::error::Error>> {
    let mut engine = engine()?;
    let a = random_vec(8);
    engine.set_tensor_from_slice("A", [1, 1, 8, 1], &a)?;
    engine.set_tensor_from_slice("S", [1, 1, 1, 1], &[2.5f32])?;
    engine.set_tensor_from_slice("D", [1, 1, 8, 1], &[0.0f32; 8])?;

    engine.add_broadcast("A", "S", "D")?;

    let d = engine.get_tensor_vec::<f32>("D", [1, 1, 8, 1])?;
    for (x, y) in d.iter().zip(a.iter()) {
        assert_relative_eq!(*x, *y + 2.5);
    }
    Ok(())
}

#[test]
fn test_add_divisible_broadcast_tiles() -> Result<(), Box<dyn std::error::Error>> {
    let mut engine = engine()?;
    engine.set_tensor_from_slice("A", [1, 1, 8, 1], &[0.0f32; 8])?;
    engine.set_tensor_from_slice("B", [1, 1, 4, 1], &[1.0f32, 2.0, 3.0, 4.0])?;
    engine.set_tensor_from_slice("D", [1, 1, 8, 1], &[0.0f32; 8])?;

    engine.add_broadcast("A", "B", "D")?;

    assert_eq!(
        engine.get_tensor_vec::<f32>("D", [1, 1, 8, 1])?,
        vec![1.0, 2.0, 3.0, 4.0, 1.0, 2.0, 3.0, 4.0]
    );
    Ok(())
}

#[test]
fn test_add_multi_axis_broadcast() -> Result<(), Box<dyn std::error::Error>> {
    let mut engine = engine()?;
    let a = random_vec(2 * 3 * 4 * 2);
    let b = random_vec(3 * 2);
    engine.set_tensor_from_slice("A", [2, 3, 4, 2], &a)?;
    engine.set_tensor_from_slice("B", [1, 3, 1, 2], &b)?;
    engine.set_tensor_from_slice("D", [2, 3, 4, 2], &vec![0.0f32; a.len()])?;

    engine.add_broadcast("A", "B", "D")?;

    let d = engine.get_tensor_vec::<f32>("D", [2, 3, 4, 2])?;
    for n in 0..2 {
        for c in 0..3 {
            for h in 0..4 {
                for w in 0..2 {
                    let i = ((n * 3 + c) * 4 + h) * 2 + w;
                    assert_relative_eq!(d[i], a[i] + b[c * 2 + w]);
                }
            }
        }
    }
    Ok(())
}

#[test]
fn test_add_integer_tensors() -> Result<(), Box<dyn std::error::Error>> {
    let mut engine = engine()?;
    engine.set_tensor_from_slice("a", [1, 1, 2, 2], &[1i32, -2, i32::MAX, 4])?;
    engine.set_tensor_from_slice("b", [1, 1, 1, 1], &[1i32])?;
    engine.set_tensor_from_slice("d", [1, 1, 2, 2], &[0i32; 4])?;
    engine.add_broadcast("a", "b", "d")?;
    assert_eq!(
        engine.get_tensor_vec::<i32>("d", [1, 1, 2, 2])?,
        vec![2, -1, i32::MIN, 5]
    );
    Ok(())
}

#[test]
fn test_incompatible_shapes() -> Result<(), Box<dyn std::error::Error>> {
    let mut engine = engine()?;
    engine.set_tensor_from_slice("A", [1, 1, 8, 1], &[0.0f32; 8])?;
    engine.set_tensor_from_slice("B", [1, 1, 3, 1], &[0.0f32; 3])?;
    engine.set_tensor_from_slice("D", [1, 1, 8, 1], &[0.0f32; 8])?;
    let fence = engine.fence_value();

    let res = engine.add_broadcast("A", "B", "D");
    assert_eq!(
        res,
        Err(EngineError::IncompatibleShapes {
            lhs: [1, 1, 8, 1],
            rhs: [1, 1, 3, 1]
        })
    );
    // rejected before any device work
    assert_eq!(engine.fence_value(), fence);
    assert!(!engine.is_poisoned());
    Ok(())
}

#[test]
fn test_broadcast_is_not_symmetric() -> Result<(), Box<dyn std::error::Error>> {
    let mut engine = engine()?;
    engine.set_tensor_from_slice("A", [1, 1, 8, 1], &[0.0f32; 8])?;
    engine.set_tensor_from_slice("S", [1, 1, 1, 1], &[0.0f32])?;
    assert!(matches!(
        engine.add_broadcast("S", "A", "S"),
        Err(EngineError::IncompatibleShapes { .. })
    ));
    Ok(())
}

#[test]
fn test_destination_shape_checked() -> Result<(), Box<dyn std::error::Error>> {
    let mut engine = engine()?;
    engine.set_tensor_from_slice("A", [1, 1, 8, 1], &[0.0f32; 8])?;
    engine.set_tensor_from_slice("S", [1, 1, 1, 1], &[0.0f32])?;
    assert_eq!(
        engine.add_broadcast("A", "S", "S"),
        Err(EngineError::IncompatibleShapes {
            lhs: [1, 1, 8, 1],
            rhs: [1, 1, 1, 1]
        })
    );
    Ok(())
}

#[test]
fn test_unknown_names() -> Result<(), Box<dyn std::error::Error>> {
    let mut engine = engine()?;
    engine.set_tensor_from_slice("A", [1, 1, 2, 1], &[0.0f32; 2])?;
    assert_eq!(
        engine.add_broadcast("A", "missing", "A"),
        Err(EngineError::NotFound("missing".into()))
    );
    assert_eq!(
        engine.get_tensor_vec::<f32>("missing", [1, 1, 2, 1]),
        Err(EngineError::NotFound("missing".into()))
    );
    Ok(())
}

#[test]
fn test_set_get_round_trip() -> Result<(), Box<dyn std::error::Error>> {
    let mut engine = engine()?;
    let bytes: Vec<u8> = (0..64).map(|i| (i * 7 % 251) as u8).collect();
    engine.set_tensor("t", [1, 2, 2, 4], DataType::UInt32, &bytes)?;

    let mut out = vec![0u8; 64];
    engine.get_tensor("t", [1, 2, 2, 4], DataType::UInt32, &mut out)?;
    assert_eq!(out, bytes);
    Ok(())
}

#[test]
fn test_large_round_trip() -> Result<(), Box<dyn std::error::Error>> {
    let mut engine = engine()?;
    let data: Vec<f32> = (0..1024).map(|i| i as f32 * 0.5).collect();
    engine.set_tensor_from_slice("big", [1, 1, 1024, 1], &data)?;
    let out = engine.get_tensor_vec::<f32>("big", [1, 1, 1024, 1])?;
    assert_eq!(out, data);
    Ok(())
}

#[test]
fn test_rewrite_same_size() -> Result<(), Box<dyn std::error::Error>> {
    let mut engine = engine()?;
    engine.set_tensor_from_slice("t", [1, 1, 4, 1], &[1.0f32; 4])?;
    let allocated = engine.allocated_bytes();
    engine.set_tensor_from_slice("t", [1, 1, 4, 1], &[2.0f32, 3.0, 4.0, 5.0])?;
    // buffers are reused
    assert_eq!(engine.allocated_bytes(), allocated);
    assert_eq!(
        engine.get_tensor_vec::<f32>("t", [1, 1, 4, 1])?,
        vec![2.0, 3.0, 4.0, 5.0]
    );
    Ok(())
}

#[test]
fn test_rewrite_different_size() -> Result<(), Box<dyn std::error::Error>> {
    let mut engine = engine()?;
    engine.set_tensor_from_slice("t", [1, 1, 4, 1], &[1.0f32, 2.0, 3.0, 4.0])?;
    let res = engine.set_tensor_from_slice("t", [1, 1, 8, 1], &[9.0f32; 8]);
    assert_eq!(
        res,
        Err(EngineError::ShapeMismatch {
            name: "t".into(),
            expected: 16,
            actual: 32
        })
    );
    assert!(!engine.is_poisoned());
    assert_eq!(
        engine.get_tensor_vec::<f32>("t", [1, 1, 4, 1])?,
        vec![1.0, 2.0, 3.0, 4.0]
    );
    Ok(())
}

#[test]
fn test_oversized_shapes() -> Result<(), Box<dyn std::error::Error>> {
    let mut engine = engine()?;

    // the shape is representable, the payload is simply too short
    assert_eq!(
        engine.set_tensor("x", [65536, 65536, 1, 1], DataType::Float32, &[0u8; 16]),
        Err(EngineError::ShapeMismatch {
            name: "x".into(),
            expected: 1 << 34,
            actual: 16
        })
    );

    let res = engine.set_tensor("y", [u32::MAX; 4], DataType::Float32, &[0u8; 16]);
    assert!(matches!(
        res,
        Err(EngineError::InvalidShape(ShapeError::TooLarge { .. }))
    ));
    assert!(!engine.contains("x"));
    assert!(!engine.contains("y"));
    assert!(!engine.is_poisoned());

    // a huge requested shape is rejected before anything is allocated
    engine.set_tensor_from_slice("z", [1, 1, 2, 1], &[1.0f32, 2.0])?;
    assert!(matches!(
        engine.get_tensor_vec::<f32>("z", [65536, 65536, 1, 1]),
        Err(EngineError::DescriptorMismatch { .. })
    ));
    assert!(matches!(
        engine.get_tensor_vec::<f32>("z", [u32::MAX; 4]),
        Err(EngineError::InvalidShape(ShapeError::TooLarge { .. }))
    ));
    assert_eq!(engine.get_tensor_vec::<f32>("z", [1, 1, 2, 1])?, vec![1.0, 2.0]);
    Ok(())
}

#[test]
fn test_add_in_place() -> Result<(), Box<dyn std::error::Error>> {
    let mut engine = engine()?;
    engine.set_tensor_from_slice("a", [1, 1, 4, 1], &[1.0f32, 2.0, 3.0, 4.0])?;
    engine.set_tensor_from_slice("one", [1, 1, 1, 1], &[1.0f32])?;

    engine.add_broadcast("a", "one", "a")?;
    assert_eq!(
        engine.get_tensor_vec::<f32>("a", [1, 1, 4, 1])?,
        vec![2.0, 3.0, 4.0, 5.0]
    );

    // both operands and the destination are the same tensor
    engine.add_broadcast("a", "a", "a")?;
    assert_eq!(
        engine.get_tensor_vec::<f32>("a", [1, 1, 4, 1])?,
        vec![4.0, 6.0, 8.0, 10.0]
    );
    assert!(!engine.is_poisoned());
    Ok(())
}

#[test]
fn test_add_after_read() -> Result<(), Box<dyn std::error::Error>> {
    let mut engine = engine()?;
    engine.set_tensor_from_slice("a", [1, 1, 2, 1], &[1.0f32, 2.0])?;
    engine.set_tensor_from_slice("d", [1, 1, 2, 1], &[0.0f32; 2])?;
    engine.add_broadcast("a", "a", "d")?;
    assert_eq!(engine.get_tensor_vec::<f32>("d", [1, 1, 2, 1])?, vec![2.0, 4.0]);

    // d was read back and is used again as a destination and an operand
    engine.add_broadcast("d", "a", "d")?;
    assert_eq!(engine.get_tensor_vec::<f32>("d", [1, 1, 2, 1])?, vec![3.0, 6.0]);
    Ok(())
}

#[test]
fn test_fence_increases() -> Result<(), Box<dyn std::error::Error>> {
    let mut engine = engine()?;
    assert_eq!(engine.fence_value(), 0);
    engine.set_tensor_from_slice("a", [1, 1, 1, 1], &[1.0f32])?;
    engine.get_tensor_vec::<f32>("a", [1, 1, 1, 1])?;
    let after_read = engine.fence_value();
    assert_eq!(after_read, 1);

    // initializer and operator are separate submissions
    engine.add_broadcast("a", "a", "a")?;
    assert_eq!(engine.fence_value(), after_read + 2);
    Ok(())
}

#[test]
fn test_scratch_resources_released() -> Result<(), Box<dyn std::error::Error>> {
    let mut engine = engine()?;
    engine.set_tensor_from_slice("A", [1, 1, 8, 1], &[0.0f32; 8])?;
    engine.set_tensor_from_slice("S", [1, 1, 1, 1], &[1.0f32])?;
    let allocated = engine.allocated_bytes();
    engine.add_broadcast("A", "S", "A")?;
    assert_eq!(engine.allocated_bytes(), allocated);
    Ok(())
}

#[test]
fn test_release_tensor() -> Result<(), Box<dyn std::error::Error>> {
    let mut engine = engine()?;
    engine.set_tensor_from_slice("a", [1, 1, 2, 1], &[1.0f32; 2])?;
    engine.set_tensor_from_slice("b", [1, 1, 2, 1], &[1.0f32; 2])?;
    engine.release_tensor("a")?;
    assert!(!engine.contains("a"));
    assert_eq!(engine.tensor_names(), vec!["b"]);
    assert_eq!(
        engine.release_tensor("a"),
        Err(EngineError::NotFound("a".into()))
    );
    assert_eq!(engine.get_tensor_vec::<f32>("b", [1, 1, 2, 1])?, vec![1.0; 2]);
    Ok(())
}

#[test]
fn test_release_all() -> Result<(), Box<dyn std::error::Error>> {
    let mut engine = engine()?;
    engine.set_tensor_from_slice("a", [1, 1, 2, 1], &[1.0f32; 2])?;
    engine.set_tensor_from_slice("d", [1, 1, 2, 1], &[1.0f32; 2])?;
    engine.release_all()?;
    assert_eq!(engine.allocated_bytes(), 0);

    assert_eq!(
        engine.get_tensor_vec::<f32>("a", [1, 1, 2, 1]),
        Err(EngineError::NotFound("a".into()))
    );
    assert_eq!(
        engine.add_broadcast("a", "a", "d"),
        Err(EngineError::NotFound("a".into()))
    );
    assert!(engine.tensor_desc("d").is_err());

    // names can be reused afterwards
    engine.set_tensor_from_slice("a", [1, 1, 1, 1], &[7.0f32])?;
    assert_eq!(engine.get_tensor_vec::<f32>("a", [1, 1, 1, 1])?, vec![7.0]);
    Ok(())
}

#[test]
fn test_tensor_desc() -> Result<(), Box<dyn std::error::Error>> {
    let mut engine = engine()?;
    engine.set_tensor_from_slice("a", [1, 1, 3, 1], &[1u32, 2, 3])?;
    let desc = engine.tensor_desc("a")?;
    assert_eq!(desc.data_type, DataType::UInt32);
    assert_eq!(desc.sizes, [1, 1, 3, 1]);
    assert_eq!(desc.packed_size_in_bytes(), 12);
    assert_eq!(engine.device_kind(), DeviceKind::Host);
    Ok(())
}

/// A host device whose submissions fail once `fail` is set.
struct FaultyDevice {
    inner: HostDevice,
    fail: Arc<AtomicBool>,
}

impl ComputeDevice for FaultyDevice {
    fn kind(&self) -> DeviceKind {
        self.inner.kind()
    }

    fn adapter(&self) -> &AdapterInfo {
        self.inner.adapter()
    }

    fn supports_data_type(&self, data_type: DataType) -> bool {
        self.inner.supports_data_type(data_type)
    }

    fn create_buffer(
        &mut self,
        heap: HeapKind,
        size: u64,
        initial_state: ResourceState,
    ) -> Result<BufferHandle, DeviceError> {
        self.inner.create_buffer(heap, size, initial_state)
    }

    fn release_buffer(&mut self, buffer: BufferHandle) {
        self.inner.release_buffer(buffer)
    }

    fn buffer_size(&self, buffer: BufferHandle) -> Result<u64, DeviceError> {
        self.inner.buffer_size(buffer)
    }

    fn write_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<(), DeviceError> {
        self.inner.write_buffer(buffer, offset, data)
    }

    fn read_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: u64,
        out: &mut [u8],
    ) -> Result<(), DeviceError> {
        self.inner.read_buffer(buffer, offset, out)
    }

    fn create_descriptor_heap(
        &mut self,
        count: u32,
    ) -> Result<DescriptorHeapHandle, DeviceError> {
        self.inner.create_descriptor_heap(count)
    }

    fn release_descriptor_heap(&mut self, heap: DescriptorHeapHandle) {
        self.inner.release_descriptor_heap(heap)
    }

    fn compile_operator(
        &mut self,
        graph: &OperatorGraph,
        flags: ExecutionFlags,
    ) -> Result<DispatchableHandle, DeviceError> {
        self.inner.compile_operator(graph, flags)
    }

    fn create_initializer(
        &mut self,
        operators: &[DispatchableHandle],
    ) -> Result<DispatchableHandle, DeviceError> {
        self.inner.create_initializer(operators)
    }

    fn binding_properties(
        &self,
        dispatchable: DispatchableHandle,
    ) -> Result<BindingProperties, DeviceError> {
        self.inner.binding_properties(dispatchable)
    }

    fn release_dispatchable(&mut self, dispatchable: DispatchableHandle) {
        self.inner.release_dispatchable(dispatchable)
    }

    fn execute(&mut self, commands: &[Command]) -> Result<(), DeviceError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(DeviceError::Lost("device removed".into()));
        }
        self.inner.execute(commands)
    }

    fn signal(&mut self, value: u64) -> Result<(), DeviceError> {
        self.inner.signal(value)
    }

    fn wait(&mut self, value: u64) -> Result<(), DeviceError> {
        self.inner.wait(value)
    }

    fn completed_value(&self) -> u64 {
        self.inner.completed_value()
    }

    fn allocated_bytes(&self) -> u64 {
        self.inner.allocated_bytes()
    }
}

#[test]
fn test_device_error_poisons_engine() -> Result<(), Box<dyn std::error::Error>> {
    let fail = Arc::new(AtomicBool::new(false));
    let device = FaultyDevice {
        inner: HostDevice::new(false),
        fail: fail.clone(),
    };
    let mut engine = Engine::with_device(Box::new(device), EngineConfig::default());

    engine.set_tensor_from_slice("a", [1, 1, 2, 1], &[1.0f32, 2.0])?;
    assert_eq!(engine.get_tensor_vec::<f32>("a", [1, 1, 2, 1])?, vec![1.0, 2.0]);

    fail.store(true, Ordering::SeqCst);
    let res = engine.add_broadcast("a", "a", "a");
    assert!(matches!(res, Err(EngineError::Device(DeviceError::Lost(_)))));
    assert!(res.is_err_and(|e| e.is_fatal()));
    assert!(engine.is_poisoned());

    // even once the device recovers
    fail.store(false, Ordering::SeqCst);
    assert_eq!(
        engine.get_tensor_vec::<f32>("a", [1, 1, 2, 1]),
        Err(EngineError::Poisoned)
    );
    assert_eq!(
        engine.set_tensor_from_slice("b", [1, 1, 1, 1], &[0.0f32]),
        Err(EngineError::Poisoned)
    );
    assert_eq!(engine.release_all(), Err(EngineError::Poisoned));
    Ok(())
}

#![cfg(feature = "wgpu")]

use accel_runtime::{
    BackendKind, DeviceKind, DeviceProvider, Engine, EngineConfig, EngineError, WgpuProvider,
};
use approx::assert_relative_eq;
use rand::Rng;

// machines without a GPU adapter skip these tests
fn gpu_engine() -> Result<Option<Engine>, EngineError> {
    let _ = env_logger::builder().is_test(true).try_init();
    if WgpuProvider::new().enumerate_adapters()?.is_empty() {
        return Ok(None);
    }
    match Engine::new(EngineConfig::default().with_backend(BackendKind::Wgpu)) {
        Ok(engine) => Ok(Some(engine)),
        Err(EngineError::DeviceAcquisition(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

#[test]
fn test_wgpu_device_kind() -> Result<(), Box<dyn std::error::Error>> {
    let Some(engine) = gpu_engine()? else {
        return Ok(());
    };
    assert!(matches!(engine.device_kind(), DeviceKind::Wgpu { .. }));
    assert!(engine.adapter().attributes.core_compute);
    Ok(())
}

#[test]
fn test_wgpu_round_trip() -> Result<(), Box<dyn std::error::Error>> {
    let Some(mut engine) = gpu_engine()? else {
        return Ok(());
    };
    let data: Vec<f32> = (0..1024).map(|i| i as f32).collect();
    engine.set_tensor_from_slice("t", [1, 1, 1024, 1], &data)?;
    assert_eq!(engine.get_tensor_vec::<f32>("t", [1, 1, 1024, 1])?, data);

    // odd byte sizes are padded on the device
    engine.set_tensor_from_slice("odd", [1, 1, 3, 1], &[1u32, 2, 3])?;
    assert_eq!(engine.get_tensor_vec::<u32>("odd", [1, 1, 3, 1])?, vec![1, 2, 3]);
    Ok(())
}

#[test]
fn test_wgpu_add_broadcast() -> Result<(), Box<dyn std::error::Error>> {
    let Some(mut engine) = gpu_engine()? else {
        return Ok(());
    };
    let mut rng = rand::rng();
    let a: Vec<f32> = (0..2 * 3 * 4 * 5).map(|_| rng.random_range(-1.0..1.0)).collect();
    let b: Vec<f32> = (0..3 * 5).map(|_| rng.random_range(-1.0..1.0)).collect();
    engine.set_tensor_from_slice("a", [2, 3, 4, 5], &a)?;
    engine.set_tensor_from_slice("b", [1, 3, 1, 5], &b)?;
    engine.set_tensor_from_slice("d", [2, 3, 4, 5], &vec![0.0f32; a.len()])?;

    engine.add_broadcast("a", "b", "d")?;

    let d = engine.get_tensor_vec::<f32>("d", [2, 3, 4, 5])?;
    for (i, x) in d.iter().enumerate() {
        let c = (i / 20) % 3;
        let w = i % 5;
        assert_relative_eq!(*x, a[i] + b[c * 5 + w], epsilon = 1e-6);
    }
    Ok(())
}

#[test]
fn test_wgpu_tiled_operand() -> Result<(), Box<dyn std::error::Error>> {
    let Some(mut engine) = gpu_engine()? else {
        return Ok(());
    };
    engine.set_tensor_from_slice("a", [1, 1, 8, 1], &[10i32; 8])?;
    engine.set_tensor_from_slice("b", [1, 1, 4, 1], &[1i32, 2, 3, 4])?;
    engine.set_tensor_from_slice("d", [1, 1, 8, 1], &[0i32; 8])?;
    engine.add_broadcast("a", "b", "d")?;
    assert_eq!(
        engine.get_tensor_vec::<i32>("d", [1, 1, 8, 1])?,
        vec![11, 12, 13, 14, 11, 12, 13, 14]
    );
    Ok(())
}

#[test]
fn test_wgpu_add_in_place() -> Result<(), Box<dyn std::error::Error>> {
    let Some(mut engine) = gpu_engine()? else {
        return Ok(());
    };
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

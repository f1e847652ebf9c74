use argh::FromArgs;

use accel::runtime::{BackendKind, Engine, EngineConfig};

#[derive(FromArgs)]
/// Add two tensors on an accelerator and check the result
struct Args {
    /// the backend to run on: host or wgpu
    #[argh(option, short = 'b', default = "BackendKind::Host")]
    backend: BackendKind,

    /// substring the adapter description must contain
    #[argh(option, short = 'a', default = "String::new()")]
    adapter: String,

    /// enable driver validation
    #[argh(switch, short = 'd')]
    debug: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: Args = argh::from_env();

    let config = EngineConfig::default()
        .with_backend(args.backend)
        .with_adapter_filter(args.adapter)
        .with_debug(args.debug);
    let mut engine = Engine::new(config)?;
    log::info!("running on {}", engine.adapter().description);

    // tile a 4 element tensor twice into an 8 element one
    let shape = [1, 1, 8, 1];
    engine.set_tensor_from_slice("A", shape, &[1.0f32; 8])?;
    engine.set_tensor_from_slice("B", [1, 1, 4, 1], &[1.0f32, 2.0, 3.0, 4.0])?;
    engine.set_tensor_from_slice("D", shape, &[0.0f32; 8])?;
    engine.add_broadcast("A", "B", "D")?;

    let d = engine.get_tensor_vec::<f32>("D", shape)?;
    println!("A + B = {d:?}");
    if d != [2.0, 3.0, 4.0, 5.0, 2.0, 3.0, 4.0, 5.0] {
        return Err("unexpected broadcast result".into());
    }

    // round trip a larger tensor
    let data: Vec<f32> = (0..1024).map(|i| i as f32).collect();
    engine.set_tensor_from_slice("big", [1, 1, 1024, 1], &data)?;
    if engine.get_tensor_vec::<f32>("big", [1, 1, 1024, 1])? != data {
        return Err("round trip mismatch".into());
    }

    // add a scalar in place
    engine.set_tensor_from_slice("one", [1, 1, 1, 1], &[1.0f32])?;
    engine.add_broadcast("big", "one", "big")?;
    let big = engine.get_tensor_vec::<f32>("big", [1, 1, 1024, 1])?;
    println!("big[0..4] + 1 = {:?}", &big[..4]);
    if big.iter().zip(data.iter()).any(|(x, y)| *x != y + 1.0) {
        return Err("unexpected scalar add result".into());
    }

    println!(
        "fence {} after {} tensors, {} bytes allocated",
        engine.fence_value(),
        engine.tensor_names().len(),
        engine.allocated_bytes()
    );
    engine.release_all()?;

    Ok(())
}

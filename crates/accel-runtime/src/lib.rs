#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]
//!
//! # Overview
//!
//! `accel-runtime` keeps named tensors resident in accelerator memory and adds them with
//! divisibility broadcasting. Work is recorded into a command list, submitted to the single
//! queue of a device and synchronized with a monotonically increasing fence.
//!
//! # Architecture
//!
//! - **ComputeDevice**: the driver seam. [`HostDevice`] runs everything in host memory;
//!   `WgpuDevice` (feature `wgpu`) runs on a GPU
//! - **ComputeContext**: the command recorder and fence of one device
//! - **TensorRegistry**: named tensors with their device and staging buffers
//! - **Pipeline**: builds and compiles the operator graph of a broadcast add
//! - **DispatchRunner**: binds resources and runs the initializer and the operator
//! - **Engine**: the facade tying the pieces together
//!
//! # Quick Start
//!
//! ```rust
//! use accel_runtime::{Engine, EngineConfig};
//!
//! let mut engine = Engine::new(EngineConfig::default())?;
//! engine.set_tensor_from_slice("a", [1, 1, 8, 1], &[1.0f32; 8])?;
//! engine.set_tensor_from_slice("b", [1, 1, 4, 1], &[1.0f32, 2.0, 3.0, 4.0])?;
//! engine.set_tensor_from_slice("c", [1, 1, 8, 1], &[0.0f32; 8])?;
//! engine.add_broadcast("a", "b", "c")?;
//!
//! let c = engine.get_tensor_vec::<f32>("c", [1, 1, 8, 1])?;
//! assert_eq!(c, vec![2.0, 3.0, 4.0, 5.0, 2.0, 3.0, 4.0, 5.0]);
//! # Ok::<(), accel_runtime::EngineError>(())
//! ```

/// Adapter discovery and selection.
pub mod adapter;

/// Engine configuration.
pub mod config;

/// Command recording and queue synchronization.
pub mod context;

/// Device abstraction and the command model.
pub mod device;

/// Binding tables and two-phase dispatch.
pub mod dispatch;

/// The engine facade.
pub mod engine;

/// Error types for the runtime.
pub mod error;

/// GPU device through wgpu.
#[cfg(feature = "wgpu")]
pub mod gpu;

/// Operator graph builder.
pub mod graph;

/// Host reference device.
pub mod host;

/// Broadcast add compilation.
pub mod pipeline;

/// Named tensor storage.
pub mod registry;

pub use crate::adapter::{select_adapter, AdapterInfo, DeviceProvider, FeatureLevel};
pub use crate::config::{BackendKind, EngineConfig};
pub use crate::context::ComputeContext;
pub use crate::device::{ComputeDevice, DeviceError, DeviceKind, ExecutionFlags};
pub use crate::engine::Engine;
pub use crate::error::EngineError;
#[cfg(feature = "wgpu")]
pub use crate::gpu::{WgpuDevice, WgpuProvider};
pub use crate::graph::{GraphError, OperatorGraph};
pub use crate::host::{HostDevice, HostProvider};
pub use crate::registry::{TensorRecord, TensorRegistry};

#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]
//!
//! # Overview
//!
//! `accel-tensor` describes tensors that live in accelerator memory. It does not own any
//! memory itself: it answers the questions every device-side operation has to ask before
//! a buffer is created or a dispatch is recorded.
//!
//! - **DataType**: the element type tag of a tensor and its byte width
//! - **TensorDesc**: a fixed rank-4 shape with derived element count, strides and buffer size
//! - **BroadcastPlan**: how a smaller operand is padded and tiled to match a larger one
//!
//! # Quick Start
//!
//! ```rust
//! use accel_tensor::{broadcast, DataType, TensorDesc};
//!
//! let lhs = TensorDesc::new(DataType::Float32, [1, 1, 8, 1]).unwrap();
//! let rhs = TensorDesc::new(DataType::Float32, [1, 1, 4, 1]).unwrap();
//!
//! assert_eq!(lhs.total_size_in_bytes(), 32);
//! assert!(broadcast::can_broadcast(&lhs.sizes, &rhs.sizes));
//!
//! let plan = broadcast::reconcile(&rhs.sizes, &lhs.sizes).unwrap();
//! assert_eq!(plan.repeats, vec![1, 1, 2, 1]);
//! ```

/// Broadcast planning between two tensor shapes.
///
/// Provides [`broadcast::can_broadcast`] and [`broadcast::reconcile`], which decide whether
/// two shapes are compatible and how the right-hand operand must be reshaped and tiled.
pub mod broadcast;

/// Tensor descriptors with a fixed rank of four.
pub mod desc;

/// Element type tags.
pub mod dtype;

/// Error types for shape validation.
pub mod error;

pub use crate::broadcast::BroadcastPlan;
pub use crate::desc::{TensorDesc, TensorShape, TENSOR_RANK};
pub use crate::dtype::{DataType, Element};
pub use crate::error::ShapeError;

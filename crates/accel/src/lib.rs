#![doc = include_str!(concat!("../", env!("CARGO_PKG_README")))]

#[doc(inline)]
pub use accel_tensor as tensor;

#[doc(inline)]
pub use accel_runtime as runtime;

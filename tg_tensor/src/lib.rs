//! # tg_tensor - shapes, broadcasting and backend abstractions
//!
//! The core abstractions are:
//! - [`Shape`] and [`Strides`] - validated shapes and row-major layout
//! - [`BroadcastPlan`] - stride-0 addressing for broadcast binary kernels
//! - [`TensorData`] - trait for backend-owned storage
//! - [`Backend`] - the kernel surface implemented by the CPU and OpenCL backends
//! - [`TensorError`] - the error type used throughout the workspace

pub mod backend;
pub mod broadcast;
pub mod error;
pub mod layout;
pub mod ops;
pub mod shape;
pub mod tensor;

pub use backend::Backend;
pub use broadcast::{effective_strides, require_same_shape, BroadcastPlan};
pub use error::{Result, TensorError};
pub use ops::{Activation, BinaryOp, Conv2dParams, ReduceOp, UnaryOp};
pub use shape::{compute_size, compute_strides, linear_index, unravel_index, Shape, Strides};
pub use tensor::TensorData;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::backend::Backend;
    pub use crate::error::{Result, TensorError};
    pub use crate::ops::{Activation, BinaryOp, Conv2dParams, ReduceOp, UnaryOp};
    pub use crate::shape::{Shape, Strides};
    pub use crate::tensor::TensorData;
}

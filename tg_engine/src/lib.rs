//! # tg_engine - tensors with reverse-mode autodiff
//!
//! The user-facing layer over the CPU and OpenCL backends:
//! - [`ComputeContext`] - owns the worker pool and the lazily created GPU backend
//! - [`Tensor`] - shared handle to storage on either device, with optional autograd state
//! - [`ComputeConfig`] - TOML-loadable settings
//!
//! GPU work that fails with a device error is retried on the CPU.
//!
//! ## Example
//!
//! ```
//! use tg_engine::prelude::*;
//!
//! # fn main() -> Result<()> {
//! let ctx = ComputeContext::cpu_only()?;
//! let x = ctx.scalar(3.0)?.with_grad();
//! let y = x.mul_grad(&x)?;
//! y.backward()?;
//! assert_eq!(x.grad().map(|g| g.item()).transpose()?, Some(6.0));
//! # Ok(())
//! # }
//! ```

pub mod autograd;
pub mod config;
pub mod context;
mod conv;
pub mod device;
pub mod ops;
mod serialize;
pub mod storage;
pub mod tensor;

pub use autograd::TensorOp;
pub use config::{ComputeConfig, KernelChoice, DEFAULT_FFT_THRESHOLD};
pub use context::ComputeContext;
pub use device::Device;
pub use ops::Operand;
pub use storage::Storage;
pub use tensor::{NodeId, Tensor};

pub use tg_tensor::{Activation, Conv2dParams, Result, Shape, TensorError};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::config::ComputeConfig;
    pub use crate::context::ComputeContext;
    pub use crate::device::Device;
    pub use crate::tensor::Tensor;
    pub use tg_tensor::{Activation, Conv2dParams, Result, Shape, TensorError};
}

//! OpenCL GPU backend for tensorgrad.
//!
//! Built with the `opencl` feature this drives a real device through
//! `opencl3`. Without it, [`GpuBackend::new`] always fails with
//! `DeviceInitialization`, and callers fall back to the CPU.

#[cfg(feature = "opencl")]
mod cl_impl;

#[cfg(feature = "opencl")]
pub use cl_impl::*;

#[cfg(not(feature = "opencl"))]
mod unavailable;

#[cfg(not(feature = "opencl"))]
pub use unavailable::*;

/// Default edge of the square matmul work-group.
pub const DEFAULT_WORK_GROUP: usize = 16;

/// Construction options for [`GpuBackend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuOptions {
    /// Tile edge of the matmul kernel, compiled into the program.
    pub work_group: usize,
}

impl Default for GpuOptions {
    fn default() -> Self {
        GpuOptions {
            work_group: DEFAULT_WORK_GROUP,
        }
    }
}

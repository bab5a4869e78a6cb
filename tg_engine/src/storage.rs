//! Tagged CPU/GPU storage and the dispatch rules shared by every operation.
//!
//! An operation on GPU storage runs on the GPU backend. If that fails with a
//! device error (initialization or kernel launch), the operands are copied to
//! the host and the operation is re-run on the CPU; the result stays on the
//! CPU. Operands on different devices always run on the CPU.

use tg_backend_cpu::CpuTensor;
use tg_backend_opencl::GpuTensor;
use tg_tensor::{Shape, TensorData};

use crate::device::Device;

#[derive(Debug)]
pub enum Storage {
    Cpu(CpuTensor),
    Gpu(GpuTensor),
}

impl Storage {
    pub fn shape(&self) -> &Shape {
        match self {
            Storage::Cpu(t) => t.shape(),
            Storage::Gpu(t) => t.shape(),
        }
    }

    pub fn device(&self) -> Device {
        match self {
            Storage::Cpu(_) => Device::Cpu,
            Storage::Gpu(_) => Device::Gpu,
        }
    }
}

impl From<CpuTensor> for Storage {
    fn from(t: CpuTensor) -> Self {
        Storage::Cpu(t)
    }
}

impl From<GpuTensor> for Storage {
    fn from(t: GpuTensor) -> Self {
        Storage::Gpu(t)
    }
}

/// Run `$body` with `$be` bound to the backend owning `$x` and `$t` to its tensor.
///
/// `$body` must not use `?`: its error decides whether the CPU retry happens.
/// The result is converted with `Into`, so annotate the binding at the call site.
macro_rules! dispatch_unary {
    ($ctx:expr, $op:expr, $x:expr, |$be:ident, $t:ident| $body:expr) => {{
        let ctx: &$crate::context::ComputeContext = $ctx;
        match $x {
            $crate::storage::Storage::Cpu($t) => {
                let $be = ctx.cpu();
                $body.map(Into::into)
            }
            $crate::storage::Storage::Gpu(device_tensor) => {
                let attempt = match ctx.gpu() {
                    Ok($be) => {
                        let $t = device_tensor;
                        $body.map(Into::into)
                    }
                    Err(e) => Err(e),
                };
                match attempt {
                    Err(e) if e.is_device_failure() => {
                        ctx.note_fallback($op, &e);
                        let host = device_tensor.to_host()?;
                        let $t = &host;
                        let $be = ctx.cpu();
                        $body.map(Into::into)
                    }
                    other => other,
                }
            }
        }
    }};
}

/// Two-operand form of [`dispatch_unary!`].
macro_rules! dispatch_binary {
    ($ctx:expr, $op:expr, ($a:expr, $b:expr), |$be:ident, $x:ident, $y:ident| $body:expr) => {{
        let ctx: &$crate::context::ComputeContext = $ctx;
        match ($a, $b) {
            ($crate::storage::Storage::Cpu($x), $crate::storage::Storage::Cpu($y)) => {
                let $be = ctx.cpu();
                $body.map(Into::into)
            }
            ($crate::storage::Storage::Gpu(lhs), $crate::storage::Storage::Gpu(rhs)) => {
                let attempt = match ctx.gpu() {
                    Ok($be) => {
                        let ($x, $y) = (lhs, rhs);
                        $body.map(Into::into)
                    }
                    Err(e) => Err(e),
                };
                match attempt {
                    Err(e) if e.is_device_failure() => {
                        ctx.note_fallback($op, &e);
                        let (lhs, rhs) = (lhs.to_host()?, rhs.to_host()?);
                        let ($x, $y) = (&lhs, &rhs);
                        let $be = ctx.cpu();
                        $body.map(Into::into)
                    }
                    other => other,
                }
            }
            (lhs, rhs) => {
                let (lhs, rhs) = (ctx.host(lhs)?, ctx.host(rhs)?);
                let ($x, $y) = (&*lhs, &*rhs);
                let $be = ctx.cpu();
                $body.map(Into::into)
            }
        }
    }};
}

pub(crate) use dispatch_binary;
pub(crate) use dispatch_unary;

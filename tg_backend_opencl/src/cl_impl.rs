//! OpenCL backend implementation.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::mem::size_of;
use std::ops::Range;
use std::ptr;
use std::sync::{Arc, Mutex, PoisonError};

use opencl3::command_queue::CommandQueue;
use opencl3::context::Context;
use opencl3::device::{get_all_devices, Device, CL_DEVICE_TYPE_GPU};
use opencl3::kernel::{ExecuteKernel, Kernel};
use opencl3::memory::{Buffer, CL_MEM_READ_WRITE};
use opencl3::program::Program;
use opencl3::types::{cl_float, cl_int, CL_BLOCKING};
use tracing::{debug, info};

use tg_backend_cpu::CpuTensor;
use tg_tensor::layout::{self, ConvSame};
use tg_tensor::prelude::*;
use tg_tensor::BroadcastPlan;

use crate::GpuOptions;

const PROGRAM_SOURCE: &str = include_str!("kernels.cl");

/// Highest rank the index-walking kernels accept.
const MAX_DIMS: usize = 8;
const REDUCE_LOCAL: usize = 64;
const REDUCE_GROUPS: usize = 64;

/// Kernel integer argument. Sizes past `cl_int` fail so the caller falls back to the CPU.
fn int(v: usize) -> Result<cl_int> {
    cl_int::try_from(v)
        .map_err(|_| TensorError::native("kernel argument", format!("{v} exceeds cl_int range")))
}

fn ints(v: &[usize]) -> Result<Vec<cl_int>> {
    v.iter().map(|&x| int(x)).collect()
}

fn round_up(n: usize, multiple: usize) -> usize {
    n.div_ceil(multiple) * multiple
}

fn init_error(stage: &str, e: impl fmt::Display) -> TensorError {
    TensorError::DeviceInitialization(format!("{stage}: {e}"))
}

fn check_rank(kernel: &'static str, shape: &Shape) -> Result<()> {
    if shape.ndim() > MAX_DIMS {
        return Err(TensorError::native(
            kernel,
            format!("rank {} exceeds the device limit of {MAX_DIMS}", shape.ndim()),
        ));
    }
    Ok(())
}

/// Device, context, in-order queue and compiled program shared by every tensor.
pub struct GpuContext {
    device_name: String,
    work_group: usize,
    context: Context,
    queue: CommandQueue,
    program: Program,
    kernels: Mutex<HashMap<&'static str, Kernel>>,
}

// SAFETY: OpenCL context, queue, program and memory objects are thread-safe
// handles; kernel argument setting is serialized by the `kernels` mutex.
unsafe impl Send for GpuContext {}
unsafe impl Sync for GpuContext {}

impl fmt::Debug for GpuContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuContext")
            .field("device", &self.device_name)
            .field("work_group", &self.work_group)
            .finish()
    }
}

impl GpuContext {
    /// Pick the first GPU device and compile the kernel program for it.
    pub fn new(options: GpuOptions) -> Result<Self> {
        let ids =
            get_all_devices(CL_DEVICE_TYPE_GPU).map_err(|e| init_error("enumerate devices", e))?;
        let id = *ids
            .first()
            .ok_or_else(|| TensorError::DeviceInitialization("no OpenCL GPU device found".into()))?;
        let device = Device::new(id);
        let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());

        let context = Context::from_device(&device).map_err(|e| init_error("create context", e))?;
        #[allow(deprecated)]
        let queue = CommandQueue::create_default(&context, 0)
            .map_err(|e| init_error("create command queue", e))?;

        let build_options = format!("-D TILE={} -D MAX_DIMS={MAX_DIMS}", options.work_group);
        let program =
            Program::create_and_build_from_source(&context, PROGRAM_SOURCE, &build_options)
                .map_err(|log| init_error("build program", log))?;

        info!(device = %device_name, work_group = options.work_group, "opencl context ready");
        Ok(GpuContext {
            device_name,
            work_group: options.work_group,
            context,
            queue,
            program,
            kernels: Mutex::new(HashMap::new()),
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    fn alloc<T>(&self, len: usize) -> Result<Buffer<T>> {
        // SAFETY: no host pointer is supplied; the device owns the allocation.
        unsafe {
            Buffer::<T>::create(&self.context, CL_MEM_READ_WRITE, len.max(1), ptr::null_mut())
        }
        .map_err(|e| TensorError::native("alloc", e))
    }

    fn write<T>(&self, data: &[T]) -> Result<Buffer<T>> {
        let mut buffer = self.alloc::<T>(data.len())?;
        // SAFETY: blocking write of `data.len()` elements into a buffer of that length.
        unsafe { self.queue.enqueue_write_buffer(&mut buffer, CL_BLOCKING, 0, data, &[]) }
            .map_err(|e| TensorError::native("write", e))?;
        Ok(buffer)
    }

    fn read(&self, buffer: &Buffer<cl_float>, offset: usize, out: &mut [f32]) -> Result<()> {
        // SAFETY: blocking read; callers keep `offset + out.len()` within the buffer.
        unsafe {
            self.queue
                .enqueue_read_buffer(buffer, CL_BLOCKING, offset * size_of::<f32>(), out, &[])
        }
        .map_err(|e| TensorError::native("read", e))?;
        Ok(())
    }

    /// Enqueue kernel `name` over `global` and block until it finishes.
    fn launch<F>(
        &self,
        name: &'static str,
        global: &[usize],
        local: Option<&[usize]>,
        bind: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut ExecuteKernel) -> Result<()>,
    {
        let mut kernels = self.kernels.lock().unwrap_or_else(PoisonError::into_inner);
        let kernel = match kernels.entry(name) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let kernel = Kernel::create(&self.program, name)
                    .map_err(|e| TensorError::native(name, e))?;
                entry.insert(kernel)
            }
        };

        let mut exec = ExecuteKernel::new(kernel);
        bind(&mut exec)?;
        exec.set_global_work_sizes(global);
        if let Some(local) = local {
            exec.set_local_work_sizes(local);
        }
        // SAFETY: every buffer argument outlives the blocking `finish` below.
        unsafe { exec.enqueue_nd_range(&self.queue) }.map_err(|e| TensorError::native(name, e))?;
        self.queue.finish().map_err(|e| TensorError::native(name, e))
    }

    fn wrap(self: &Arc<Self>, data: Buffer<cl_float>, shape: Shape) -> Result<GpuTensor> {
        let strides = shape.strides();
        let dims = self.write(&ints(shape.dims())?)?;
        let steps = self.write(&ints(strides.as_slice())?)?;
        Ok(GpuTensor {
            data: Some(data),
            dims: Some(dims),
            steps: Some(steps),
            shape,
            strides,
            ctx: Arc::clone(self),
        })
    }
}

/// A tensor resident in device memory.
///
/// Owns a data buffer plus shape and stride buffers. Dropping the tensor
/// frees them; [`GpuTensor::release`] frees them early.
pub struct GpuTensor {
    data: Option<Buffer<cl_float>>,
    dims: Option<Buffer<cl_int>>,
    steps: Option<Buffer<cl_int>>,
    shape: Shape,
    strides: Strides,
    ctx: Arc<GpuContext>,
}

// SAFETY: memory objects are reference-counted OpenCL handles, valid from any thread.
unsafe impl Send for GpuTensor {}
unsafe impl Sync for GpuTensor {}

impl fmt::Debug for GpuTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuTensor")
            .field("shape", &self.shape)
            .field("released", &self.is_released())
            .finish()
    }
}

impl GpuTensor {
    fn data(&self) -> Result<&Buffer<cl_float>> {
        self.data.as_ref().ok_or(TensorError::Released)
    }

    fn dims(&self) -> Result<&Buffer<cl_int>> {
        self.dims.as_ref().ok_or(TensorError::Released)
    }

    fn steps(&self) -> Result<&Buffer<cl_int>> {
        self.steps.as_ref().ok_or(TensorError::Released)
    }

    /// Blocking copy into host memory.
    pub fn to_host(&self) -> Result<CpuTensor> {
        let mut out = vec![0.0f32; self.shape.numel()];
        self.ctx.read(self.data()?, 0, &mut out)?;
        CpuTensor::new(out, self.shape.clone())
    }

    /// Free the device buffers now. Later calls do nothing.
    pub fn release(&mut self) {
        let held = self.data.take().is_some();
        self.dims = None;
        self.steps = None;
        if held {
            debug!(shape = %self.shape, "released device buffers");
        }
    }

    pub fn is_released(&self) -> bool {
        self.data.is_none()
    }
}

impl TensorData for GpuTensor {
    fn shape(&self) -> &Shape {
        &self.shape
    }

    fn strides(&self) -> &Strides {
        &self.strides
    }
}

/// OpenCL backend. Cheap to clone; clones share one [`GpuContext`].
#[derive(Clone, Debug)]
pub struct GpuBackend {
    ctx: Arc<GpuContext>,
}

impl GpuBackend {
    pub fn new(options: GpuOptions) -> Result<Self> {
        Ok(GpuBackend {
            ctx: Arc::new(GpuContext::new(options)?),
        })
    }

    pub fn device_name(&self) -> &str {
        self.ctx.device_name()
    }

    /// Deep copy of a host tensor into a new device buffer.
    pub fn upload(&self, x: &CpuTensor) -> Result<GpuTensor> {
        let data = self.ctx.write(x.as_slice())?;
        self.ctx.wrap(data, x.shape().clone())
    }

    fn has_zero(&self, x: &Buffer<cl_float>, n: usize) -> Result<bool> {
        let flag = self.ctx.write(&[0 as cl_int])?;
        self.ctx.launch("flag_zero", &[n], None, |k| unsafe {
            k.set_arg(x).set_arg(&flag).set_arg(&int(n)?);
            Ok(())
        })?;
        let mut host = [0 as cl_int];
        // SAFETY: blocking read of the single flag element.
        unsafe { self.ctx.queue.enqueue_read_buffer(&flag, CL_BLOCKING, 0, &mut host, &[]) }
            .map_err(|e| TensorError::native("flag_zero", e))?;
        Ok(host[0] != 0)
    }

    fn check_divisor(&self, op: BinaryOp, b: &GpuTensor) -> Result<()> {
        if op == BinaryOp::Div && self.has_zero(b.data()?, b.shape.numel())? {
            return Err(TensorError::DivisionByZero { op: "div" });
        }
        Ok(())
    }

    fn matmul_once(
        &self,
        kernel: &'static str,
        (a, b, c): (&Buffer<cl_float>, &Buffer<cl_float>, &Buffer<cl_float>),
        (m, k, n): (usize, usize, usize),
        batch: usize,
    ) -> Result<()> {
        let tile = self.ctx.work_group;
        let (global, local) = if kernel == "matmul_tiled" {
            ([round_up(n, tile), round_up(m, tile)], Some([tile, tile]))
        } else {
            ([n, m], None)
        };
        self.ctx.launch(kernel, &global, local.as_ref().map(|l| &l[..]), |exec| unsafe {
            exec.set_arg(a)
                .set_arg(b)
                .set_arg(c)
                .set_arg(&int(m)?)
                .set_arg(&int(k)?)
                .set_arg(&int(n)?)
                .set_arg(&int(batch * m * k)?)
                .set_arg(&int(batch * k * n)?)
                .set_arg(&int(batch * m * n)?);
            Ok(())
        })
    }
}

impl Backend for GpuBackend {
    type Tensor = GpuTensor;

    fn name(&self) -> &'static str {
        "opencl"
    }

    // === Creation and access ===

    fn from_vec(&self, data: Vec<f32>, shape: Shape) -> Result<GpuTensor> {
        if data.len() != shape.numel() {
            return Err(TensorError::DataLength {
                expected: shape.numel(),
                actual: data.len(),
                shape,
            });
        }
        let buffer = self.ctx.write(&data)?;
        self.ctx.wrap(buffer, shape)
    }

    fn full(&self, shape: &Shape, value: f32) -> Result<GpuTensor> {
        let n = shape.numel();
        let out = self.ctx.alloc::<cl_float>(n)?;
        self.ctx.launch("fill", &[n], None, |k| unsafe {
            k.set_arg(&out).set_arg(&value).set_arg(&int(n)?);
            Ok(())
        })?;
        self.ctx.wrap(out, shape.clone())
    }

    fn to_vec(&self, x: &GpuTensor) -> Result<Vec<f32>> {
        Ok(x.to_host()?.into_vec())
    }

    fn read_at(&self, x: &GpuTensor, linear: usize) -> Result<f32> {
        if linear >= x.shape.numel() {
            return Err(TensorError::IndexOutOfBounds {
                index: vec![linear],
                shape: x.shape.clone(),
            });
        }
        let mut value = [0.0f32];
        self.ctx.read(x.data()?, linear, &mut value)?;
        Ok(value[0])
    }

    fn write_at(&self, x: &mut GpuTensor, linear: usize, value: f32) -> Result<()> {
        if linear >= x.shape.numel() {
            return Err(TensorError::IndexOutOfBounds {
                index: vec![linear],
                shape: x.shape.clone(),
            });
        }
        let buffer = x.data.as_mut().ok_or(TensorError::Released)?;
        // SAFETY: blocking single-element write inside the bounds checked above.
        unsafe {
            self.ctx.queue.enqueue_write_buffer(
                buffer,
                CL_BLOCKING,
                linear * size_of::<f32>(),
                &[value],
                &[],
            )
        }
        .map_err(|e| TensorError::native("write", e))?;
        Ok(())
    }

    fn copy(&self, x: &GpuTensor) -> Result<GpuTensor> {
        let n = x.shape.numel();
        let mut out = self.ctx.alloc::<cl_float>(n)?;
        // SAFETY: both buffers hold exactly `n` floats.
        unsafe {
            self.ctx
                .queue
                .enqueue_copy_buffer(x.data()?, &mut out, 0, 0, n * size_of::<f32>(), &[])
        }
        .map_err(|e| TensorError::native("copy", e))?;
        self.ctx.queue.finish().map_err(|e| TensorError::native("copy", e))?;
        self.ctx.wrap(out, x.shape.clone())
    }

    // === Elementwise ===

    fn unary(&self, op: UnaryOp, x: &GpuTensor) -> Result<GpuTensor> {
        let n = x.shape.numel();
        let (code, param) = op.code();
        let input = x.data()?;
        let out = self.ctx.alloc::<cl_float>(n)?;
        self.ctx.launch("unary_map", &[n], None, |k| unsafe {
            k.set_arg(input)
                .set_arg(&out)
                .set_arg(&code)
                .set_arg(&param)
                .set_arg(&int(n)?);
            Ok(())
        })?;
        self.ctx.wrap(out, x.shape.clone())
    }

    fn binary(&self, op: BinaryOp, a: &GpuTensor, b: &GpuTensor) -> Result<GpuTensor> {
        let plan = BroadcastPlan::new(op.name(), &a.shape, &b.shape)?;
        self.check_divisor(op, b)?;
        let (lhs, rhs) = (a.data()?, b.data()?);
        let n = plan.shape().numel();
        let out = self.ctx.alloc::<cl_float>(n)?;

        if plan.is_trivial() {
            self.ctx.launch("binary_same", &[n], None, |k| unsafe {
                k.set_arg(lhs)
                    .set_arg(rhs)
                    .set_arg(&out)
                    .set_arg(&op.code())
                    .set_arg(&int(n)?);
                Ok(())
            })?;
        } else {
            check_rank("binary_bcast", plan.shape())?;
            let out_dims = self.ctx.write(&ints(plan.shape().dims())?)?;
            let a_steps = self.ctx.write(&ints(plan.lhs_strides())?)?;
            let b_steps = self.ctx.write(&ints(plan.rhs_strides())?)?;
            let rank = int(plan.shape().ndim())?;
            self.ctx.launch("binary_bcast", &[n], None, |k| unsafe {
                k.set_arg(lhs)
                    .set_arg(rhs)
                    .set_arg(&out)
                    .set_arg(&out_dims)
                    .set_arg(&a_steps)
                    .set_arg(&b_steps)
                    .set_arg(&rank)
                    .set_arg(&op.code())
                    .set_arg(&int(n)?);
                Ok(())
            })?;
        }
        self.ctx.wrap(out, plan.shape().clone())
    }

    fn binary_scalar(&self, op: BinaryOp, a: &GpuTensor, scalar: f32) -> Result<GpuTensor> {
        if op == BinaryOp::Div && scalar == 0.0 {
            return Err(TensorError::DivisionByZero { op: "div" });
        }
        let n = a.shape.numel();
        let input = a.data()?;
        let out = self.ctx.alloc::<cl_float>(n)?;
        self.ctx.launch("binary_scalar", &[n], None, |k| unsafe {
            k.set_arg(input)
                .set_arg(&out)
                .set_arg(&scalar)
                .set_arg(&op.code())
                .set_arg(&int(n)?);
            Ok(())
        })?;
        self.ctx.wrap(out, a.shape.clone())
    }

    // === Reductions ===

    fn reduce(&self, op: ReduceOp, x: &GpuTensor) -> Result<f32> {
        let n = x.shape.numel();
        let input = x.data()?;
        let partial = self.ctx.alloc::<cl_float>(REDUCE_GROUPS)?;
        self.ctx.launch(
            "reduce_partial",
            &[REDUCE_GROUPS * REDUCE_LOCAL],
            Some(&[REDUCE_LOCAL]),
            |k| unsafe {
                k.set_arg(input)
                    .set_arg(&partial)
                    .set_arg_local_buffer(REDUCE_LOCAL * size_of::<f32>())
                    .set_arg(&op.code())
                    .set_arg(&int(n)?);
                Ok(())
            },
        )?;

        let mut host = vec![0.0f32; REDUCE_GROUPS];
        self.ctx.read(&partial, 0, &mut host)?;
        Ok(host.into_iter().fold(op.identity(), |acc, v| op.merge(acc, v)))
    }

    fn sum_to(&self, x: &GpuTensor, shape: &Shape) -> Result<GpuTensor> {
        layout::sum_to_check(&x.shape, shape)?;
        if &x.shape == shape {
            return self.copy(x);
        }
        check_rank("sum_to", &x.shape)?;

        // Target dims aligned to the input rank; summed axes become 1.
        let lead = x.shape.ndim() - shape.ndim();
        let keep: Vec<usize> = (0..x.shape.ndim())
            .map(|d| if d < lead { 1 } else { shape.dim(d - lead) })
            .collect();
        let keep = self.ctx.write(&ints(&keep)?)?;

        let n_out = shape.numel();
        let (input, x_dims, x_steps) = (x.data()?, x.dims()?, x.steps()?);
        let rank = int(x.shape.ndim())?;
        let out = self.ctx.alloc::<cl_float>(n_out)?;
        self.ctx.launch("sum_to", &[n_out], None, |k| unsafe {
            k.set_arg(input)
                .set_arg(&out)
                .set_arg(x_dims)
                .set_arg(x_steps)
                .set_arg(&keep)
                .set_arg(&rank)
                .set_arg(&int(n_out)?);
            Ok(())
        })?;
        self.ctx.wrap(out, shape.clone())
    }

    fn softmax(&self, x: &GpuTensor) -> Result<GpuTensor> {
        let cols = x.shape.dim(x.shape.ndim() - 1);
        let rows = x.shape.numel() / cols;
        let input = x.data()?;
        let out = self.ctx.alloc::<cl_float>(x.shape.numel())?;
        self.ctx.launch("softmax_rows", &[rows], None, |k| unsafe {
            k.set_arg(input)
                .set_arg(&out)
                .set_arg(&int(rows)?)
                .set_arg(&int(cols)?);
            Ok(())
        })?;
        self.ctx.wrap(out, x.shape.clone())
    }

    // === Linear algebra ===

    fn matmul(&self, a: &GpuTensor, b: &GpuTensor) -> Result<GpuTensor> {
        let dims = layout::matmul_dims(&a.shape, &b.shape)?;
        let (lhs, rhs) = (a.data()?, b.data()?);
        let out = self.ctx.alloc::<cl_float>(dims.out.numel())?;
        let mnk = (dims.m, dims.k, dims.n);

        let mut tiled = true;
        for batch in 0..dims.batch {
            if tiled {
                match self.matmul_once("matmul_tiled", (lhs, rhs, &out), mnk, batch) {
                    Ok(()) => continue,
                    Err(e) => {
                        debug!(error = %e, "tiled matmul rejected, using simple kernel");
                        tiled = false;
                    }
                }
            }
            self.matmul_once("matmul_simple", (lhs, rhs, &out), mnk, batch)?;
        }
        self.ctx.wrap(out, dims.out)
    }

    fn transpose(&self, x: &GpuTensor) -> Result<GpuTensor> {
        let (batch, rows, cols, out_shape) = layout::transpose_dims(&x.shape)?;
        let input = x.data()?;
        let out = self.ctx.alloc::<cl_float>(x.shape.numel())?;
        for b in 0..batch {
            let off = int(b * rows * cols)?;
            self.ctx.launch("transpose2d", &[cols, rows], None, |k| unsafe {
                k.set_arg(input)
                    .set_arg(&out)
                    .set_arg(&int(rows)?)
                    .set_arg(&int(cols)?)
                    .set_arg(&off);
                Ok(())
            })?;
        }
        self.ctx.wrap(out, out_shape)
    }

    // === Shape ===

    fn reshape_in_place(&self, x: &mut GpuTensor, shape: &Shape) -> Result<()> {
        layout::reshape_check(&x.shape, shape)?;
        x.data()?;
        let strides = shape.strides();
        x.dims = Some(self.ctx.write(&ints(shape.dims())?)?);
        x.steps = Some(self.ctx.write(&ints(strides.as_slice())?)?);
        x.shape = shape.clone();
        x.strides = strides;
        Ok(())
    }

    fn slice(&self, x: &GpuTensor, ranges: &[Range<usize>]) -> Result<GpuTensor> {
        let out_shape = layout::slice_shape(&x.shape, ranges)?;
        check_rank("slice_copy", &out_shape)?;
        let starts: Vec<usize> = ranges.iter().map(|r| r.start).collect();
        let starts = self.ctx.write(&ints(&starts)?)?;
        let out_dims = self.ctx.write(&ints(out_shape.dims())?)?;

        let n = out_shape.numel();
        let (input, steps) = (x.data()?, x.steps()?);
        let rank = int(out_shape.ndim())?;
        let out = self.ctx.alloc::<cl_float>(n)?;
        self.ctx.launch("slice_copy", &[n], None, |k| unsafe {
            k.set_arg(input)
                .set_arg(&out)
                .set_arg(steps)
                .set_arg(&out_dims)
                .set_arg(&starts)
                .set_arg(&rank)
                .set_arg(&int(n)?);
            Ok(())
        })?;
        self.ctx.wrap(out, out_shape)
    }

    fn concat(&self, a: &GpuTensor, b: &GpuTensor, axis: usize) -> Result<GpuTensor> {
        let dims = layout::concat_dims(&a.shape, &b.shape, axis)?;
        let n = dims.out.numel();
        let (lhs, rhs) = (a.data()?, b.data()?);
        let out = self.ctx.alloc::<cl_float>(n)?;
        self.ctx.launch("concat", &[n], None, |k| unsafe {
            k.set_arg(lhs)
                .set_arg(rhs)
                .set_arg(&out)
                .set_arg(&int(dims.lhs_chunk)?)
                .set_arg(&int(dims.rhs_chunk)?)
                .set_arg(&int(n)?);
            Ok(())
        })?;
        self.ctx.wrap(out, dims.out)
    }

    // === Convolution ===

    fn conv_same(&self, input: &GpuTensor, kernel: &GpuTensor) -> Result<GpuTensor> {
        let geometry = layout::conv_same_dims(&input.shape, &kernel.shape)?;
        let (x, w) = (input.data()?, kernel.data()?);
        let out = self.ctx.alloc::<cl_float>(input.shape.numel())?;
        match geometry {
            ConvSame::OneD { len, k } => {
                self.ctx.launch("conv_same_1d", &[len], None, |exec| unsafe {
                    exec.set_arg(x)
                        .set_arg(w)
                        .set_arg(&out)
                        .set_arg(&int(len)?)
                        .set_arg(&int(k)?);
                    Ok(())
                })?;
            }
            ConvSame::TwoD { h, w: width, kh, kw } => {
                self.ctx.launch("conv_same_2d", &[width, h], None, |exec| unsafe {
                    exec.set_arg(x)
                        .set_arg(w)
                        .set_arg(&out)
                        .set_arg(&int(h)?)
                        .set_arg(&int(width)?)
                        .set_arg(&int(kh)?)
                        .set_arg(&int(kw)?);
                    Ok(())
                })?;
            }
        }
        self.ctx.wrap(out, input.shape.clone())
    }

    fn conv2d(
        &self,
        input: &GpuTensor,
        weight: &GpuTensor,
        bias: Option<&GpuTensor>,
        params: Conv2dParams,
    ) -> Result<GpuTensor> {
        let dims =
            layout::conv2d_dims(&input.shape, &weight.shape, bias.map(|b| &b.shape), params)?;
        let (x, w) = (input.data()?, weight.data()?);
        // Without a bias the weight buffer is bound in its place and never read.
        let (bias_buf, has_bias) = match bias {
            Some(b) => (b.data()?, 1 as cl_int),
            None => (w, 0 as cl_int),
        };

        let n = dims.out.numel();
        let out = self.ctx.alloc::<cl_float>(n)?;
        self.ctx.launch("conv2d", &[n], None, |k| unsafe {
            k.set_arg(x)
                .set_arg(w)
                .set_arg(bias_buf)
                .set_arg(&out)
                .set_arg(&has_bias)
                .set_arg(&int(dims.c)?)
                .set_arg(&int(dims.h)?)
                .set_arg(&int(dims.w)?)
                .set_arg(&int(dims.o)?)
                .set_arg(&int(dims.kh)?)
                .set_arg(&int(dims.kw)?)
                .set_arg(&int(dims.oh)?)
                .set_arg(&int(dims.ow)?)
                .set_arg(&int(params.stride)?)
                .set_arg(&int(params.padding)?)
                .set_arg(&int(n)?);
            Ok(())
        })?;
        self.ctx.wrap(out, dims.out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tg_backend_cpu::{CpuBackend, CpuOptions, MatmulKernel};

    // Tests return early on machines without an OpenCL GPU.
    fn gpu() -> Option<GpuBackend> {
        GpuBackend::new(GpuOptions::default()).ok()
    }

    fn cpu() -> CpuBackend {
        CpuBackend::new(CpuOptions {
            threads: 2,
            kernel: MatmulKernel::Naive,
            block_size: 64,
        })
        .unwrap()
    }

    fn shape(dims: &[usize]) -> Shape {
        Shape::new(dims.to_vec()).unwrap()
    }

    fn ramp(n: usize) -> Vec<f32> {
        (0..n).map(|i| ((i * 7) % 11) as f32 * 0.25 - 1.0).collect()
    }

    fn assert_close(a: &[f32], b: &[f32]) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            approx::assert_relative_eq!(*x, *y, epsilon = 1e-4, max_relative = 1e-4);
        }
    }

    #[test]
    fn test_oversized_kernel_argument_is_device_failure() {
        assert_eq!(int(7).unwrap(), 7);
        let err = int(cl_int::MAX as usize + 1).unwrap_err();
        assert!(err.is_device_failure());
        assert!(ints(&[1, usize::MAX]).is_err());
    }

    #[test]
    fn test_roundtrip_and_release() {
        let Some(gpu) = gpu() else { return };
        let mut t = gpu.from_vec(vec![1.0, 2.0, 3.0], shape(&[3])).unwrap();
        assert_eq!(gpu.to_vec(&t).unwrap(), vec![1.0, 2.0, 3.0]);
        gpu.write_at(&mut t, 1, 5.0).unwrap();
        assert_eq!(gpu.read_at(&t, 1).unwrap(), 5.0);

        t.release();
        t.release();
        assert!(t.is_released());
        assert!(matches!(gpu.to_vec(&t), Err(TensorError::Released)));
    }

    #[test]
    fn test_elementwise_matches_cpu() {
        let Some(gpu) = gpu() else { return };
        let cpu = cpu();
        let a = ramp(12);
        let b: Vec<f32> = (0..4).map(|i| i as f32 + 1.0).collect();

        let (ca, cb) = (
            cpu.from_vec(a.clone(), shape(&[3, 4])).unwrap(),
            cpu.from_vec(b.clone(), shape(&[4])).unwrap(),
        );
        let (ga, gb) = (
            gpu.from_vec(a, shape(&[3, 4])).unwrap(),
            gpu.from_vec(b, shape(&[4])).unwrap(),
        );

        for op in [BinaryOp::Add, BinaryOp::Mul, BinaryOp::Div, BinaryOp::Max] {
            let want = cpu.binary(op, &ca, &cb).unwrap();
            let got = gpu.binary(op, &ga, &gb).unwrap();
            assert_close(&gpu.to_vec(&got).unwrap(), want.as_slice());
        }
        for op in [UnaryOp::Relu, UnaryOp::Sigmoid, UnaryOp::Gelu, UnaryOp::TanhGrad] {
            let want = cpu.unary(op, &ca).unwrap();
            let got = gpu.unary(op, &ga).unwrap();
            assert_close(&gpu.to_vec(&got).unwrap(), want.as_slice());
        }
    }

    #[test]
    fn test_division_by_zero_detected_on_device() {
        let Some(gpu) = gpu() else { return };
        let a = gpu.ones(&shape(&[4])).unwrap();
        let z = gpu.from_vec(vec![1.0, 2.0, 0.0, 4.0], shape(&[4])).unwrap();
        assert!(matches!(
            gpu.binary(BinaryOp::Div, &a, &z),
            Err(TensorError::DivisionByZero { .. })
        ));
    }

    #[test]
    fn test_matmul_matches_cpu() {
        let Some(gpu) = gpu() else { return };
        let cpu = cpu();
        let (a, b) = (ramp(2 * 33 * 17), ramp(2 * 17 * 21));
        let want = cpu
            .matmul(
                &cpu.from_vec(a.clone(), shape(&[2, 33, 17])).unwrap(),
                &cpu.from_vec(b.clone(), shape(&[2, 17, 21])).unwrap(),
            )
            .unwrap();
        let got = gpu
            .matmul(
                &gpu.from_vec(a, shape(&[2, 33, 17])).unwrap(),
                &gpu.from_vec(b, shape(&[2, 17, 21])).unwrap(),
            )
            .unwrap();
        assert_eq!(got.shape().dims(), &[2, 33, 21]);
        assert_close(&gpu.to_vec(&got).unwrap(), want.as_slice());
    }

    #[test]
    fn test_reductions_and_sum_to() {
        let Some(gpu) = gpu() else { return };
        let data = ramp(1000);
        let x = gpu.from_vec(data.clone(), shape(&[10, 100])).unwrap();
        let sum: f32 = data.iter().sum();
        let max = data.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        approx::assert_relative_eq!(gpu.reduce(ReduceOp::Sum, &x).unwrap(), sum, epsilon = 1e-2);
        assert_eq!(gpu.reduce(ReduceOp::Max, &x).unwrap(), max);

        let cols = gpu.sum_to(&x, &shape(&[100])).unwrap();
        let want: Vec<f32> = (0..100).map(|c| (0..10).map(|r| data[r * 100 + c]).sum()).collect();
        assert_close(&gpu.to_vec(&cols).unwrap(), &want);
    }

    #[test]
    fn test_shape_ops_and_convolution_match_cpu() {
        let Some(gpu) = gpu() else { return };
        let cpu = cpu();
        let data = ramp(24);
        let c = cpu.from_vec(data.clone(), shape(&[2, 3, 4])).unwrap();
        let g = gpu.from_vec(data, shape(&[2, 3, 4])).unwrap();

        let want = cpu.transpose(&c).unwrap();
        assert_close(&gpu.to_vec(&gpu.transpose(&g).unwrap()).unwrap(), want.as_slice());

        let want = cpu.slice(&c, &[0..2, 1..3, 1..4]).unwrap();
        let got = gpu.slice(&g, &[0..2, 1..3, 1..4]).unwrap();
        assert_close(&gpu.to_vec(&got).unwrap(), want.as_slice());

        let want = cpu.concat(&c, &c, 1).unwrap();
        assert_close(&gpu.to_vec(&gpu.concat(&g, &g, 1).unwrap()).unwrap(), want.as_slice());

        let img = ramp(36);
        let ker = ramp(9);
        let want = cpu
            .conv_same(
                &cpu.from_vec(img.clone(), shape(&[6, 6])).unwrap(),
                &cpu.from_vec(ker.clone(), shape(&[3, 3])).unwrap(),
            )
            .unwrap();
        let got = gpu
            .conv_same(
                &gpu.from_vec(img, shape(&[6, 6])).unwrap(),
                &gpu.from_vec(ker, shape(&[3, 3])).unwrap(),
            )
            .unwrap();
        assert_close(&gpu.to_vec(&got).unwrap(), want.as_slice());
    }
}

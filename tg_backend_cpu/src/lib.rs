//! CPU backend for tensorgrad with SIMD kernels and a rayon worker pool.

use std::ops::Range;
use std::sync::Arc;

use rayon::{ThreadPool, ThreadPoolBuilder};
use tg_tensor::layout::{self, ConvSame};
use tg_tensor::prelude::*;
use tg_tensor::BroadcastPlan;

mod conv;
mod fft;
mod matmul;
pub mod simd;

pub use matmul::{MatmulKernel, DEFAULT_BLOCK_SIZE};

/// CPU tensor storage: a contiguous row-major host buffer.
#[derive(Clone, Debug, PartialEq)]
pub struct CpuTensor {
    data: Vec<f32>,
    shape: Shape,
    strides: Strides,
}

impl CpuTensor {
    /// Wrap `data`, which must hold exactly `shape.numel()` values.
    pub fn new(data: Vec<f32>, shape: Shape) -> Result<Self> {
        if data.len() != shape.numel() {
            return Err(TensorError::DataLength {
                expected: shape.numel(),
                actual: data.len(),
                shape,
            });
        }
        let strides = shape.strides();
        Ok(CpuTensor {
            data,
            shape,
            strides,
        })
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    /// Element at a multi-dimensional index.
    pub fn get(&self, indices: &[usize]) -> Result<f32> {
        let flat = self.shape.linear_index(indices)?;
        Ok(self.data[flat])
    }

    // Shape is validated by the caller, so the length always matches.
    fn from_parts(data: Vec<f32>, shape: Shape) -> Self {
        debug_assert_eq!(data.len(), shape.numel());
        let strides = shape.strides();
        CpuTensor {
            data,
            shape,
            strides,
        }
    }
}

impl TensorData for CpuTensor {
    fn shape(&self) -> &Shape {
        &self.shape
    }

    fn strides(&self) -> &Strides {
        &self.strides
    }
}

/// Construction options for [`CpuBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuOptions {
    /// Worker threads in the pool.
    pub threads: usize,
    pub kernel: MatmulKernel,
    /// Tile edge of the blocked matmul kernel.
    pub block_size: usize,
}

impl Default for CpuOptions {
    fn default() -> Self {
        CpuOptions {
            threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            kernel: MatmulKernel::detect(),
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

/// CPU backend. Owns the worker pool used for batched kernels.
#[derive(Clone)]
pub struct CpuBackend {
    pool: Arc<ThreadPool>,
    kernel: MatmulKernel,
    block_size: usize,
}

impl std::fmt::Debug for CpuBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuBackend")
            .field("threads", &self.pool.current_num_threads())
            .field("kernel", &self.kernel)
            .field("block_size", &self.block_size)
            .finish()
    }
}

impl CpuBackend {
    pub fn new(options: CpuOptions) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(options.threads.max(1))
            .thread_name(|i| format!("tg-cpu-{i}"))
            .build()
            .map_err(|e| TensorError::DeviceInitialization(format!("cpu worker pool: {e}")))?;
        tracing::debug!(
            threads = pool.current_num_threads(),
            kernel = %options.kernel,
            block_size = options.block_size,
            "cpu backend ready"
        );
        Ok(CpuBackend {
            pool: Arc::new(pool),
            kernel: options.kernel,
            block_size: options.block_size.max(1),
        })
    }

    pub fn kernel(&self) -> MatmulKernel {
        self.kernel
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    fn vectorized(&self) -> bool {
        self.kernel == MatmulKernel::Simd
    }

    /// SAME convolution through the frequency domain.
    pub fn conv_fft(&self, input: &CpuTensor, kernel: &CpuTensor) -> Result<CpuTensor> {
        let data = match layout::conv_same_dims(&input.shape, &kernel.shape)? {
            ConvSame::OneD { .. } => fft::conv_same_1d(&input.data, &kernel.data),
            ConvSame::TwoD { h, w, kh, kw } => {
                fft::conv_same_2d(&input.data, (h, w), &kernel.data, (kh, kw))
            }
        };
        Ok(CpuTensor::from_parts(data, input.shape.clone()))
    }

    fn map(&self, x: &CpuTensor, f: impl Fn(f32) -> f32) -> CpuTensor {
        let data = x.data.iter().map(|&v| f(v)).collect();
        CpuTensor::from_parts(data, x.shape.clone())
    }
}

fn check_divisor(op: BinaryOp, divisor: &[f32]) -> Result<()> {
    if op == BinaryOp::Div && divisor.iter().any(|&v| v == 0.0) {
        return Err(TensorError::DivisionByZero { op: "div" });
    }
    Ok(())
}

impl Backend for CpuBackend {
    type Tensor = CpuTensor;

    fn name(&self) -> &'static str {
        "cpu"
    }

    // === Creation and access ===

    fn from_vec(&self, data: Vec<f32>, shape: Shape) -> Result<CpuTensor> {
        CpuTensor::new(data, shape)
    }

    fn full(&self, shape: &Shape, value: f32) -> Result<CpuTensor> {
        Ok(CpuTensor::from_parts(vec![value; shape.numel()], shape.clone()))
    }

    fn to_vec(&self, x: &CpuTensor) -> Result<Vec<f32>> {
        Ok(x.data.clone())
    }

    fn read_at(&self, x: &CpuTensor, linear: usize) -> Result<f32> {
        x.data
            .get(linear)
            .copied()
            .ok_or_else(|| TensorError::IndexOutOfBounds {
                index: vec![linear],
                shape: x.shape.clone(),
            })
    }

    fn write_at(&self, x: &mut CpuTensor, linear: usize, value: f32) -> Result<()> {
        match x.data.get_mut(linear) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(TensorError::IndexOutOfBounds {
                index: vec![linear],
                shape: x.shape.clone(),
            }),
        }
    }

    fn copy(&self, x: &CpuTensor) -> Result<CpuTensor> {
        Ok(x.clone())
    }

    // === Elementwise ===

    fn unary(&self, op: UnaryOp, x: &CpuTensor) -> Result<CpuTensor> {
        Ok(self.map(x, |v| op.apply(v)))
    }

    fn binary(&self, op: BinaryOp, a: &CpuTensor, b: &CpuTensor) -> Result<CpuTensor> {
        let plan = BroadcastPlan::new(op.name(), &a.shape, &b.shape)?;
        check_divisor(op, &b.data)?;

        if plan.is_trivial() && self.vectorized() {
            let lanes = match op {
                BinaryOp::Add => Some(simd::add_f32 as fn(&[f32], &[f32], &mut [f32])),
                BinaryOp::Sub => Some(simd::sub_f32 as fn(&[f32], &[f32], &mut [f32])),
                BinaryOp::Mul => Some(simd::mul_f32 as fn(&[f32], &[f32], &mut [f32])),
                _ => None,
            };
            if let Some(kernel) = lanes {
                let mut out = vec![0.0f32; a.data.len()];
                kernel(&a.data, &b.data, &mut out);
                return Ok(CpuTensor::from_parts(out, a.shape.clone()));
            }
        }

        let data = plan
            .offsets()
            .map(|(i, j)| op.apply(a.data[i], b.data[j]))
            .collect();
        Ok(CpuTensor::from_parts(data, plan.shape().clone()))
    }

    fn binary_scalar(&self, op: BinaryOp, a: &CpuTensor, scalar: f32) -> Result<CpuTensor> {
        check_divisor(op, &[scalar])?;
        Ok(self.map(a, |v| op.apply(v, scalar)))
    }

    // === Reductions ===

    fn reduce(&self, op: ReduceOp, x: &CpuTensor) -> Result<f32> {
        let value = match op {
            ReduceOp::Sum if self.vectorized() => simd::sum_f32(&x.data),
            ReduceOp::SumSquares if self.vectorized() => simd::dot_f32(&x.data, &x.data),
            _ => x
                .data
                .iter()
                .fold(op.identity(), |acc, &v| op.accumulate(acc, v)),
        };
        Ok(value)
    }

    fn sum_to(&self, x: &CpuTensor, shape: &Shape) -> Result<CpuTensor> {
        layout::sum_to_check(&x.shape, shape)?;
        if &x.shape == shape {
            return Ok(x.clone());
        }

        // Walk `x` with the target's stride-0 addressing and fold into the target.
        let plan = BroadcastPlan::new("sum_to", &x.shape, shape)?;
        let mut data = vec![0.0f32; shape.numel()];
        for (src, dst) in plan.offsets() {
            data[dst] += x.data[src];
        }
        Ok(CpuTensor::from_parts(data, shape.clone()))
    }

    fn softmax(&self, x: &CpuTensor) -> Result<CpuTensor> {
        let cols = x.shape.dim(x.shape.ndim() - 1);
        let mut data = x.data.clone();
        for row in data.chunks_mut(cols) {
            let max = row.iter().fold(f32::NEG_INFINITY, |m, &v| m.max(v));
            let mut total = 0.0;
            for v in row.iter_mut() {
                *v = (*v - max).exp();
                total += *v;
            }
            for v in row.iter_mut() {
                *v /= total;
            }
        }
        Ok(CpuTensor::from_parts(data, x.shape.clone()))
    }

    // === Linear algebra ===

    fn matmul(&self, a: &CpuTensor, b: &CpuTensor) -> Result<CpuTensor> {
        let dims = layout::matmul_dims(&a.shape, &b.shape)?;
        let data = matmul::batched(
            &self.pool,
            self.kernel,
            self.block_size,
            &a.data,
            &b.data,
            (dims.batch, dims.m, dims.k, dims.n),
        );
        Ok(CpuTensor::from_parts(data, dims.out))
    }

    fn transpose(&self, x: &CpuTensor) -> Result<CpuTensor> {
        let (batch, rows, cols, out_shape) = layout::transpose_dims(&x.shape)?;
        let mut data = vec![0.0f32; x.data.len()];
        for b in 0..batch {
            let src = &x.data[b * rows * cols..(b + 1) * rows * cols];
            let dst = &mut data[b * rows * cols..(b + 1) * rows * cols];
            for i in 0..rows {
                for j in 0..cols {
                    dst[j * rows + i] = src[i * cols + j];
                }
            }
        }
        Ok(CpuTensor::from_parts(data, out_shape))
    }

    // === Shape ===

    fn reshape_in_place(&self, x: &mut CpuTensor, shape: &Shape) -> Result<()> {
        layout::reshape_check(&x.shape, shape)?;
        x.strides = shape.strides();
        x.shape = shape.clone();
        Ok(())
    }

    fn slice(&self, x: &CpuTensor, ranges: &[Range<usize>]) -> Result<CpuTensor> {
        let out_shape = layout::slice_shape(&x.shape, ranges)?;
        let data = out_shape
            .indices()
            .map(|idx| {
                let offset: usize = idx
                    .iter()
                    .zip(ranges)
                    .zip(x.strides.as_slice())
                    .map(|((i, r), s)| (r.start + i) * s)
                    .sum();
                x.data[offset]
            })
            .collect();
        Ok(CpuTensor::from_parts(data, out_shape))
    }

    fn concat(&self, a: &CpuTensor, b: &CpuTensor, axis: usize) -> Result<CpuTensor> {
        let dims = layout::concat_dims(&a.shape, &b.shape, axis)?;
        let mut data = Vec::with_capacity(dims.out.numel());
        for o in 0..dims.outer {
            data.extend_from_slice(&a.data[o * dims.lhs_chunk..(o + 1) * dims.lhs_chunk]);
            data.extend_from_slice(&b.data[o * dims.rhs_chunk..(o + 1) * dims.rhs_chunk]);
        }
        Ok(CpuTensor::from_parts(data, dims.out))
    }

    // === Convolution ===

    fn conv_same(&self, input: &CpuTensor, kernel: &CpuTensor) -> Result<CpuTensor> {
        let data = match layout::conv_same_dims(&input.shape, &kernel.shape)? {
            ConvSame::OneD { .. } => conv::conv_same_1d(&input.data, &kernel.data),
            ConvSame::TwoD { h, w, kh, kw } => {
                conv::conv_same_2d(&input.data, (h, w), &kernel.data, (kh, kw))
            }
        };
        Ok(CpuTensor::from_parts(data, input.shape.clone()))
    }

    fn conv2d(
        &self,
        input: &CpuTensor,
        weight: &CpuTensor,
        bias: Option<&CpuTensor>,
        params: Conv2dParams,
    ) -> Result<CpuTensor> {
        let dims =
            layout::conv2d_dims(&input.shape, &weight.shape, bias.map(|b| &b.shape), params)?;
        let data = conv::conv2d(
            &self.pool,
            &input.data,
            &weight.data,
            bias.map(|b| b.data.as_slice()),
            &dims,
            params,
        );
        Ok(CpuTensor::from_parts(data, dims.out))
    }
}

//! Backend trait - the operation surface shared by the CPU and GPU backends.

use std::ops::Range;

use crate::error::Result;
use crate::ops::{BinaryOp, Conv2dParams, ReduceOp, UnaryOp};
use crate::shape::Shape;
use crate::tensor::TensorData;

/// Tensor kernels for one execution target.
///
/// Every method validates shapes before touching device memory and returns
/// a freshly allocated tensor unless it is explicitly in-place.
pub trait Backend: Send + Sync {
    type Tensor: TensorData;

    fn name(&self) -> &'static str;

    // === Creation and access ===

    fn from_vec(&self, data: Vec<f32>, shape: Shape) -> Result<Self::Tensor>;

    fn full(&self, shape: &Shape, value: f32) -> Result<Self::Tensor>;

    fn zeros(&self, shape: &Shape) -> Result<Self::Tensor> {
        self.full(shape, 0.0)
    }

    fn ones(&self, shape: &Shape) -> Result<Self::Tensor> {
        self.full(shape, 1.0)
    }

    /// Copy the contents to host memory in row-major order.
    fn to_vec(&self, x: &Self::Tensor) -> Result<Vec<f32>>;

    fn read_at(&self, x: &Self::Tensor, linear: usize) -> Result<f32>;

    fn write_at(&self, x: &mut Self::Tensor, linear: usize, value: f32) -> Result<()>;

    /// Deep copy into a new buffer.
    fn copy(&self, x: &Self::Tensor) -> Result<Self::Tensor>;

    // === Elementwise ===

    fn unary(&self, op: UnaryOp, x: &Self::Tensor) -> Result<Self::Tensor>;

    /// Broadcasting binary op. `Div` fails if the divisor holds a zero.
    fn binary(&self, op: BinaryOp, a: &Self::Tensor, b: &Self::Tensor) -> Result<Self::Tensor>;

    /// Binary op against a scalar right operand. `Div` by zero fails.
    fn binary_scalar(&self, op: BinaryOp, a: &Self::Tensor, scalar: f32) -> Result<Self::Tensor>;

    // === Reductions ===

    fn reduce(&self, op: ReduceOp, x: &Self::Tensor) -> Result<f32>;

    /// Sum over broadcast axes so the result has `shape`.
    fn sum_to(&self, x: &Self::Tensor, shape: &Shape) -> Result<Self::Tensor>;

    /// Softmax over the last axis.
    fn softmax(&self, x: &Self::Tensor) -> Result<Self::Tensor>;

    // === Linear algebra ===

    /// Batched matrix multiplication: `(..., M, K) @ (..., K, N) -> (..., M, N)`.
    fn matmul(&self, a: &Self::Tensor, b: &Self::Tensor) -> Result<Self::Tensor>;

    /// Swap the last two axes.
    fn transpose(&self, x: &Self::Tensor) -> Result<Self::Tensor>;

    // === Shape ===

    /// Reinterpret the buffer with a new shape of equal size.
    fn reshape_in_place(&self, x: &mut Self::Tensor, shape: &Shape) -> Result<()>;

    fn slice(&self, x: &Self::Tensor, ranges: &[Range<usize>]) -> Result<Self::Tensor>;

    fn concat(&self, a: &Self::Tensor, b: &Self::Tensor, axis: usize) -> Result<Self::Tensor>;

    // === Convolution ===

    /// Direct SAME convolution of a 1D or 2D input with a kernel of equal rank.
    fn conv_same(&self, input: &Self::Tensor, kernel: &Self::Tensor) -> Result<Self::Tensor>;

    /// Batched `[N, C, H, W]` x `[O, C, KH, KW]` convolution with optional bias `[O]`.
    fn conv2d(
        &self,
        input: &Self::Tensor,
        weight: &Self::Tensor,
        bias: Option<&Self::Tensor>,
        params: Conv2dParams,
    ) -> Result<Self::Tensor>;
}

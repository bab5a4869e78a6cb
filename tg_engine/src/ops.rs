//! Arithmetic, shape, linear algebra and reduction operations on [`Tensor`].
//!
//! None of these record autograd history; see the `*_grad` variants.

use std::ops::Range;

use tg_tensor::{
    layout, require_same_shape, Activation, Backend, BinaryOp, ReduceOp, Result, Shape,
    TensorError, UnaryOp,
};

use crate::storage::{dispatch_binary, dispatch_unary, Storage};
use crate::tensor::Tensor;

/// Right-hand side of an elementwise operation.
#[derive(Debug, Clone, Copy)]
pub enum Operand<'a> {
    Tensor(&'a Tensor),
    Scalar(f32),
}

impl<'a> From<&'a Tensor> for Operand<'a> {
    fn from(t: &'a Tensor) -> Self {
        Operand::Tensor(t)
    }
}

impl From<f32> for Operand<'_> {
    fn from(v: f32) -> Self {
        Operand::Scalar(v)
    }
}

impl Tensor {
    // === Dispatch helpers ===

    pub(crate) fn unary_op(&self, op: UnaryOp) -> Result<Tensor> {
        let ctx = self.context();
        let state = self.read();
        let out: Storage = dispatch_unary!(ctx, "unary", &state.storage, |be, x| be.unary(op, x))?;
        Ok(Tensor::from_storage(ctx, out))
    }

    pub(crate) fn binary_op(&self, op: BinaryOp, rhs: &Tensor) -> Result<Tensor> {
        self.check_context(rhs, op.name())?;
        let ctx = self.context();
        let out: Storage = self.with_storages(rhs, |a, b| {
            dispatch_binary!(ctx, op.name(), (a, b), |be, x, y| be.binary(op, x, y))
        })?;
        Ok(Tensor::from_storage(ctx, out))
    }

    pub(crate) fn scalar_op(&self, op: BinaryOp, scalar: f32) -> Result<Tensor> {
        let ctx = self.context();
        let state = self.read();
        let out: Storage = dispatch_unary!(ctx, op.name(), &state.storage, |be, x| be
            .binary_scalar(op, x, scalar))?;
        Ok(Tensor::from_storage(ctx, out))
    }

    fn elementwise<'a>(&self, op: BinaryOp, rhs: impl Into<Operand<'a>>) -> Result<Tensor> {
        match rhs.into() {
            Operand::Tensor(t) => self.binary_op(op, t),
            Operand::Scalar(s) => self.scalar_op(op, s),
        }
    }

    fn reduce(&self, op: ReduceOp) -> Result<f32> {
        let ctx = self.context();
        let state = self.read();
        dispatch_unary!(ctx, "reduce", &state.storage, |be, x| be.reduce(op, x))
    }

    /// Replaces this tensor's storage with the storage of `result`.
    fn assign(&self, result: Tensor) -> Result<()> {
        let storage = result.into_storage()?;
        self.write().storage = storage;
        Ok(())
    }

    /// Applies `op` and stores the result in `self`, which keeps its shape.
    fn elementwise_in_place<'a>(&self, op: BinaryOp, rhs: impl Into<Operand<'a>>) -> Result<()> {
        let result = self.elementwise(op, rhs)?;
        if result.shape() != self.shape() {
            return Err(TensorError::ShapeMismatch {
                op: op.name(),
                lhs: self.shape(),
                rhs: result.shape(),
            });
        }
        self.assign(result)
    }

    // === Arithmetic ===

    pub fn add<'a>(&self, rhs: impl Into<Operand<'a>>) -> Result<Tensor> {
        self.elementwise(BinaryOp::Add, rhs)
    }

    pub fn sub<'a>(&self, rhs: impl Into<Operand<'a>>) -> Result<Tensor> {
        self.elementwise(BinaryOp::Sub, rhs)
    }

    pub fn mul<'a>(&self, rhs: impl Into<Operand<'a>>) -> Result<Tensor> {
        self.elementwise(BinaryOp::Mul, rhs)
    }

    /// Fails with `DivisionByZero` if any divisor element is zero.
    pub fn div<'a>(&self, rhs: impl Into<Operand<'a>>) -> Result<Tensor> {
        self.elementwise(BinaryOp::Div, rhs)
    }

    pub fn pow<'a>(&self, rhs: impl Into<Operand<'a>>) -> Result<Tensor> {
        self.elementwise(BinaryOp::Pow, rhs)
    }

    /// Elementwise maximum.
    pub fn maximum<'a>(&self, rhs: impl Into<Operand<'a>>) -> Result<Tensor> {
        self.elementwise(BinaryOp::Max, rhs)
    }

    pub fn minimum<'a>(&self, rhs: impl Into<Operand<'a>>) -> Result<Tensor> {
        self.elementwise(BinaryOp::Min, rhs)
    }

    // In-place forms; the right operand must broadcast to `self`'s shape.

    pub fn add_in_place<'a>(&self, rhs: impl Into<Operand<'a>>) -> Result<()> {
        self.elementwise_in_place(BinaryOp::Add, rhs)
    }

    pub fn sub_in_place<'a>(&self, rhs: impl Into<Operand<'a>>) -> Result<()> {
        self.elementwise_in_place(BinaryOp::Sub, rhs)
    }

    pub fn mul_in_place<'a>(&self, rhs: impl Into<Operand<'a>>) -> Result<()> {
        self.elementwise_in_place(BinaryOp::Mul, rhs)
    }

    pub fn div_in_place<'a>(&self, rhs: impl Into<Operand<'a>>) -> Result<()> {
        self.elementwise_in_place(BinaryOp::Div, rhs)
    }

    pub fn pow_in_place<'a>(&self, rhs: impl Into<Operand<'a>>) -> Result<()> {
        self.elementwise_in_place(BinaryOp::Pow, rhs)
    }

    // === Unary ===

    pub fn neg(&self) -> Result<Tensor> {
        self.unary_op(UnaryOp::Neg)
    }

    pub fn abs(&self) -> Result<Tensor> {
        self.unary_op(UnaryOp::Abs)
    }

    /// Square root; negative elements give NaN.
    pub fn sqrt(&self) -> Result<Tensor> {
        self.unary_op(UnaryOp::Sqrt)
    }

    /// -1, 0 or 1 per element.
    pub fn sign(&self) -> Result<Tensor> {
        self.unary_op(UnaryOp::Sign)
    }

    pub fn exp(&self) -> Result<Tensor> {
        self.unary_op(UnaryOp::Exp)
    }

    pub fn log(&self) -> Result<Tensor> {
        self.unary_op(UnaryOp::Log)
    }

    pub fn sqrt_in_place(&self) -> Result<()> {
        self.assign(self.sqrt()?)
    }

    pub fn sign_in_place(&self) -> Result<()> {
        self.assign(self.sign()?)
    }

    /// Applies an activation. `Softmax` normalizes over the last axis.
    pub fn activate(&self, activation: Activation) -> Result<Tensor> {
        match activation {
            Activation::Linear => self.deep_clone(),
            Activation::Softmax => {
                let ctx = self.context();
                let state = self.read();
                let out: Storage =
                    dispatch_unary!(ctx, "softmax", &state.storage, |be, x| be.softmax(x))?;
                Ok(Tensor::from_storage(ctx, out))
            }
            other => match other.forward_op() {
                Some(op) => self.unary_op(op),
                None => self.deep_clone(),
            },
        }
    }

    // === Linear algebra ===

    /// Matrix product. Ranks above 2 are treated as batches of matrices.
    pub fn matmul(&self, rhs: &Tensor) -> Result<Tensor> {
        self.check_context(rhs, "matmul")?;
        let ctx = self.context();
        let out: Storage = self.with_storages(rhs, |a, b| {
            dispatch_binary!(ctx, "matmul", (a, b), |be, x, y| be.matmul(x, y))
        })?;
        Ok(Tensor::from_storage(ctx, out))
    }

    /// Matrix transpose. A vector `[n]` becomes the column `[n, 1]`.
    pub fn transpose(&self) -> Result<Tensor> {
        let dims = self.dims();
        match dims.len() {
            1 => self.reshape(&[dims[0], 1]),
            2 => self.swap_last_axes(),
            r => Err(TensorError::unsupported(
                "transpose",
                format!("expected rank 1 or 2, got rank {r}"),
            )),
        }
    }

    /// Swaps the two innermost axes of each batch.
    pub(crate) fn swap_last_axes(&self) -> Result<Tensor> {
        let ctx = self.context();
        let state = self.read();
        let out: Storage =
            dispatch_unary!(ctx, "transpose", &state.storage, |be, x| be.transpose(x))?;
        Ok(Tensor::from_storage(ctx, out))
    }

    // === Shape ===

    /// Copies the sub-tensor selected by one half-open range per axis.
    pub fn slice(&self, ranges: &[Range<usize>]) -> Result<Tensor> {
        let ctx = self.context();
        let state = self.read();
        let out: Storage =
            dispatch_unary!(ctx, "slice", &state.storage, |be, x| be.slice(x, ranges))?;
        Ok(Tensor::from_storage(ctx, out))
    }

    /// Joins along `axis`; all other dimensions must match.
    pub fn concat(&self, rhs: &Tensor, axis: usize) -> Result<Tensor> {
        self.check_context(rhs, "concat")?;
        let ctx = self.context();
        let out: Storage = self.with_storages(rhs, |a, b| {
            dispatch_binary!(ctx, "concat", (a, b), |be, x, y| be.concat(x, y, axis))
        })?;
        Ok(Tensor::from_storage(ctx, out))
    }

    /// Drops every size-1 axis; an all-ones shape collapses to `[1]`.
    pub fn squeeze(&self) -> Result<Tensor> {
        let dims: Vec<usize> = self.dims().into_iter().filter(|&d| d != 1).collect();
        if dims.is_empty() {
            self.reshape(&[1])
        } else {
            self.reshape(&dims)
        }
    }

    /// Inserts a size-1 axis before `axis` (`axis == ndim` appends).
    pub fn unsqueeze(&self, axis: usize) -> Result<Tensor> {
        let mut dims = self.dims();
        if axis > dims.len() {
            return Err(TensorError::IndexOutOfBounds {
                index: vec![axis],
                shape: self.shape(),
            });
        }
        dims.insert(axis, 1);
        self.reshape(&dims)
    }

    /// Sums broadcast axes away so the result has shape `dims`.
    pub fn sum_to(&self, dims: &[usize]) -> Result<Tensor> {
        let target = Shape::new(dims.to_vec())?;
        layout::sum_to_check(&self.shape(), &target)?;
        let ctx = self.context();
        let state = self.read();
        let out: Storage =
            dispatch_unary!(ctx, "sum_to", &state.storage, |be, x| be.sum_to(x, &target))?;
        Ok(Tensor::from_storage(ctx, out))
    }

    // === Reductions ===

    pub fn sum(&self) -> Result<f32> {
        self.reduce(ReduceOp::Sum)
    }

    pub fn mean(&self) -> Result<f32> {
        Ok(self.sum()? / self.numel() as f32)
    }

    /// Population variance.
    pub fn variance(&self) -> Result<f32> {
        let centered = self.sub(self.mean()?)?;
        Ok(centered.reduce(ReduceOp::SumSquares)? / self.numel() as f32)
    }

    pub fn min(&self) -> Result<f32> {
        self.reduce(ReduceOp::Min)
    }

    pub fn max(&self) -> Result<f32> {
        self.reduce(ReduceOp::Max)
    }

    /// Euclidean (Frobenius) norm.
    pub fn norm(&self) -> Result<f32> {
        Ok(self.reduce(ReduceOp::SumSquares)?.sqrt())
    }

    /// Sum of elementwise products of two equal-shape tensors.
    pub fn dot(&self, rhs: &Tensor) -> Result<f32> {
        require_same_shape("dot", &self.shape(), &rhs.shape())?;
        self.mul(rhs)?.sum()
    }

    pub fn distance_squared(&self, rhs: &Tensor) -> Result<f32> {
        require_same_shape("distance", &self.shape(), &rhs.shape())?;
        self.sub(rhs)?.reduce(ReduceOp::SumSquares)
    }

    pub fn distance(&self, rhs: &Tensor) -> Result<f32> {
        Ok(self.distance_squared(rhs)?.sqrt())
    }
}

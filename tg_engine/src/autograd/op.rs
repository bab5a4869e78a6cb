//! Recorded operations and their local gradients.

use std::ops::Range;

use tg_tensor::{Activation, Result, Shape};

use crate::tensor::Tensor;

/// Operation that produced a tracked tensor.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorOp {
    // === Binary element-wise ===
    Add,
    Sub,
    Mul,
    Div,
    Pow,

    // === Scalar right operand ===
    /// `x + s` or `x - s`; both pass the gradient through.
    ScalarAdd,
    ScalarMul(f32),
    ScalarDiv(f32),
    PowScalar(f32),

    // === Linear algebra ===
    MatMul,

    Activate(Activation),

    // === Shape ===
    Reshape { original: Shape },
    Transpose { original: Shape },
    Concat { axis: usize, split: usize },

    // === Reductions ===
    Sum,
    Mean,
}

impl TensorOp {
    pub fn name(&self) -> &'static str {
        match self {
            TensorOp::Add => "add_grad",
            TensorOp::Sub => "sub_grad",
            TensorOp::Mul => "mul_grad",
            TensorOp::Div => "div_grad",
            TensorOp::Pow => "pow_grad",
            TensorOp::ScalarAdd => "scalar_add_grad",
            TensorOp::ScalarMul(_) => "scalar_mul_grad",
            TensorOp::ScalarDiv(_) => "scalar_div_grad",
            TensorOp::PowScalar(_) => "pow_scalar_grad",
            TensorOp::MatMul => "matmul_grad",
            TensorOp::Activate(_) => "activate_grad",
            TensorOp::Reshape { .. } => "reshape_grad",
            TensorOp::Transpose { .. } => "transpose_grad",
            TensorOp::Concat { .. } => "concat_grad",
            TensorOp::Sum => "sum_grad",
            TensorOp::Mean => "mean_grad",
        }
    }

    /// Number of tensor inputs.
    pub fn arity(&self) -> usize {
        match self {
            TensorOp::Add
            | TensorOp::Sub
            | TensorOp::Mul
            | TensorOp::Div
            | TensorOp::Pow
            | TensorOp::MatMul
            | TensorOp::Concat { .. } => 2,
            _ => 1,
        }
    }

    /// Gradient contribution for each input given the output gradient `grad`.
    ///
    /// Inputs that are not tracked get `None` and are never evaluated.
    pub(crate) fn backward(
        &self,
        output: &Tensor,
        inputs: &[Tensor],
        grad: &Tensor,
    ) -> Result<Vec<Option<Tensor>>> {
        let wants = |i: usize| inputs[i].uses_grad();
        // Broadcasting ops sum the gradient back to each input's shape.
        let reduce = |g: Tensor, i: usize| g.sum_to(&inputs[i].dims());

        let grads = match self {
            TensorOp::Add => vec![
                when(wants(0), || reduce(grad.deep_clone()?, 0))?,
                when(wants(1), || reduce(grad.deep_clone()?, 1))?,
            ],

            TensorOp::Sub => vec![
                when(wants(0), || reduce(grad.deep_clone()?, 0))?,
                when(wants(1), || reduce(grad.neg()?, 1))?,
            ],

            TensorOp::Mul => vec![
                when(wants(0), || reduce(grad.mul(&inputs[1])?, 0))?,
                when(wants(1), || reduce(grad.mul(&inputs[0])?, 1))?,
            ],

            // d(a/b)/da = 1/b, d(a/b)/db = -a/b^2 = -out/b
            TensorOp::Div => vec![
                when(wants(0), || reduce(grad.div(&inputs[1])?, 0))?,
                when(wants(1), || {
                    reduce(grad.mul(output)?.div(&inputs[1])?.neg()?, 1)
                })?,
            ],

            // d(a^b)/da = b * a^(b-1), d(a^b)/db = a^b * ln(a)
            TensorOp::Pow => {
                let (a, b) = (&inputs[0], &inputs[1]);
                vec![
                    when(wants(0), || {
                        reduce(grad.mul(b)?.mul(&a.pow(&b.sub(1.0)?)?)?, 0)
                    })?,
                    when(wants(1), || reduce(grad.mul(output)?.mul(&a.log()?)?, 1))?,
                ]
            }

            TensorOp::ScalarAdd => vec![Some(grad.deep_clone()?)],
            TensorOp::ScalarMul(s) => vec![Some(grad.mul(*s)?)],
            TensorOp::ScalarDiv(s) => vec![Some(grad.div(*s)?)],
            TensorOp::PowScalar(p) => {
                let local = inputs[0].pow(p - 1.0)?.mul(*p)?;
                vec![Some(grad.mul(&local)?)]
            }

            // C = A @ B: dA = dC @ B^T, dB = A^T @ dC
            TensorOp::MatMul => vec![
                when(wants(0), || grad.matmul(&inputs[1].swap_last_axes()?))?,
                when(wants(1), || inputs[0].swap_last_axes()?.matmul(grad))?,
            ],

            TensorOp::Activate(activation) => {
                let g = match activation {
                    Activation::Linear => grad.deep_clone()?,
                    // dx = y * (g - sum(g * y)) along the last axis
                    Activation::Softmax => {
                        let mut row = output.dims();
                        if let Some(last) = row.last_mut() {
                            *last = 1;
                        }
                        let weighted = grad.mul(output)?.sum_to(&row)?;
                        output.mul(&grad.sub(&weighted)?)?
                    }
                    other => match other.derivative_op() {
                        Some(op) => grad.mul(&inputs[0].unary_op(op)?)?,
                        None => grad.deep_clone()?,
                    },
                };
                vec![Some(g)]
            }

            TensorOp::Reshape { original } => vec![Some(grad.reshape(original.dims())?)],

            TensorOp::Transpose { original } => {
                let g = if original.ndim() == 1 {
                    grad.reshape(original.dims())?
                } else {
                    grad.swap_last_axes()?
                };
                vec![Some(g)]
            }

            TensorOp::Concat { axis, split } => {
                let dims = grad.dims();
                let ranges = |r: Range<usize>| -> Vec<Range<usize>> {
                    dims.iter()
                        .enumerate()
                        .map(|(i, &d)| if i == *axis { r.clone() } else { 0..d })
                        .collect()
                };
                vec![
                    when(wants(0), || grad.slice(&ranges(0..*split)))?,
                    when(wants(1), || grad.slice(&ranges(*split..dims[*axis])))?,
                ]
            }

            // The output has shape [1]; broadcast it back over the input.
            TensorOp::Sum => vec![Some(inputs[0].ones_like()?.mul(grad)?)],
            TensorOp::Mean => {
                let n = inputs[0].numel() as f32;
                vec![Some(inputs[0].ones_like()?.mul(grad)?.div(n)?)]
            }
        };
        Ok(grads)
    }
}

fn when(needed: bool, f: impl FnOnce() -> Result<Tensor>) -> Result<Option<Tensor>> {
    if needed {
        f().map(Some)
    } else {
        Ok(None)
    }
}

//! Broadcasting plans for elementwise binary kernels.

use crate::error::{Result, TensorError};
use crate::shape::{compute_strides, Shape};

/// Strides of `src` addressed with indices of `out`.
///
/// Missing leading dimensions and stretched (size-1) dimensions get stride 0,
/// so every output index maps to index 0 along them.
pub fn effective_strides(src: &Shape, out: &Shape) -> Vec<usize> {
    let offset = out.ndim() - src.ndim();
    let src_strides = compute_strides(src.dims());
    let mut strides = vec![0usize; out.ndim()];
    for i in 0..src.ndim() {
        if src.dim(i) == out.dim(offset + i) {
            strides[offset + i] = src_strides[i];
        }
    }
    strides
}

/// Fail with `ShapeMismatch` unless both shapes are identical.
pub fn require_same_shape(op: &'static str, lhs: &Shape, rhs: &Shape) -> Result<()> {
    if lhs != rhs {
        return Err(TensorError::ShapeMismatch {
            op,
            lhs: lhs.clone(),
            rhs: rhs.clone(),
        });
    }
    Ok(())
}

/// Output shape and per-operand strides for a broadcast binary operation.
#[derive(Debug, Clone)]
pub struct BroadcastPlan {
    shape: Shape,
    lhs_strides: Vec<usize>,
    rhs_strides: Vec<usize>,
    trivial: bool,
}

impl BroadcastPlan {
    pub fn new(op: &'static str, lhs: &Shape, rhs: &Shape) -> Result<Self> {
        let shape = lhs.broadcast_with(rhs, op)?;
        let trivial = lhs == rhs;
        Ok(BroadcastPlan {
            lhs_strides: effective_strides(lhs, &shape),
            rhs_strides: effective_strides(rhs, &shape),
            shape,
            trivial,
        })
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn lhs_strides(&self) -> &[usize] {
        &self.lhs_strides
    }

    pub fn rhs_strides(&self) -> &[usize] {
        &self.rhs_strides
    }

    /// Both operands already have the output shape.
    pub fn is_trivial(&self) -> bool {
        self.trivial
    }

    /// `(lhs_offset, rhs_offset)` for each output element in row-major order.
    pub fn offsets(&self) -> BroadcastOffsets<'_> {
        BroadcastOffsets {
            plan: self,
            index: vec![0; self.shape.ndim()],
            lhs: 0,
            rhs: 0,
            remaining: self.shape.numel(),
        }
    }
}

pub struct BroadcastOffsets<'a> {
    plan: &'a BroadcastPlan,
    index: Vec<usize>,
    lhs: usize,
    rhs: usize,
    remaining: usize,
}

impl Iterator for BroadcastOffsets<'_> {
    type Item = (usize, usize);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let item = (self.lhs, self.rhs);
        self.remaining -= 1;

        if self.remaining > 0 {
            let dims = self.plan.shape.dims();
            for d in (0..dims.len()).rev() {
                self.index[d] += 1;
                self.lhs += self.plan.lhs_strides[d];
                self.rhs += self.plan.rhs_strides[d];
                if self.index[d] < dims[d] {
                    break;
                }
                self.lhs -= self.plan.lhs_strides[d] * dims[d];
                self.rhs -= self.plan.rhs_strides[d] * dims[d];
                self.index[d] = 0;
            }
        }

        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for BroadcastOffsets<'_> {}

//! Reverse-mode automatic differentiation.
//!
//! Tensors opt in with [`Tensor::with_grad`](crate::Tensor::with_grad). Only
//! the `*_grad` operations record the op and its inputs on the output; the
//! plain operations never do. `backward` walks the recorded graph in reverse
//! topological order and accumulates into the `grad` of every tracked tensor.

mod grad_ops;
mod graph;
mod op;

pub use op::TensorOp;

use crate::tensor::Tensor;

/// Per-tensor autograd bookkeeping.
#[derive(Debug, Default)]
pub(crate) struct AutogradState {
    pub(crate) grad: Option<Tensor>,
    /// `None` for leaves.
    pub(crate) op: Option<TensorOp>,
    pub(crate) inputs: Vec<Tensor>,
}

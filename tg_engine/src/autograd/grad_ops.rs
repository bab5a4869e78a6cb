//! Gradient tracking controls and the recording `*_grad` operations.

use tg_tensor::{require_same_shape, Activation, Result, TensorError};

use super::graph::run_backward;
use super::op::TensorOp;
use super::AutogradState;
use crate::ops::Operand;
use crate::storage::Storage;
use crate::tensor::Tensor;

impl Tensor {
    /// Marks this tensor as a gradient leaf and returns it.
    pub fn with_grad(self) -> Self {
        {
            let mut state = self.write();
            if state.autograd.is_none() {
                state.autograd = Some(AutogradState::default());
            }
        }
        self
    }

    /// Whether gradients are tracked for this tensor.
    pub fn uses_grad(&self) -> bool {
        self.read().autograd.is_some()
    }

    /// Accumulated gradient, `None` until a backward pass reaches this tensor.
    pub fn grad(&self) -> Option<Tensor> {
        self.read().autograd.as_ref().and_then(|a| a.grad.clone())
    }

    /// Clears the accumulated gradient; the recorded graph is kept.
    pub fn zero_grad(&self) {
        if let Some(autograd) = self.write().autograd.as_mut() {
            autograd.grad = None;
        }
    }

    /// Backward pass seeded with ones of this tensor's shape.
    pub fn backward(&self) -> Result<()> {
        self.require_grad("backward")?;
        run_backward(self, self.ones_like()?)
    }

    /// Backward pass seeded with `grad_output`, which must match this tensor's shape.
    pub fn backward_with(&self, grad_output: &Tensor) -> Result<()> {
        self.require_grad("backward")?;
        require_same_shape("backward", &self.shape(), &grad_output.shape())?;
        run_backward(self, grad_output.deep_clone()?)
    }

    // === Graph internals ===

    fn require_grad(&self, op: &'static str) -> Result<()> {
        if self.uses_grad() {
            Ok(())
        } else {
            Err(TensorError::AutogradNotEnabled { op })
        }
    }

    pub(crate) fn recorded(&self) -> Option<(TensorOp, Vec<Tensor>)> {
        let state = self.read();
        let autograd = state.autograd.as_ref()?;
        let op = autograd.op.clone()?;
        Some((op, autograd.inputs.clone()))
    }

    pub(crate) fn accumulate_grad(&self, grad: &Tensor) -> Result<()> {
        let updated = match self.grad() {
            Some(existing) => existing.add(grad)?,
            None => grad.deep_clone()?,
        };
        if let Some(autograd) = self.write().autograd.as_mut() {
            autograd.grad = Some(updated);
        }
        Ok(())
    }

    /// Wraps `output` as a tracked result of `op` over `inputs`.
    fn record(output: Tensor, op: TensorOp, inputs: Vec<Tensor>) -> Result<Tensor> {
        debug_assert_eq!(inputs.len(), op.arity());
        if !inputs.iter().any(Tensor::uses_grad) {
            return Err(TensorError::AutogradNotEnabled { op: op.name() });
        }
        let ctx = output.context().clone();
        let storage: Storage = output.into_storage()?;
        Ok(Tensor::with_state(
            &ctx,
            storage,
            Some(AutogradState {
                grad: None,
                op: Some(op),
                inputs,
            }),
        ))
    }

    fn binary_grad<'a>(
        &self,
        rhs: Operand<'a>,
        tensor_op: TensorOp,
        scalar_op: impl FnOnce(f32) -> TensorOp,
        forward: impl FnOnce(&Tensor, Operand<'a>) -> Result<Tensor>,
    ) -> Result<Tensor> {
        let output = forward(self, rhs)?;
        match rhs {
            Operand::Tensor(t) => Self::record(output, tensor_op, vec![self.clone(), t.clone()]),
            Operand::Scalar(s) => Self::record(output, scalar_op(s), vec![self.clone()]),
        }
    }

    // === Recording operations ===

    pub fn add_grad<'a>(&self, rhs: impl Into<Operand<'a>>) -> Result<Tensor> {
        self.binary_grad(rhs.into(), TensorOp::Add, |_| TensorOp::ScalarAdd, |a, b| a.add(b))
    }

    pub fn sub_grad<'a>(&self, rhs: impl Into<Operand<'a>>) -> Result<Tensor> {
        self.binary_grad(rhs.into(), TensorOp::Sub, |_| TensorOp::ScalarAdd, |a, b| a.sub(b))
    }

    pub fn mul_grad<'a>(&self, rhs: impl Into<Operand<'a>>) -> Result<Tensor> {
        self.binary_grad(rhs.into(), TensorOp::Mul, TensorOp::ScalarMul, |a, b| a.mul(b))
    }

    pub fn div_grad<'a>(&self, rhs: impl Into<Operand<'a>>) -> Result<Tensor> {
        self.binary_grad(rhs.into(), TensorOp::Div, TensorOp::ScalarDiv, |a, b| a.div(b))
    }

    pub fn pow_grad<'a>(&self, rhs: impl Into<Operand<'a>>) -> Result<Tensor> {
        self.binary_grad(rhs.into(), TensorOp::Pow, TensorOp::PowScalar, |a, b| a.pow(b))
    }

    pub fn matmul_grad(&self, rhs: &Tensor) -> Result<Tensor> {
        Self::record(self.matmul(rhs)?, TensorOp::MatMul, vec![self.clone(), rhs.clone()])
    }

    pub fn activate_grad(&self, activation: Activation) -> Result<Tensor> {
        Self::record(
            self.activate(activation)?,
            TensorOp::Activate(activation),
            vec![self.clone()],
        )
    }

    pub fn reshape_grad(&self, dims: &[usize]) -> Result<Tensor> {
        let original = self.shape();
        Self::record(self.reshape(dims)?, TensorOp::Reshape { original }, vec![self.clone()])
    }

    pub fn transpose_grad(&self) -> Result<Tensor> {
        let original = self.shape();
        Self::record(self.transpose()?, TensorOp::Transpose { original }, vec![self.clone()])
    }

    pub fn concat_grad(&self, rhs: &Tensor, axis: usize) -> Result<Tensor> {
        let output = self.concat(rhs, axis)?;
        let split = self.shape().dim(axis);
        Self::record(output, TensorOp::Concat { axis, split }, vec![self.clone(), rhs.clone()])
    }

    /// Sum of all elements as a tracked `[1]` tensor.
    pub fn sum_grad(&self) -> Result<Tensor> {
        let total = self.context().scalar(self.sum()?)?;
        Self::record(total, TensorOp::Sum, vec![self.clone()])
    }

    /// Mean of all elements as a tracked `[1]` tensor.
    pub fn mean_grad(&self) -> Result<Tensor> {
        let mean = self.context().scalar(self.mean()?)?;
        Self::record(mean, TensorOp::Mean, vec![self.clone()])
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::context::ComputeContext;

    fn ctx() -> ComputeContext {
        ComputeContext::cpu_only().unwrap()
    }

    #[test]
    fn test_square_gradient() {
        let x = ctx().scalar(3.0).unwrap().with_grad();
        let y = x.mul_grad(&x).unwrap();
        y.backward().unwrap();
        assert_eq!(x.grad().unwrap().to_vec().unwrap(), vec![6.0]);
    }

    #[test]
    fn test_untracked_operands_rejected() {
        let ctx = ctx();
        let a = ctx.ones(&[2]).unwrap();
        let b = ctx.ones(&[2]).unwrap();
        assert!(matches!(
            a.add_grad(&b),
            Err(TensorError::AutogradNotEnabled { .. })
        ));
        assert!(matches!(
            a.backward(),
            Err(TensorError::AutogradNotEnabled { .. })
        ));
    }

    #[test]
    fn test_plain_ops_do_not_record() {
        let x = ctx().ones(&[2]).unwrap().with_grad();
        let y = x.mul(2.0).unwrap();
        assert!(!y.uses_grad());
        assert!(x.mul_grad(2.0).unwrap().uses_grad());
    }

    #[test]
    fn test_accumulates_across_passes() {
        let x = ctx().from_values(&[2], vec![1.0, 2.0]).unwrap().with_grad();
        let y = x.mul_grad(3.0).unwrap();
        y.backward().unwrap();
        y.backward().unwrap();
        assert_eq!(x.grad().unwrap().to_vec().unwrap(), vec![6.0, 6.0]);
        x.zero_grad();
        assert!(x.grad().is_none());
        y.backward().unwrap();
        assert_eq!(x.grad().unwrap().to_vec().unwrap(), vec![3.0, 3.0]);
    }

    #[test]
    fn test_backward_with_seed() {
        let ctx = ctx();
        let x = ctx.from_values(&[2], vec![1.0, 2.0]).unwrap().with_grad();
        let y = x.mul_grad(&x).unwrap();
        let seed = ctx.from_values(&[2], vec![1.0, 0.5]).unwrap();
        y.backward_with(&seed).unwrap();
        assert_eq!(x.grad().unwrap().to_vec().unwrap(), vec![2.0, 2.0]);
        assert!(matches!(
            y.backward_with(&ctx.ones(&[3]).unwrap()),
            Err(TensorError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_deep_clone_detaches() {
        let x = ctx().ones(&[2]).unwrap().with_grad();
        let y = x.mul_grad(2.0).unwrap();
        let detached = y.deep_clone().unwrap();
        assert!(!detached.uses_grad());
        assert!(detached.backward().is_err());
    }

    #[test]
    fn test_mean_gradient() {
        let x = ctx().from_values(&[4], vec![1.0, 2.0, 3.0, 4.0]).unwrap().with_grad();
        let m = x.mean_grad().unwrap();
        assert_relative_eq!(m.item().unwrap(), 2.5);
        m.backward().unwrap();
        assert_eq!(x.grad().unwrap().to_vec().unwrap(), vec![0.25; 4]);
    }
}

//! Error type shared by every tensorgrad crate.

use crate::shape::Shape;

/// Errors raised by tensor construction, kernels and the autograd engine.
#[derive(Debug, thiserror::Error)]
pub enum TensorError {
    /// A shape is empty or contains a zero dimension.
    #[error("invalid shape {dims:?}: {reason}")]
    InvalidShape {
        dims: Vec<usize>,
        reason: &'static str,
    },

    /// Two operands have incompatible shapes for the requested operation.
    #[error("incompatible shapes for {op}: {lhs} vs {rhs}")]
    ShapeMismatch {
        op: &'static str,
        lhs: Shape,
        rhs: Shape,
    },

    /// An index lies outside `[0, dim)` or has the wrong rank.
    #[error("index {index:?} out of bounds for shape {shape}")]
    IndexOutOfBounds { index: Vec<usize>, shape: Shape },

    #[error("division by zero in {op}")]
    DivisionByZero { op: &'static str },

    /// `backward` on an untracked tensor, or a gradient op with no tracked operand.
    #[error("{op} requires gradient tracking; call with_grad() first")]
    AutogradNotEnabled { op: &'static str },

    #[error("unsupported operation {op}: {detail}")]
    UnsupportedOperation { op: &'static str, detail: String },

    /// GPU context, queue or program could not be created.
    #[error("device initialization failed: {0}")]
    DeviceInitialization(String),

    /// A GPU kernel launch or transfer failed at runtime.
    #[error("native kernel {kernel} failed: {detail}")]
    NativeKernel { kernel: &'static str, detail: String },

    #[error("data length {actual} does not match shape {shape} (expected {expected})")]
    DataLength {
        expected: usize,
        actual: usize,
        shape: Shape,
    },

    #[error("device buffer has already been released")]
    Released,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("malformed tensor stream: {0}")]
    Serialization(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TensorError {
    /// Whether the failure came from the GPU and the operation may be retried on the CPU.
    pub fn is_device_failure(&self) -> bool {
        matches!(
            self,
            TensorError::DeviceInitialization(_) | TensorError::NativeKernel { .. }
        )
    }

    pub fn native(kernel: &'static str, detail: impl ToString) -> Self {
        TensorError::NativeKernel {
            kernel,
            detail: detail.to_string(),
        }
    }

    pub fn unsupported(op: &'static str, detail: impl Into<String>) -> Self {
        TensorError::UnsupportedOperation {
            op,
            detail: detail.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TensorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_failure_classification() {
        assert!(TensorError::DeviceInitialization("no platform".into()).is_device_failure());
        assert!(TensorError::native("matmul_tiled", "CL_OUT_OF_RESOURCES").is_device_failure());
        assert!(!TensorError::DivisionByZero { op: "div" }.is_device_failure());
        assert!(!TensorError::Released.is_device_failure());
    }

    #[test]
    fn test_messages() {
        let err = TensorError::ShapeMismatch {
            op: "add",
            lhs: Shape::new(vec![2, 3]).unwrap(),
            rhs: Shape::new(vec![4]).unwrap(),
        };
        assert_eq!(err.to_string(), "incompatible shapes for add: (2, 3) vs (4,)");
    }
}

//! TensorData trait - the storage abstraction implemented by each backend.

use crate::shape::{Shape, Strides};

/// Backend-owned tensor storage.
///
/// Implementations own their buffer exclusively; there are no views.
pub trait TensorData: Send + Sync + 'static {
    fn shape(&self) -> &Shape;

    fn strides(&self) -> &Strides;

    fn numel(&self) -> usize {
        self.shape().numel()
    }

    fn ndim(&self) -> usize {
        self.shape().ndim()
    }
}

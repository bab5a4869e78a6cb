//! Shape and stride utilities for tensors.
//!
//! Every tensor has rank >= 1 and every dimension >= 1; a scalar is `[1]`.
//! Strides are always row-major.

use std::fmt;

use crate::error::{Result, TensorError};

/// Number of elements in `dims`.
///
/// Fails with [`TensorError::InvalidShape`] for an empty shape, a zero dimension
/// or an element count that does not fit in `usize`.
pub fn compute_size(dims: &[usize]) -> Result<usize> {
    if dims.is_empty() {
        return Err(TensorError::InvalidShape {
            dims: dims.to_vec(),
            reason: "rank must be at least 1",
        });
    }
    if dims.iter().any(|&d| d == 0) {
        return Err(TensorError::InvalidShape {
            dims: dims.to_vec(),
            reason: "every dimension must be positive",
        });
    }
    dims.iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| TensorError::InvalidShape {
            dims: dims.to_vec(),
            reason: "element count overflows usize",
        })
}

/// Row-major strides: `strides[last] = 1`, `strides[i] = strides[i + 1] * dims[i + 1]`.
pub fn compute_strides(dims: &[usize]) -> Vec<usize> {
    let ndim = dims.len();
    if ndim == 0 {
        return vec![];
    }

    let mut strides = vec![1usize; ndim];
    for i in (0..ndim - 1).rev() {
        strides[i] = strides[i + 1] * dims[i + 1];
    }
    strides
}

/// Flat offset of `indices` in a tensor with the given dims and strides.
pub fn linear_index(indices: &[usize], dims: &[usize], strides: &[usize]) -> Result<usize> {
    if indices.len() != dims.len() || indices.iter().zip(dims).any(|(&i, &d)| i >= d) {
        return Err(TensorError::IndexOutOfBounds {
            index: indices.to_vec(),
            shape: Shape(dims.to_vec()),
        });
    }
    Ok(indices.iter().zip(strides).map(|(i, s)| i * s).sum())
}

/// Inverse of [`linear_index`] for row-major layouts.
pub fn unravel_index(linear: usize, dims: &[usize]) -> Result<Vec<usize>> {
    let numel = dims
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .unwrap_or(usize::MAX);
    if dims.is_empty() || linear >= numel {
        return Err(TensorError::IndexOutOfBounds {
            index: vec![linear],
            shape: Shape(dims.to_vec()),
        });
    }

    let mut remaining = linear;
    let mut indices = vec![0usize; dims.len()];
    for i in (0..dims.len()).rev() {
        indices[i] = remaining % dims[i];
        remaining /= dims[i];
    }
    Ok(indices)
}

/// A validated tensor shape.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Shape(Vec<usize>);

impl Shape {
    /// Create a shape, rejecting empty shapes and zero dimensions.
    pub fn new(dims: Vec<usize>) -> Result<Self> {
        compute_size(&dims)?;
        Ok(Shape(dims))
    }

    /// Shape `[1]`, used for scalars.
    pub fn scalar() -> Self {
        Shape(vec![1])
    }

    pub fn ndim(&self) -> usize {
        self.0.len()
    }

    /// Dimension at `idx`. Panics if `idx >= ndim()`.
    pub fn dim(&self, idx: usize) -> usize {
        self.0[idx]
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Element count. Construction guarantees it fits in `usize`.
    pub fn numel(&self) -> usize {
        self.0.iter().product()
    }

    pub fn is_scalar(&self) -> bool {
        self.numel() == 1
    }

    pub fn strides(&self) -> Strides {
        Strides(compute_strides(&self.0))
    }

    /// Flat offset of a multi-dimensional index.
    pub fn linear_index(&self, indices: &[usize]) -> Result<usize> {
        linear_index(indices, &self.0, &compute_strides(&self.0))
    }

    pub fn unravel(&self, linear: usize) -> Result<Vec<usize>> {
        unravel_index(linear, &self.0)
    }

    /// Iterate over all multi-dimensional indices in row-major order.
    pub fn indices(&self) -> Indices<'_> {
        Indices::new(self)
    }

    /// Broadcast two shapes right-to-left.
    pub fn broadcast_with(&self, other: &Shape, op: &'static str) -> Result<Shape> {
        let ndim = self.ndim().max(other.ndim());
        let mut result = vec![0usize; ndim];

        for (i, slot) in result.iter_mut().enumerate() {
            let d1 = if i < ndim - self.ndim() {
                1
            } else {
                self.0[i - (ndim - self.ndim())]
            };
            let d2 = if i < ndim - other.ndim() {
                1
            } else {
                other.0[i - (ndim - other.ndim())]
            };

            *slot = if d1 == d2 || d2 == 1 {
                d1
            } else if d1 == 1 {
                d2
            } else {
                return Err(TensorError::ShapeMismatch {
                    op,
                    lhs: self.clone(),
                    rhs: other.clone(),
                });
            };
        }

        Shape::new(result)
    }

    /// Same shape with the dimension at `axis` replaced.
    pub fn with_dim(&self, axis: usize, size: usize) -> Result<Shape> {
        let mut dims = self.0.clone();
        match dims.get_mut(axis) {
            Some(d) => *d = size,
            None => {
                return Err(TensorError::IndexOutOfBounds {
                    index: vec![axis],
                    shape: self.clone(),
                })
            }
        }
        Shape::new(dims)
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shape({:?})", self.0)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        if self.0.len() == 1 {
            write!(f, ",")?;
        }
        write!(f, ")")
    }
}

impl TryFrom<Vec<usize>> for Shape {
    type Error = TensorError;

    fn try_from(v: Vec<usize>) -> Result<Self> {
        Shape::new(v)
    }
}

impl TryFrom<&[usize]> for Shape {
    type Error = TensorError;

    fn try_from(s: &[usize]) -> Result<Self> {
        Shape::new(s.to_vec())
    }
}

/// Tensor strides (step size in each dimension).
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Strides(pub Vec<usize>);

impl Strides {
    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }
}

/// Row-major odometer over every index of a shape.
pub struct Indices<'a> {
    shape: &'a Shape,
    current: Vec<usize>,
    done: bool,
}

impl<'a> Indices<'a> {
    fn new(shape: &'a Shape) -> Self {
        Indices {
            shape,
            current: vec![0; shape.ndim()],
            done: false,
        }
    }
}

impl Iterator for Indices<'_> {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let result = self.current.clone();

        let mut i = self.shape.ndim() - 1;
        loop {
            self.current[i] += 1;
            if self.current[i] < self.shape.dim(i) {
                break;
            }
            self.current[i] = 0;
            if i == 0 {
                self.done = true;
                break;
            }
            i -= 1;
        }

        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(dims: &[usize]) -> Shape {
        Shape::new(dims.to_vec()).unwrap()
    }

    #[test]
    fn test_shape_basics() {
        let s = shape(&[2, 3, 4]);
        assert_eq!(s.ndim(), 3);
        assert_eq!(s.dim(0), 2);
        assert_eq!(s.dim(2), 4);
        assert_eq!(s.numel(), 24);
        assert!(!s.is_scalar());
        assert!(Shape::scalar().is_scalar());
    }

    #[test]
    fn test_invalid_shapes() {
        assert!(matches!(
            Shape::new(vec![]),
            Err(TensorError::InvalidShape { .. })
        ));
        assert!(matches!(
            Shape::new(vec![3, 0]),
            Err(TensorError::InvalidShape { .. })
        ));
        assert!(compute_size(&[]).is_err());
        assert_eq!(compute_size(&[2, 5]).unwrap(), 10);
    }

    #[test]
    fn test_contiguous_strides() {
        assert_eq!(shape(&[2, 3, 4]).strides().0, vec![12, 4, 1]);
        assert_eq!(compute_strides(&[3, 4]), vec![4, 1]);
        assert_eq!(compute_strides(&[7]), vec![1]);
    }

    #[test]
    fn test_linear_index_bounds() {
        let s = shape(&[2, 3]);
        assert_eq!(s.linear_index(&[1, 2]).unwrap(), 5);
        assert!(matches!(
            s.linear_index(&[2, 0]),
            Err(TensorError::IndexOutOfBounds { .. })
        ));
        assert!(matches!(
            s.linear_index(&[0]),
            Err(TensorError::IndexOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_unravel_inverts_linear_index() {
        let s = shape(&[3, 1, 4, 2]);
        for linear in 0..s.numel() {
            let idx = s.unravel(linear).unwrap();
            assert_eq!(s.linear_index(&idx).unwrap(), linear);
        }
        assert!(s.unravel(s.numel()).is_err());
    }

    #[test]
    fn test_indices_row_major() {
        let s = shape(&[2, 2]);
        let all: Vec<Vec<usize>> = s.indices().collect();
        assert_eq!(all, vec![vec![0, 0], vec![0, 1], vec![1, 0], vec![1, 1]]);
        assert_eq!(shape(&[1]).indices().count(), 1);
    }

    #[test]
    fn test_broadcast_rules() {
        let a = shape(&[2, 1]);
        let b = shape(&[1, 3]);
        assert_eq!(a.broadcast_with(&b, "add").unwrap(), shape(&[2, 3]));
        assert_eq!(
            shape(&[3, 4]).broadcast_with(&shape(&[2, 3, 4]), "add").unwrap(),
            shape(&[2, 3, 4])
        );
        assert_eq!(
            shape(&[2, 3]).broadcast_with(&Shape::scalar(), "add").unwrap(),
            shape(&[2, 3])
        );
    }

    #[test]
    fn test_broadcast_incompatible() {
        let err = shape(&[2, 3]).broadcast_with(&shape(&[2, 4]), "mul");
        assert!(matches!(err, Err(TensorError::ShapeMismatch { op: "mul", .. })));
    }

    #[test]
    fn test_element_count_overflow() {
        assert!(matches!(
            Shape::new(vec![usize::MAX, 2]),
            Err(TensorError::InvalidShape {
                reason: "element count overflows usize",
                ..
            })
        ));
        assert!(compute_size(&[usize::MAX / 2, 3]).is_err());
        let wide = shape(&[usize::MAX / 2, 1]);
        assert!(matches!(
            wide.broadcast_with(&shape(&[1, 3]), "add"),
            Err(TensorError::InvalidShape { .. })
        ));
    }

    #[test]
    fn test_with_dim() {
        assert_eq!(shape(&[2, 3]).with_dim(1, 1).unwrap(), shape(&[2, 1]));
        assert!(shape(&[2, 3]).with_dim(2, 1).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(shape(&[2, 3]).to_string(), "(2, 3)");
        assert_eq!(shape(&[5]).to_string(), "(5,)");
    }
}

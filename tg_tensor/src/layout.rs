//! Shape checks for structured operations.
//!
//! Backends call these before launching a kernel so every backend reports
//! the same error for the same bad input.

use std::ops::Range;

use crate::broadcast::require_same_shape;
use crate::error::{Result, TensorError};
use crate::ops::Conv2dParams;
use crate::shape::Shape;

fn mismatch(op: &'static str, lhs: &Shape, rhs: &Shape) -> TensorError {
    TensorError::ShapeMismatch {
        op,
        lhs: lhs.clone(),
        rhs: rhs.clone(),
    }
}

/// `(..., M, K) @ (..., K, N)` with identical batch dimensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatmulDims {
    pub batch: usize,
    pub m: usize,
    pub k: usize,
    pub n: usize,
    pub out: Shape,
}

pub fn matmul_dims(a: &Shape, b: &Shape) -> Result<MatmulDims> {
    let (ra, rb) = (a.ndim(), b.ndim());
    if ra < 2 || rb < 2 || ra != rb {
        return Err(mismatch("matmul", a, b));
    }
    let (m, k) = (a.dim(ra - 2), a.dim(ra - 1));
    let (k2, n) = (b.dim(rb - 2), b.dim(rb - 1));
    if k != k2 || a.dims()[..ra - 2] != b.dims()[..rb - 2] {
        return Err(mismatch("matmul", a, b));
    }

    let mut out = a.dims()[..ra - 2].to_vec();
    out.push(m);
    out.push(n);
    Ok(MatmulDims {
        batch: a.dims()[..ra - 2].iter().product(),
        m,
        k,
        n,
        out: Shape::new(out)?,
    })
}

/// Swap of the last two axes: `(batch, rows, cols, output shape)`.
pub fn transpose_dims(x: &Shape) -> Result<(usize, usize, usize, Shape)> {
    let r = x.ndim();
    if r < 2 {
        return Err(TensorError::unsupported(
            "transpose",
            format!("needs rank >= 2, got shape {x}"),
        ));
    }
    let mut out = x.dims().to_vec();
    out.swap(r - 2, r - 1);
    let batch = x.dims()[..r - 2].iter().product();
    Ok((batch, x.dim(r - 2), x.dim(r - 1), Shape::new(out)?))
}

pub fn reshape_check(x: &Shape, target: &Shape) -> Result<()> {
    if x.numel() != target.numel() {
        return Err(mismatch("reshape", x, target));
    }
    Ok(())
}

/// `target` must broadcast to exactly `x`.
pub fn sum_to_check(x: &Shape, target: &Shape) -> Result<()> {
    match target.broadcast_with(x, "sum_to") {
        Ok(shape) if &shape == x => Ok(()),
        _ => Err(mismatch("sum_to", x, target)),
    }
}

/// Shape of `x[ranges]`; one non-empty range per dimension.
pub fn slice_shape(x: &Shape, ranges: &[Range<usize>]) -> Result<Shape> {
    if ranges.len() != x.ndim() {
        return Err(TensorError::IndexOutOfBounds {
            index: ranges.iter().map(|r| r.end).collect(),
            shape: x.clone(),
        });
    }
    let mut dims = Vec::with_capacity(ranges.len());
    for (range, &dim) in ranges.iter().zip(x.dims()) {
        if range.start >= range.end || range.end > dim {
            return Err(TensorError::IndexOutOfBounds {
                index: vec![range.start, range.end],
                shape: x.clone(),
            });
        }
        dims.push(range.end - range.start);
    }
    Shape::new(dims)
}

/// Concatenation laid out as `outer` blocks of `lhs_chunk` then `rhs_chunk` elements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcatDims {
    pub outer: usize,
    pub lhs_chunk: usize,
    pub rhs_chunk: usize,
    pub out: Shape,
}

pub fn concat_dims(a: &Shape, b: &Shape, axis: usize) -> Result<ConcatDims> {
    if axis >= a.ndim() {
        return Err(TensorError::IndexOutOfBounds {
            index: vec![axis],
            shape: a.clone(),
        });
    }
    let compatible = a.ndim() == b.ndim()
        && a
            .dims()
            .iter()
            .zip(b.dims())
            .enumerate()
            .all(|(i, (x, y))| i == axis || x == y);
    if !compatible {
        return Err(mismatch("concat", a, b));
    }

    let inner: usize = a.dims()[axis + 1..].iter().product();
    Ok(ConcatDims {
        outer: a.dims()[..axis].iter().product(),
        lhs_chunk: a.dim(axis) * inner,
        rhs_chunk: b.dim(axis) * inner,
        out: a.with_dim(axis, a.dim(axis) + b.dim(axis))?,
    })
}

/// Geometry of a single-channel SAME convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvSame {
    OneD { len: usize, k: usize },
    TwoD { h: usize, w: usize, kh: usize, kw: usize },
}

pub fn conv_same_dims(input: &Shape, kernel: &Shape) -> Result<ConvSame> {
    if input.ndim() != kernel.ndim() {
        return Err(mismatch("convolve", input, kernel));
    }
    match input.ndim() {
        1 => Ok(ConvSame::OneD {
            len: input.dim(0),
            k: kernel.dim(0),
        }),
        2 => Ok(ConvSame::TwoD {
            h: input.dim(0),
            w: input.dim(1),
            kh: kernel.dim(0),
            kw: kernel.dim(1),
        }),
        r => Err(TensorError::unsupported(
            "convolve",
            format!("only 1D and 2D inputs are supported, got rank {r}"),
        )),
    }
}

/// Geometry of a batched multi-channel convolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conv2dDims {
    pub n: usize,
    pub c: usize,
    pub h: usize,
    pub w: usize,
    pub o: usize,
    pub kh: usize,
    pub kw: usize,
    pub oh: usize,
    pub ow: usize,
    pub out: Shape,
}

pub fn conv2d_dims(
    input: &Shape,
    weight: &Shape,
    bias: Option<&Shape>,
    params: Conv2dParams,
) -> Result<Conv2dDims> {
    if input.ndim() != 4 || weight.ndim() != 4 || input.dim(1) != weight.dim(1) {
        return Err(mismatch("conv2d", input, weight));
    }
    if params.stride == 0 {
        return Err(TensorError::unsupported("conv2d", "stride must be positive"));
    }
    let (n, c, h, w) = (input.dim(0), input.dim(1), input.dim(2), input.dim(3));
    let (o, kh, kw) = (weight.dim(0), weight.dim(2), weight.dim(3));
    if let Some(bias) = bias {
        require_same_shape("conv2d bias", bias, &Shape::new(vec![o])?)?;
    }

    let pad_extent = |len: usize| {
        params
            .padding
            .checked_mul(2)
            .and_then(|p| p.checked_add(len))
            .ok_or_else(|| TensorError::unsupported("conv2d", "padding overflows usize"))
    };
    let padded_h = pad_extent(h)?;
    let padded_w = pad_extent(w)?;
    if kh > padded_h || kw > padded_w {
        return Err(mismatch("conv2d", input, weight));
    }
    let oh = (padded_h - kh) / params.stride + 1;
    let ow = (padded_w - kw) / params.stride + 1;

    Ok(Conv2dDims {
        n,
        c,
        h,
        w,
        o,
        kh,
        kw,
        oh,
        ow,
        out: Shape::new(vec![n, o, oh, ow])?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(dims: &[usize]) -> Shape {
        Shape::new(dims.to_vec()).unwrap()
    }

    #[test]
    fn test_matmul_dims() {
        let d = matmul_dims(&shape(&[3, 4]), &shape(&[4, 5])).unwrap();
        assert_eq!((d.batch, d.m, d.k, d.n), (1, 3, 4, 5));
        assert_eq!(d.out, shape(&[3, 5]));

        let d = matmul_dims(&shape(&[2, 3, 4]), &shape(&[2, 4, 1])).unwrap();
        assert_eq!(d.batch, 2);
        assert_eq!(d.out, shape(&[2, 3, 1]));
    }

    #[test]
    fn test_matmul_rejects_bad_shapes() {
        assert!(matmul_dims(&shape(&[3, 4]), &shape(&[5, 2])).is_err());
        assert!(matmul_dims(&shape(&[4]), &shape(&[4, 2])).is_err());
        assert!(matmul_dims(&shape(&[2, 3, 4]), &shape(&[3, 4, 2])).is_err());
        assert!(matmul_dims(&shape(&[2, 3, 4]), &shape(&[4, 2])).is_err());
    }

    #[test]
    fn test_sum_to_check() {
        assert!(sum_to_check(&shape(&[2, 3]), &shape(&[3])).is_ok());
        assert!(sum_to_check(&shape(&[2, 3]), &shape(&[2, 1])).is_ok());
        assert!(sum_to_check(&shape(&[2, 3]), &shape(&[2])).is_err());
        assert!(sum_to_check(&shape(&[3]), &shape(&[2, 3])).is_err());
    }

    #[test]
    fn test_slice_shape() {
        let x = shape(&[4, 5]);
        assert_eq!(slice_shape(&x, &[1..3, 0..5]).unwrap(), shape(&[2, 5]));
        assert!(slice_shape(&x, &[0..5, 0..1]).is_err());
        assert!(slice_shape(&x, &[2..2, 0..1]).is_err());
        assert!(slice_shape(&x, &[0..1]).is_err());
    }

    #[test]
    fn test_concat_dims() {
        let d = concat_dims(&shape(&[2, 3]), &shape(&[2, 4]), 1).unwrap();
        assert_eq!((d.outer, d.lhs_chunk, d.rhs_chunk), (2, 3, 4));
        assert_eq!(d.out, shape(&[2, 7]));
        assert!(concat_dims(&shape(&[2, 3]), &shape(&[3, 4]), 1).is_err());
        assert!(concat_dims(&shape(&[2, 3]), &shape(&[2, 3]), 2).is_err());
    }

    #[test]
    fn test_conv_same_dims() {
        assert_eq!(
            conv_same_dims(&shape(&[16]), &shape(&[3])).unwrap(),
            ConvSame::OneD { len: 16, k: 3 }
        );
        assert!(matches!(
            conv_same_dims(&shape(&[2, 2, 2]), &shape(&[1, 1, 1])),
            Err(TensorError::UnsupportedOperation { .. })
        ));
        assert!(matches!(
            conv_same_dims(&shape(&[4, 4]), &shape(&[3])),
            Err(TensorError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_conv2d_dims() {
        let params = Conv2dParams { stride: 2, padding: 1 };
        let (input, weight) = (shape(&[1, 3, 8, 8]), shape(&[4, 3, 3, 3]));
        let d = conv2d_dims(&input, &weight, Some(&shape(&[4])), params).unwrap();
        assert_eq!((d.oh, d.ow), (4, 4));
        assert_eq!(d.out, shape(&[1, 4, 4, 4]));

        assert!(conv2d_dims(&shape(&[1, 2, 8, 8]), &shape(&[4, 3, 3, 3]), None, params).is_err());
        assert!(conv2d_dims(&input, &weight, Some(&shape(&[3])), params).is_err());
    }

    #[test]
    fn test_conv2d_padding_overflow() {
        let params = Conv2dParams {
            stride: 1,
            padding: usize::MAX / 2 + 1,
        };
        assert!(matches!(
            conv2d_dims(&shape(&[1, 1, 4, 4]), &shape(&[1, 1, 3, 3]), None, params),
            Err(TensorError::UnsupportedOperation { op: "conv2d", .. })
        ));
    }
}

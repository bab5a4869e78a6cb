//! Direct convolution kernels.
//!
//! The SAME kernels compute `out[i] = sum_j in[i + j - p] * ker[j]` with
//! `p = (K - 1) / 2` per axis and zeros outside the input.

use rayon::prelude::*;
use rayon::ThreadPool;

use tg_tensor::layout::Conv2dDims;
use tg_tensor::Conv2dParams;

pub(crate) fn conv_same_1d(input: &[f32], kernel: &[f32]) -> Vec<f32> {
    let (len, k) = (input.len(), kernel.len());
    let pad = (k - 1) / 2;
    (0..len)
        .map(|i| {
            let mut acc = 0.0;
            for (j, &w) in kernel.iter().enumerate() {
                let pos = i + j;
                if pos >= pad && pos - pad < len {
                    acc += input[pos - pad] * w;
                }
            }
            acc
        })
        .collect()
}

pub(crate) fn conv_same_2d(
    input: &[f32],
    (h, w): (usize, usize),
    kernel: &[f32],
    (kh, kw): (usize, usize),
) -> Vec<f32> {
    let (ph, pw) = ((kh - 1) / 2, (kw - 1) / 2);
    let mut out = vec![0.0f32; h * w];
    for r in 0..h {
        for c in 0..w {
            let mut acc = 0.0;
            for i in 0..kh {
                let row = r + i;
                if row < ph || row - ph >= h {
                    continue;
                }
                for j in 0..kw {
                    let col = c + j;
                    if col < pw || col - pw >= w {
                        continue;
                    }
                    acc += input[(row - ph) * w + col - pw] * kernel[i * kw + j];
                }
            }
            out[r * w + c] = acc;
        }
    }
    out
}

/// Batched strided convolution; output planes are computed in parallel.
pub(crate) fn conv2d(
    pool: &ThreadPool,
    input: &[f32],
    weight: &[f32],
    bias: Option<&[f32]>,
    dims: &Conv2dDims,
    params: Conv2dParams,
) -> Vec<f32> {
    let Conv2dDims {
        c, h, w, o, kh, kw, oh, ow, ..
    } = *dims;
    let (stride, pad) = (params.stride, params.padding);
    let mut out = vec![0.0f32; dims.out.numel()];

    pool.install(|| {
        out.par_chunks_mut(oh * ow).enumerate().for_each(|(plane, dst)| {
            let (batch, oc) = (plane / o, plane % o);
            let base = bias.map_or(0.0, |b| b[oc]);
            for y in 0..oh {
                for x in 0..ow {
                    let mut acc = base;
                    for ic in 0..c {
                        let in_start = (batch * c + ic) * h * w;
                        let in_plane = &input[in_start..in_start + h * w];
                        let w_start = (oc * c + ic) * kh * kw;
                        let w_plane = &weight[w_start..w_start + kh * kw];
                        for i in 0..kh {
                            let row = y * stride + i;
                            if row < pad || row - pad >= h {
                                continue;
                            }
                            for j in 0..kw {
                                let col = x * stride + j;
                                if col < pad || col - pad >= w {
                                    continue;
                                }
                                acc += in_plane[(row - pad) * w + col - pad] * w_plane[i * kw + j];
                            }
                        }
                    }
                    dst[y * ow + x] = acc;
                }
            }
        });
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conv_same_1d_box_filter() {
        let out = conv_same_1d(&[1.0, 2.0, 3.0, 4.0], &[1.0, 1.0, 1.0]);
        assert_eq!(out, vec![3.0, 6.0, 9.0, 7.0]);
    }

    #[test]
    fn test_conv_same_1d_is_correlation() {
        // An asymmetric kernel is applied without flipping.
        let out = conv_same_1d(&[0.0, 1.0, 0.0], &[1.0, 2.0, 3.0]);
        assert_eq!(out, vec![3.0, 2.0, 1.0]);
    }

    #[test]
    fn test_conv_same_1d_even_kernel() {
        // K = 2 gives p = 0, so out[i] = in[i] * k0 + in[i + 1] * k1.
        let out = conv_same_1d(&[1.0, 2.0, 3.0], &[1.0, 10.0]);
        assert_eq!(out, vec![21.0, 32.0, 3.0]);
    }

    #[test]
    fn test_conv_same_2d_identity_kernel() {
        let input: Vec<f32> = (0..12).map(|v| v as f32).collect();
        let kernel = [0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0];
        assert_eq!(conv_same_2d(&input, (3, 4), &kernel, (3, 3)), input);
    }
}

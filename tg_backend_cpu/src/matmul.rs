//! Matrix multiplication kernels.
//!
//! One kernel is selected per backend instance. Batches run in parallel on the
//! backend's worker pool, one output matrix per task.

use std::fmt;

use rayon::prelude::*;
use rayon::ThreadPool;

use crate::simd;

/// Default tile edge for the cache-blocked kernel.
pub const DEFAULT_BLOCK_SIZE: usize = 64;

/// Single-matrix kernel strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatmulKernel {
    /// Straightforward i-j-k triple loop.
    Naive,
    /// Cache-blocked i-k-j loop over square tiles.
    Blocked,
    /// Row-oriented loop with vectorized `axpy` updates.
    Simd,
}

impl MatmulKernel {
    /// Best kernel for this machine.
    pub fn detect() -> Self {
        if simd::available() {
            MatmulKernel::Simd
        } else {
            MatmulKernel::Blocked
        }
    }
}

impl fmt::Display for MatmulKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MatmulKernel::Naive => "naive",
            MatmulKernel::Blocked => "blocked",
            MatmulKernel::Simd => "simd",
        };
        f.write_str(name)
    }
}

/// `c = a @ b` for one `(m, k) x (k, n)` pair. `c` must be zeroed.
pub(crate) fn matmul_into(
    kernel: MatmulKernel,
    block: usize,
    a: &[f32],
    b: &[f32],
    c: &mut [f32],
    (m, k, n): (usize, usize, usize),
) {
    match kernel {
        MatmulKernel::Naive => naive(a, b, c, m, k, n),
        MatmulKernel::Blocked => blocked(a, b, c, m, k, n, block.max(1)),
        MatmulKernel::Simd => vectorized(a, b, c, m, k, n),
    }
}

fn naive(a: &[f32], b: &[f32], c: &mut [f32], m: usize, k: usize, n: usize) {
    for i in 0..m {
        for j in 0..n {
            let mut sum = 0.0;
            for l in 0..k {
                sum += a[i * k + l] * b[l * n + j];
            }
            c[i * n + j] = sum;
        }
    }
}

fn blocked(a: &[f32], b: &[f32], c: &mut [f32], m: usize, k: usize, n: usize, bs: usize) {
    for i0 in (0..m).step_by(bs) {
        let i_end = (i0 + bs).min(m);
        for l0 in (0..k).step_by(bs) {
            let l_end = (l0 + bs).min(k);
            for j0 in (0..n).step_by(bs) {
                let j_end = (j0 + bs).min(n);
                for i in i0..i_end {
                    for l in l0..l_end {
                        let a_il = a[i * k + l];
                        let b_row = &b[l * n + j0..l * n + j_end];
                        let c_row = &mut c[i * n + j0..i * n + j_end];
                        for (cv, &bv) in c_row.iter_mut().zip(b_row) {
                            *cv += a_il * bv;
                        }
                    }
                }
            }
        }
    }
}

fn vectorized(a: &[f32], b: &[f32], c: &mut [f32], m: usize, k: usize, n: usize) {
    for i in 0..m {
        let c_row = &mut c[i * n..(i + 1) * n];
        for l in 0..k {
            simd::axpy_f32(a[i * k + l], &b[l * n..(l + 1) * n], c_row);
        }
    }
}

/// Batched product of contiguous `(batch, m, k)` and `(batch, k, n)` buffers.
pub(crate) fn batched(
    pool: &ThreadPool,
    kernel: MatmulKernel,
    block: usize,
    a: &[f32],
    b: &[f32],
    (batch, m, k, n): (usize, usize, usize, usize),
) -> Vec<f32> {
    let mut out = vec![0.0f32; batch * m * n];
    if batch == 1 {
        matmul_into(kernel, block, a, b, &mut out, (m, k, n));
        return out;
    }

    pool.install(|| {
        out.par_chunks_mut(m * n).enumerate().for_each(|(idx, c)| {
            let a_mat = &a[idx * m * k..(idx + 1) * m * k];
            let b_mat = &b[idx * k * n..(idx + 1) * k * n];
            matmul_into(kernel, block, a_mat, b_mat, c, (m, k, n));
        });
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const KERNELS: [MatmulKernel; 3] = [
        MatmulKernel::Naive,
        MatmulKernel::Blocked,
        MatmulKernel::Simd,
    ];

    fn reference(a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
        let mut c = vec![0.0; m * n];
        naive(a, b, &mut c, m, k, n);
        c
    }

    #[test]
    fn test_small_product_all_kernels() {
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let b = [7.0, 8.0, 9.0, 10.0, 11.0, 12.0];
        for kernel in KERNELS {
            let mut c = vec![0.0; 4];
            matmul_into(kernel, 2, &a, &b, &mut c, (2, 3, 2));
            assert_eq!(c, vec![58.0, 64.0, 139.0, 154.0], "{kernel}");
        }
    }

    #[test]
    fn test_kernels_agree_on_ragged_tiles() {
        let (m, k, n) = (37, 19, 23);
        let a: Vec<f32> = (0..m * k).map(|i| ((i * 7) % 13) as f32 * 0.1 - 0.6).collect();
        let b: Vec<f32> = (0..k * n).map(|i| ((i * 5) % 11) as f32 * 0.2 - 1.0).collect();
        let expected = reference(&a, &b, m, k, n);

        for kernel in KERNELS {
            let mut c = vec![0.0; m * n];
            matmul_into(kernel, 8, &a, &b, &mut c, (m, k, n));
            for (x, y) in c.iter().zip(&expected) {
                assert!((x - y).abs() < 1e-4, "{kernel}: {x} vs {y}");
            }
        }
    }

    #[test]
    fn test_batched_on_pool() {
        let pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();
        // Two batches of 2x2 identity times a distinct matrix.
        let a = [1.0, 0.0, 0.0, 1.0, 2.0, 0.0, 0.0, 2.0];
        let b = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
        let c = batched(&pool, MatmulKernel::Blocked, 64, &a, &b, (2, 2, 2, 2));
        assert_eq!(c, vec![1.0, 2.0, 3.0, 4.0, 10.0, 12.0, 14.0, 16.0]);
    }
}

//! SIMD kernels for CPU tensor operations.
//!
//! AVX2 on x86_64 (detected at runtime), NEON on aarch64, scalar loops elsewhere.

#![allow(unreachable_code)]

/// Check if AVX2 is available (x86_64 only).
#[cfg(target_arch = "x86_64")]
pub fn has_avx2() -> bool {
    is_x86_feature_detected!("avx2")
}

#[cfg(not(target_arch = "x86_64"))]
pub fn has_avx2() -> bool {
    false
}

/// NEON is mandatory on aarch64.
#[cfg(target_arch = "aarch64")]
pub fn has_neon() -> bool {
    true
}

#[cfg(not(target_arch = "aarch64"))]
pub fn has_neon() -> bool {
    false
}

/// Whether any vector instruction path is available.
pub fn available() -> bool {
    has_avx2() || has_neon()
}

// Elementwise `out[i] = a[i] <op> b[i]` for each vector instruction set.
macro_rules! lanewise {
    ($name:ident, $avx:ident, $neon:ident, $scalar:ident, $mm:ident, $vq:ident, $op:tt) => {
        pub fn $name(a: &[f32], b: &[f32], out: &mut [f32]) {
            debug_assert!(a.len() == b.len() && a.len() == out.len());

            #[cfg(target_arch = "x86_64")]
            {
                if has_avx2() {
                    // SAFETY: AVX2 support was checked above.
                    unsafe { $avx(a, b, out) };
                    return;
                }
            }

            #[cfg(target_arch = "aarch64")]
            {
                // SAFETY: NEON is mandatory on aarch64.
                unsafe { $neon(a, b, out) };
                return;
            }

            $scalar(a, b, out);
        }

        fn $scalar(a: &[f32], b: &[f32], out: &mut [f32]) {
            for ((o, &x), &y) in out.iter_mut().zip(a).zip(b) {
                *o = x $op y;
            }
        }

        #[cfg(target_arch = "x86_64")]
        #[target_feature(enable = "avx2")]
        unsafe fn $avx(a: &[f32], b: &[f32], out: &mut [f32]) {
            use std::arch::x86_64::*;

            let n = a.len();
            let chunks = n / 8;
            let (a_ptr, b_ptr, out_ptr) = (a.as_ptr(), b.as_ptr(), out.as_mut_ptr());

            for i in 0..chunks {
                let offset = i * 8;
                let va = _mm256_loadu_ps(a_ptr.add(offset));
                let vb = _mm256_loadu_ps(b_ptr.add(offset));
                _mm256_storeu_ps(out_ptr.add(offset), $mm(va, vb));
            }

            for i in chunks * 8..n {
                *out_ptr.add(i) = *a_ptr.add(i) $op *b_ptr.add(i);
            }
        }

        #[cfg(target_arch = "aarch64")]
        unsafe fn $neon(a: &[f32], b: &[f32], out: &mut [f32]) {
            use std::arch::aarch64::*;

            let n = a.len();
            let chunks = n / 4;
            let (a_ptr, b_ptr, out_ptr) = (a.as_ptr(), b.as_ptr(), out.as_mut_ptr());

            for i in 0..chunks {
                let offset = i * 4;
                let va = vld1q_f32(a_ptr.add(offset));
                let vb = vld1q_f32(b_ptr.add(offset));
                vst1q_f32(out_ptr.add(offset), $vq(va, vb));
            }

            for i in chunks * 4..n {
                *out_ptr.add(i) = *a_ptr.add(i) $op *b_ptr.add(i);
            }
        }
    };
}

lanewise!(add_f32, add_f32_avx2, add_f32_neon, add_f32_scalar, _mm256_add_ps, vaddq_f32, +);
lanewise!(sub_f32, sub_f32_avx2, sub_f32_neon, sub_f32_scalar, _mm256_sub_ps, vsubq_f32, -);
lanewise!(mul_f32, mul_f32_avx2, mul_f32_neon, mul_f32_scalar, _mm256_mul_ps, vmulq_f32, *);

/// `y += alpha * x`, the inner step of the row-oriented matmul kernel.
pub fn axpy_f32(alpha: f32, x: &[f32], y: &mut [f32]) {
    debug_assert_eq!(x.len(), y.len());

    #[cfg(target_arch = "x86_64")]
    {
        if has_avx2() {
            // SAFETY: AVX2 support was checked above.
            unsafe { axpy_f32_avx2(alpha, x, y) };
            return;
        }
    }

    #[cfg(target_arch = "aarch64")]
    {
        // SAFETY: NEON is mandatory on aarch64.
        unsafe { axpy_f32_neon(alpha, x, y) };
        return;
    }

    for (yi, &xi) in y.iter_mut().zip(x) {
        *yi += alpha * xi;
    }
}

/// Sum of all elements.
pub fn sum_f32(a: &[f32]) -> f32 {
    #[cfg(target_arch = "x86_64")]
    {
        if has_avx2() {
            return unsafe { sum_f32_avx2(a) };
        }
    }

    #[cfg(target_arch = "aarch64")]
    {
        return unsafe { sum_f32_neon(a) };
    }

    a.iter().sum()
}

/// Inner product of two equal-length slices.
pub fn dot_f32(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());

    #[cfg(target_arch = "x86_64")]
    {
        if has_avx2() {
            return unsafe { dot_f32_avx2(a, b) };
        }
    }

    #[cfg(target_arch = "aarch64")]
    {
        return unsafe { dot_f32_neon(a, b) };
    }

    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

// === AVX2 implementations (x86_64) ===

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn axpy_f32_avx2(alpha: f32, x: &[f32], y: &mut [f32]) {
    use std::arch::x86_64::*;

    let n = x.len();
    let chunks = n / 8;
    let va = _mm256_set1_ps(alpha);
    let (x_ptr, y_ptr) = (x.as_ptr(), y.as_mut_ptr());

    for i in 0..chunks {
        let offset = i * 8;
        let vx = _mm256_loadu_ps(x_ptr.add(offset));
        let vy = _mm256_loadu_ps(y_ptr.add(offset));
        _mm256_storeu_ps(y_ptr.add(offset), _mm256_add_ps(vy, _mm256_mul_ps(va, vx)));
    }

    for i in chunks * 8..n {
        *y_ptr.add(i) += alpha * *x_ptr.add(i);
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn hsum256(acc: std::arch::x86_64::__m256) -> f32 {
    use std::arch::x86_64::*;

    let low = _mm256_castps256_ps128(acc);
    let high = _mm256_extractf128_ps(acc, 1);
    let sum128 = _mm_add_ps(low, high);
    let sum64 = _mm_add_ps(sum128, _mm_movehl_ps(sum128, sum128));
    let sum32 = _mm_add_ss(sum64, _mm_shuffle_ps(sum64, sum64, 1));
    _mm_cvtss_f32(sum32)
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn sum_f32_avx2(a: &[f32]) -> f32 {
    use std::arch::x86_64::*;

    let n = a.len();
    let chunks = n / 8;
    let a_ptr = a.as_ptr();
    let mut acc = _mm256_setzero_ps();

    for i in 0..chunks {
        acc = _mm256_add_ps(acc, _mm256_loadu_ps(a_ptr.add(i * 8)));
    }

    let mut result = hsum256(acc);
    for i in chunks * 8..n {
        result += *a_ptr.add(i);
    }
    result
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn dot_f32_avx2(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::*;

    let n = a.len();
    let chunks = n / 8;
    let (a_ptr, b_ptr) = (a.as_ptr(), b.as_ptr());
    let mut acc = _mm256_setzero_ps();

    for i in 0..chunks {
        let va = _mm256_loadu_ps(a_ptr.add(i * 8));
        let vb = _mm256_loadu_ps(b_ptr.add(i * 8));
        acc = _mm256_add_ps(acc, _mm256_mul_ps(va, vb));
    }

    let mut result = hsum256(acc);
    for i in chunks * 8..n {
        result += *a_ptr.add(i) * *b_ptr.add(i);
    }
    result
}

// === NEON implementations (aarch64) ===

#[cfg(target_arch = "aarch64")]
unsafe fn axpy_f32_neon(alpha: f32, x: &[f32], y: &mut [f32]) {
    use std::arch::aarch64::*;

    let n = x.len();
    let chunks = n / 4;
    let va = vdupq_n_f32(alpha);
    let (x_ptr, y_ptr) = (x.as_ptr(), y.as_mut_ptr());

    for i in 0..chunks {
        let offset = i * 4;
        let vx = vld1q_f32(x_ptr.add(offset));
        let vy = vld1q_f32(y_ptr.add(offset));
        vst1q_f32(y_ptr.add(offset), vfmaq_f32(vy, va, vx));
    }

    for i in chunks * 4..n {
        *y_ptr.add(i) += alpha * *x_ptr.add(i);
    }
}

#[cfg(target_arch = "aarch64")]
unsafe fn sum_f32_neon(a: &[f32]) -> f32 {
    use std::arch::aarch64::*;

    let n = a.len();
    let chunks = n / 4;
    let a_ptr = a.as_ptr();
    let mut acc = vdupq_n_f32(0.0);

    for i in 0..chunks {
        acc = vaddq_f32(acc, vld1q_f32(a_ptr.add(i * 4)));
    }

    let mut result = vaddvq_f32(acc);
    for i in chunks * 4..n {
        result += *a_ptr.add(i);
    }
    result
}

#[cfg(target_arch = "aarch64")]
unsafe fn dot_f32_neon(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::aarch64::*;

    let n = a.len();
    let chunks = n / 4;
    let (a_ptr, b_ptr) = (a.as_ptr(), b.as_ptr());
    let mut acc = vdupq_n_f32(0.0);

    for i in 0..chunks {
        let va = vld1q_f32(a_ptr.add(i * 4));
        let vb = vld1q_f32(b_ptr.add(i * 4));
        acc = vfmaq_f32(acc, va, vb);
    }

    let mut result = vaddvq_f32(acc);
    for i in chunks * 4..n {
        result += *a_ptr.add(i) * *b_ptr.add(i);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_sub_mul_f32() {
        let a: Vec<f32> = (1..=11).map(|v| v as f32).collect();
        let b: Vec<f32> = (1..=11).rev().map(|v| v as f32).collect();
        let mut out = vec![0.0; 11];

        add_f32(&a, &b, &mut out);
        assert_eq!(out, vec![12.0; 11]);

        sub_f32(&a, &a, &mut out);
        assert_eq!(out, vec![0.0; 11]);

        mul_f32(&a[..4], &[2.0; 4], &mut out[..4]);
        assert_eq!(&out[..4], &[2.0, 4.0, 6.0, 8.0]);
    }

    #[test]
    fn test_axpy_f32() {
        let x: Vec<f32> = (0..10).map(|v| v as f32).collect();
        let mut y = vec![1.0; 10];
        axpy_f32(2.0, &x, &mut y);
        let expected: Vec<f32> = (0..10).map(|v| 1.0 + 2.0 * v as f32).collect();
        assert_eq!(y, expected);
    }

    #[test]
    fn test_sum_and_dot_f32() {
        let a: Vec<f32> = (1..=10).map(|v| v as f32).collect();
        assert!((sum_f32(&a) - 55.0).abs() < 1e-6);
        assert!((dot_f32(&a, &a) - 385.0).abs() < 1e-4);
        assert_eq!(sum_f32(&[]), 0.0);
    }
}

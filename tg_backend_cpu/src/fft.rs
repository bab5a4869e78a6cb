//! FFT-based SAME convolution.
//!
//! The kernel is flipped so the full linear convolution equals the
//! correlation computed by the direct kernels; both operands are zero padded
//! to a power of two at least `N + K - 1` long, so there is no circular wrap.
//! The SAME window starts at `K - 1 - p` along each axis.

use num_complex::Complex;
use rustfft::FftPlanner;

fn padded_len(n: usize, k: usize) -> usize {
    (n + k - 1).next_power_of_two()
}

pub(crate) fn conv_same_1d(input: &[f32], kernel: &[f32]) -> Vec<f32> {
    let (n, k) = (input.len(), kernel.len());
    let len = padded_len(n, k);

    let mut signal = vec![Complex::new(0.0f32, 0.0); len];
    for (slot, &v) in signal.iter_mut().zip(input) {
        *slot = Complex::new(v, 0.0);
    }
    let mut filter = vec![Complex::new(0.0f32, 0.0); len];
    for (j, &v) in kernel.iter().rev().enumerate() {
        filter[j] = Complex::new(v, 0.0);
    }

    let mut planner = FftPlanner::<f32>::new();
    let forward = planner.plan_fft_forward(len);
    let inverse = planner.plan_fft_inverse(len);
    forward.process(&mut signal);
    forward.process(&mut filter);
    for (s, f) in signal.iter_mut().zip(&filter) {
        *s *= f;
    }
    inverse.process(&mut signal);

    let start = k - 1 - (k - 1) / 2;
    let scale = 1.0 / len as f32;
    signal[start..start + n].iter().map(|c| c.re * scale).collect()
}

pub(crate) fn conv_same_2d(
    input: &[f32],
    (h, w): (usize, usize),
    kernel: &[f32],
    (kh, kw): (usize, usize),
) -> Vec<f32> {
    let (rows, cols) = (padded_len(h, kh), padded_len(w, kw));

    let mut signal = vec![Complex::new(0.0f32, 0.0); rows * cols];
    for r in 0..h {
        for c in 0..w {
            signal[r * cols + c] = Complex::new(input[r * w + c], 0.0);
        }
    }
    let mut filter = vec![Complex::new(0.0f32, 0.0); rows * cols];
    for i in 0..kh {
        for j in 0..kw {
            filter[i * cols + j] = Complex::new(kernel[(kh - 1 - i) * kw + (kw - 1 - j)], 0.0);
        }
    }

    let mut planner = FftPlanner::<f32>::new();
    fft2(&mut planner, &mut signal, rows, cols, false);
    fft2(&mut planner, &mut filter, rows, cols, false);
    for (s, f) in signal.iter_mut().zip(&filter) {
        *s *= f;
    }
    fft2(&mut planner, &mut signal, rows, cols, true);

    let (r0, c0) = (kh - 1 - (kh - 1) / 2, kw - 1 - (kw - 1) / 2);
    let scale = 1.0 / (rows * cols) as f32;
    let mut out = Vec::with_capacity(h * w);
    for r in 0..h {
        for c in 0..w {
            out.push(signal[(r0 + r) * cols + c0 + c].re * scale);
        }
    }
    out
}

/// Unnormalized 2D transform of a row-major `rows x cols` grid.
fn fft2(
    planner: &mut FftPlanner<f32>,
    grid: &mut [Complex<f32>],
    rows: usize,
    cols: usize,
    inverse: bool,
) {
    let (row_plan, col_plan) = if inverse {
        (planner.plan_fft_inverse(cols), planner.plan_fft_inverse(rows))
    } else {
        (planner.plan_fft_forward(cols), planner.plan_fft_forward(rows))
    };

    for row in grid.chunks_mut(cols) {
        row_plan.process(row);
    }

    let mut column = vec![Complex::new(0.0f32, 0.0); rows];
    for c in 0..cols {
        for (r, slot) in column.iter_mut().enumerate() {
            *slot = grid[r * cols + c];
        }
        col_plan.process(&mut column);
        for (r, value) in column.iter().enumerate() {
            grid[r * cols + c] = *value;
        }
    }
}

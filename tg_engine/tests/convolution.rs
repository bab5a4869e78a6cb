//! Direct, FFT and batched convolution.

use approx::assert_relative_eq;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tg_engine::prelude::*;

fn ctx() -> ComputeContext {
    ComputeContext::cpu_only().unwrap()
}

fn assert_close(a: &Tensor, b: &Tensor, tol: f32) {
    assert_eq!(a.dims(), b.dims());
    for (x, y) in a.to_vec().unwrap().iter().zip(b.to_vec().unwrap()) {
        assert_relative_eq!(*x, y, epsilon = tol);
    }
}

#[test]
fn test_direct_matches_fft_1d() {
    let ctx = ctx();
    let mut rng = StdRng::seed_from_u64(11);
    let input = ctx.random_with(&[16], &mut rng).unwrap();
    for k in [3, 40] {
        let kernel = ctx.random_with(&[k], &mut rng).unwrap();
        let direct = input.convolve_direct(&kernel).unwrap();
        let fft = input.convolve_fft(&kernel).unwrap();
        assert_eq!(direct.dims(), vec![16]);
        assert_close(&direct, &fft, 1e-4);
    }
}

#[test]
fn test_direct_matches_fft_2d() {
    let ctx = ctx();
    let mut rng = StdRng::seed_from_u64(12);
    let input = ctx.random_with(&[9, 12], &mut rng).unwrap();
    for (kh, kw) in [(3, 3), (4, 5), (7, 7)] {
        let kernel = ctx.random_with(&[kh, kw], &mut rng).unwrap();
        let direct = input.convolve_direct(&kernel).unwrap();
        let fft = input.convolve_fft(&kernel).unwrap();
        assert_eq!(direct.dims(), vec![9, 12]);
        assert_close(&direct, &fft, 1e-4);
    }
}

#[test]
fn test_convolve_known_values() {
    let ctx = ctx();
    let input = ctx.from_values(&[5], vec![1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
    let kernel = ctx.from_values(&[3], vec![1.0, 0.0, -1.0]).unwrap();
    // out[i] = in[i-1] - in[i+1], zero padded
    assert_eq!(
        input.convolve(&kernel).unwrap().to_vec().unwrap(),
        vec![-2.0, -2.0, -2.0, -2.0, 4.0]
    );
}

#[test]
fn test_threshold_selects_path_transparently() {
    let low = ComputeContext::new(ComputeConfig {
        fft_threshold: 1,
        ..ComputeConfig::cpu_only()
    })
    .unwrap();
    let high = ctx();

    let values: Vec<f32> = (0..32).map(|i| (i as f32 * 0.7).sin()).collect();
    let kernel_values: Vec<f32> = (0..5).map(|i| i as f32 - 2.0).collect();
    let a = low
        .from_values(&[32], values.clone())
        .unwrap()
        .convolve(&low.from_values(&[5], kernel_values.clone()).unwrap())
        .unwrap();
    let b = high
        .from_values(&[32], values)
        .unwrap()
        .convolve(&high.from_values(&[5], kernel_values).unwrap())
        .unwrap();
    for (x, y) in a.to_vec().unwrap().iter().zip(b.to_vec().unwrap()) {
        assert_relative_eq!(*x, y, epsilon = 1e-4);
    }
}

#[test]
fn test_convolve_rank_errors() {
    let ctx = ctx();
    let cube = ctx.ones(&[2, 2, 2]).unwrap();
    assert!(matches!(
        cube.convolve(&ctx.ones(&[1, 1, 1]).unwrap()),
        Err(TensorError::UnsupportedOperation { .. })
    ));
    let line = ctx.ones(&[8]).unwrap();
    assert!(matches!(
        line.convolve(&ctx.ones(&[3, 3]).unwrap()),
        Err(TensorError::ShapeMismatch { .. })
    ));
}

#[test]
fn test_conv2d_same_padding_matches_direct() {
    let ctx = ctx();
    let mut rng = StdRng::seed_from_u64(14);
    let image = ctx.random_with(&[6, 7], &mut rng).unwrap();
    for k in [1, 3, 5] {
        let kernel = ctx.random_with(&[k, k], &mut rng).unwrap();
        let expected = image.convolve_direct(&kernel).unwrap();

        let out = image
            .reshape(&[1, 1, 6, 7])
            .unwrap()
            .conv2d(
                &kernel.reshape(&[1, 1, k, k]).unwrap(),
                None,
                Conv2dParams {
                    stride: 1,
                    padding: (k - 1) / 2,
                },
            )
            .unwrap();
        assert_eq!(out.dims(), vec![1, 1, 6, 7]);
        assert_close(&out.reshape(&[6, 7]).unwrap(), &expected, 1e-5);
    }
}

#[test]
fn test_conv2d_batched_strided_with_bias() {
    let ctx = ctx();
    let input = ctx.ones(&[2, 3, 5, 5]).unwrap();
    let weight = ctx.ones(&[4, 3, 3, 3]).unwrap();
    let bias = ctx.from_values(&[4], vec![0.0, 1.0, 2.0, 3.0]).unwrap();
    let out = input
        .conv2d(
            &weight,
            Some(&bias),
            Conv2dParams {
                stride: 2,
                padding: 1,
            },
        )
        .unwrap();
    // (5 + 2 - 3) / 2 + 1 = 3
    assert_eq!(out.dims(), vec![2, 4, 3, 3]);
    // Corner windows see 2x2 valid pixels per channel, the centre sees 3x3.
    assert_eq!(out.get(&[0, 0, 0, 0]).unwrap(), 12.0);
    assert_eq!(out.get(&[1, 2, 1, 1]).unwrap(), 27.0 + 2.0);
    assert_eq!(out.get(&[1, 3, 0, 1]).unwrap(), 18.0 + 3.0);
}

#[test]
fn test_conv2d_shape_errors() {
    let ctx = ctx();
    let input = ctx.ones(&[1, 2, 4, 4]).unwrap();
    assert!(matches!(
        input.conv2d(&ctx.ones(&[1, 3, 3, 3]).unwrap(), None, Conv2dParams::default()),
        Err(TensorError::ShapeMismatch { .. })
    ));
    assert!(matches!(
        input.conv2d(
            &ctx.ones(&[2, 2, 3, 3]).unwrap(),
            Some(&ctx.ones(&[3]).unwrap()),
            Conv2dParams::default()
        ),
        Err(TensorError::ShapeMismatch { .. })
    ));
}

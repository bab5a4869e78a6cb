//! Configuration files and their effect on a compute context.

use std::fs;

use tg_engine::prelude::*;
use tg_engine::KernelChoice;

#[test]
fn test_context_from_file() {
    let path = std::env::temp_dir().join(format!("tg_engine_config_{}.toml", std::process::id()));
    fs::write(
        &path,
        r#"
threads = 2
matmul_kernel = "blocked"
block_size = 16
fft_threshold = 8
enable_gpu = false
"#,
    )
    .unwrap();

    let config = ComputeConfig::from_file(&path).unwrap();
    fs::remove_file(&path).unwrap();
    assert_eq!(config.matmul_kernel, KernelChoice::Blocked);
    assert_eq!(config.fft_threshold, 8);

    let ctx = ComputeContext::new(config).unwrap();
    assert_eq!(ctx.cpu().threads(), 2);
    assert!(!ctx.gpu_available());

    let a = ctx.identity(3).unwrap();
    let b = ctx.from_values(&[3, 2], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
    assert_eq!(a.matmul(&b).unwrap().to_vec().unwrap(), b.to_vec().unwrap());
}

#[test]
fn test_missing_file_is_config_error() {
    assert!(matches!(
        ComputeConfig::from_file("/nonexistent/tg_engine.toml"),
        Err(TensorError::Config(_))
    ));
}

#[test]
fn test_invalid_config_rejected_by_context() {
    let config = ComputeConfig {
        block_size: 0,
        ..ComputeConfig::cpu_only()
    };
    assert!(matches!(
        ComputeContext::new(config),
        Err(TensorError::Config(_))
    ));
}

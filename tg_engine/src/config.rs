//! Compute configuration loaded from TOML or built programmatically.
//!
//! # TOML Format
//! ```toml
//! threads = 8
//! matmul_kernel = "blocked"
//! block_size = 64
//! fft_threshold = 32
//! enable_gpu = false
//! gpu_work_group = 16
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tg_backend_cpu::{CpuOptions, MatmulKernel, DEFAULT_BLOCK_SIZE};
use tg_backend_opencl::{GpuOptions, DEFAULT_WORK_GROUP};
use tg_tensor::{Result, TensorError};

/// Kernels above this many elements take the FFT convolution path.
pub const DEFAULT_FFT_THRESHOLD: usize = 32;

/// Largest accepted matmul tile edge.
const MAX_WORK_GROUP: usize = 32;

/// Matmul kernel selection. `Auto` picks from CPU capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelChoice {
    #[default]
    Auto,
    Naive,
    Blocked,
    Simd,
}

impl KernelChoice {
    pub fn resolve(self) -> MatmulKernel {
        match self {
            KernelChoice::Auto => MatmulKernel::detect(),
            KernelChoice::Naive => MatmulKernel::Naive,
            KernelChoice::Blocked => MatmulKernel::Blocked,
            KernelChoice::Simd => MatmulKernel::Simd,
        }
    }
}

/// Settings for one [`ComputeContext`](crate::ComputeContext).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeConfig {
    /// Worker threads (defaults to the number of online CPU cores).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threads: Option<usize>,
    pub matmul_kernel: KernelChoice,
    /// Tile edge of the blocked matmul kernel.
    pub block_size: usize,
    /// `convolve` switches to FFT when the kernel has more elements than this.
    pub fft_threshold: usize,
    /// Try to initialize the GPU on first use.
    pub enable_gpu: bool,
    pub gpu_work_group: usize,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            threads: None,
            matmul_kernel: KernelChoice::Auto,
            block_size: DEFAULT_BLOCK_SIZE,
            fft_threshold: DEFAULT_FFT_THRESHOLD,
            enable_gpu: true,
            gpu_work_group: DEFAULT_WORK_GROUP,
        }
    }
}

impl ComputeConfig {
    /// Default settings with the GPU disabled.
    pub fn cpu_only() -> Self {
        Self {
            enable_gpu: false,
            ..Self::default()
        }
    }

    /// Loads and validates configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            TensorError::Config(format!("cannot read config '{}': {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    /// Parses and validates configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: Self = toml::from_str(toml_str)
            .map_err(|e| TensorError::Config(format!("TOML parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| TensorError::Config(format!("TOML serialise error: {e}")))
    }

    pub fn validate(&self) -> Result<()> {
        if self.threads == Some(0) {
            return Err(TensorError::Config("threads must be at least 1".into()));
        }
        if self.block_size == 0 {
            return Err(TensorError::Config("block_size must be at least 1".into()));
        }
        if !(1..=MAX_WORK_GROUP).contains(&self.gpu_work_group) {
            return Err(TensorError::Config(format!(
                "gpu_work_group must be in 1..={MAX_WORK_GROUP}, got {}",
                self.gpu_work_group
            )));
        }
        Ok(())
    }

    /// Resolves the number of worker threads.
    pub fn resolve_threads(&self) -> usize {
        self.threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        })
    }

    pub fn cpu_options(&self) -> CpuOptions {
        CpuOptions {
            threads: self.resolve_threads(),
            kernel: self.matmul_kernel.resolve(),
            block_size: self.block_size,
        }
    }

    pub fn gpu_options(&self) -> GpuOptions {
        GpuOptions {
            work_group: self.gpu_work_group,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default() {
        let c = ComputeConfig::default();
        assert_eq!(c.block_size, 64);
        assert_eq!(c.fft_threshold, 32);
        assert_eq!(c.gpu_work_group, 16);
        assert!(c.enable_gpu);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_from_toml() {
        let toml = r#"
threads = 2
matmul_kernel = "naive"
enable_gpu = false
"#;
        let c = ComputeConfig::from_toml(toml).unwrap();
        assert_eq!(c.threads, Some(2));
        assert_eq!(c.matmul_kernel, KernelChoice::Naive);
        assert!(!c.enable_gpu);
        // Unset keys keep their defaults.
        assert_eq!(c.fft_threshold, DEFAULT_FFT_THRESHOLD);
        assert_eq!(c.cpu_options().kernel, MatmulKernel::Naive);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            ComputeConfig::from_toml("threads = 0"),
            Err(TensorError::Config(_))
        ));
        assert!(matches!(
            ComputeConfig::from_toml("gpu_work_group = 64"),
            Err(TensorError::Config(_))
        ));
        assert!(matches!(
            ComputeConfig::from_toml("matmul_kernel = \"fastest\""),
            Err(TensorError::Config(_))
        ));
    }

    #[test]
    fn test_toml_roundtrip() {
        let c = ComputeConfig {
            threads: Some(3),
            matmul_kernel: KernelChoice::Blocked,
            block_size: 32,
            ..ComputeConfig::cpu_only()
        };
        let text = c.to_toml().unwrap();
        assert_eq!(ComputeConfig::from_toml(&text).unwrap(), c);
    }

    #[test]
    fn test_resolve_threads() {
        assert_eq!(ComputeConfig { threads: Some(5), ..Default::default() }.resolve_threads(), 5);
        assert!(ComputeConfig::default().resolve_threads() >= 1);
    }
}

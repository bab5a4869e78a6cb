//! The compute context: configuration, backends and tensor factories.

use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::Rng;
use tg_backend_cpu::{CpuBackend, CpuTensor};
use tg_backend_opencl::GpuBackend;
use tg_tensor::{Result, Shape, TensorError};

use crate::config::ComputeConfig;
use crate::storage::Storage;
use crate::tensor::Tensor;

enum GpuSlot {
    Uninit,
    Ready(GpuBackend),
    Failed(String),
    Shutdown,
}

struct ContextInner {
    config: ComputeConfig,
    cpu: CpuBackend,
    gpu: Mutex<GpuSlot>,
    fallback_logged: AtomicBool,
}

/// Owns the CPU worker pool and the lazily created GPU backend.
///
/// Cloning is cheap and every clone refers to the same backends. Tensors keep
/// a handle to the context that created them.
#[derive(Clone)]
pub struct ComputeContext(Arc<ContextInner>);

impl fmt::Debug for ComputeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeContext")
            .field("config", &self.0.config)
            .field("cpu", &self.0.cpu)
            .finish()
    }
}

impl ComputeContext {
    pub fn new(config: ComputeConfig) -> Result<Self> {
        config.validate()?;
        let cpu = CpuBackend::new(config.cpu_options())?;
        tracing::info!(
            threads = cpu.threads(),
            kernel = %cpu.kernel(),
            gpu = config.enable_gpu,
            "compute context created"
        );
        Ok(Self(Arc::new(ContextInner {
            config,
            cpu,
            gpu: Mutex::new(GpuSlot::Uninit),
            fallback_logged: AtomicBool::new(false),
        })))
    }

    pub fn cpu_only() -> Result<Self> {
        Self::new(ComputeConfig::cpu_only())
    }

    pub fn config(&self) -> &ComputeConfig {
        &self.0.config
    }

    pub fn cpu(&self) -> &CpuBackend {
        &self.0.cpu
    }

    fn slot(&self) -> MutexGuard<'_, GpuSlot> {
        self.0.gpu.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The GPU backend, initialized on first call.
    ///
    /// A failed initialization is remembered; later calls return the same
    /// error without probing the platform again.
    pub fn gpu(&self) -> Result<GpuBackend> {
        let mut slot = self.slot();
        match &*slot {
            GpuSlot::Ready(gpu) => return Ok(gpu.clone()),
            GpuSlot::Failed(reason) => {
                return Err(TensorError::DeviceInitialization(reason.clone()))
            }
            GpuSlot::Shutdown => {
                return Err(TensorError::DeviceInitialization(
                    "compute context has been shut down".into(),
                ))
            }
            GpuSlot::Uninit => {}
        }

        if !self.0.config.enable_gpu {
            let reason = String::from("GPU disabled by configuration");
            *slot = GpuSlot::Failed(reason.clone());
            return Err(TensorError::DeviceInitialization(reason));
        }

        match GpuBackend::new(self.0.config.gpu_options()) {
            Ok(gpu) => {
                tracing::info!(device = gpu.device_name(), "gpu backend initialized");
                *slot = GpuSlot::Ready(gpu.clone());
                Ok(gpu)
            }
            Err(e) => {
                let reason = match e {
                    TensorError::DeviceInitialization(reason) => reason,
                    other => other.to_string(),
                };
                tracing::warn!(%reason, "gpu initialization failed");
                *slot = GpuSlot::Failed(reason.clone());
                Err(TensorError::DeviceInitialization(reason))
            }
        }
    }

    pub fn gpu_available(&self) -> bool {
        self.gpu().is_ok()
    }

    /// Drops the GPU backend. Subsequent GPU work falls back to the CPU.
    pub fn shutdown(&self) {
        *self.slot() = GpuSlot::Shutdown;
        tracing::debug!("compute context shut down");
    }

    pub(crate) fn note_fallback(&self, op: &'static str, err: &TensorError) {
        if !self.0.fallback_logged.swap(true, Ordering::Relaxed) {
            tracing::warn!(op, error = %err, "gpu unavailable, running on cpu");
        } else {
            tracing::debug!(op, error = %err, "cpu fallback");
        }
    }

    pub(crate) fn same(&self, other: &ComputeContext) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Host view of a storage, downloading it when it lives on the GPU.
    pub(crate) fn host<'a>(&self, storage: &'a Storage) -> Result<Cow<'a, CpuTensor>> {
        match storage {
            Storage::Cpu(t) => Ok(Cow::Borrowed(t)),
            Storage::Gpu(t) => Ok(Cow::Owned(t.to_host()?)),
        }
    }

    // === Factories ===

    fn host_tensor(&self, data: Vec<f32>, shape: Shape) -> Result<Tensor> {
        Ok(Tensor::from_storage(self, CpuTensor::new(data, shape)?.into()))
    }

    pub fn from_values(&self, dims: &[usize], data: Vec<f32>) -> Result<Tensor> {
        self.host_tensor(data, Shape::new(dims.to_vec())?)
    }

    pub fn full(&self, dims: &[usize], value: f32) -> Result<Tensor> {
        let shape = Shape::new(dims.to_vec())?;
        self.host_tensor(vec![value; shape.numel()], shape)
    }

    pub fn zeros(&self, dims: &[usize]) -> Result<Tensor> {
        self.full(dims, 0.0)
    }

    pub fn ones(&self, dims: &[usize]) -> Result<Tensor> {
        self.full(dims, 1.0)
    }

    /// Shape `[1]` tensor holding `value`.
    pub fn scalar(&self, value: f32) -> Result<Tensor> {
        self.host_tensor(vec![value], Shape::scalar())
    }

    /// `n x n` identity matrix.
    pub fn identity(&self, n: usize) -> Result<Tensor> {
        let shape = Shape::new(vec![n, n])?;
        let mut data = vec![0.0; shape.numel()];
        for i in 0..n {
            data[i * n + i] = 1.0;
        }
        self.host_tensor(data, shape)
    }

    /// Uniform samples in `[0, 1)` from the thread-local generator.
    pub fn random(&self, dims: &[usize]) -> Result<Tensor> {
        self.random_with(dims, &mut rand::thread_rng())
    }

    /// Uniform samples in `[0, 1)` from `rng`, for reproducible initialization.
    pub fn random_with<R: Rng + ?Sized>(&self, dims: &[usize], rng: &mut R) -> Result<Tensor> {
        let shape = Shape::new(dims.to_vec())?;
        let data = (0..shape.numel()).map(|_| rng.gen::<f32>()).collect();
        self.host_tensor(data, shape)
    }
}

//! Convolution entry points.
//!
//! `convolve` is single-channel SAME correlation over 1D or 2D inputs and
//! picks between the direct and FFT kernels. `conv2d` is the batched
//! multi-channel operation used by convolutional layers and is always direct.

use tg_tensor::{layout, Backend, Conv2dParams, Result};

use crate::device::Device;
use crate::storage::{dispatch_binary, Storage};
use crate::tensor::Tensor;

impl Tensor {
    /// SAME convolution, through the FFT when the kernel has more than
    /// `fft_threshold` elements.
    pub fn convolve(&self, kernel: &Tensor) -> Result<Tensor> {
        if kernel.numel() > self.context().config().fft_threshold {
            self.convolve_fft(kernel)
        } else {
            self.convolve_direct(kernel)
        }
    }

    /// Sliding-window SAME convolution with zero padding.
    pub fn convolve_direct(&self, kernel: &Tensor) -> Result<Tensor> {
        self.check_context(kernel, "convolve")?;
        let ctx = self.context();
        let out: Storage = self.with_storages(kernel, |a, b| {
            dispatch_binary!(ctx, "convolve", (a, b), |be, x, k| be.conv_same(x, k))
        })?;
        Ok(Tensor::from_storage(ctx, out))
    }

    /// SAME convolution through the frequency domain.
    ///
    /// Runs on the host; the result is moved back to the GPU when the input
    /// lives there.
    pub fn convolve_fft(&self, kernel: &Tensor) -> Result<Tensor> {
        self.check_context(kernel, "convolve")?;
        let ctx = self.context();
        let out = self.with_storages(kernel, |a, b| {
            let (x, k) = (ctx.host(a)?, ctx.host(b)?);
            ctx.cpu().conv_fft(&x, &k)
        })?;
        let result = Tensor::from_storage(ctx, out.into());
        match self.device() {
            Device::Gpu => result.to(Device::Gpu),
            Device::Cpu => Ok(result),
        }
    }

    /// Batched convolution of `[N, C, H, W]` with `[O, C, KH, KW]` plus optional bias `[O]`.
    pub fn conv2d(
        &self,
        weight: &Tensor,
        bias: Option<&Tensor>,
        params: Conv2dParams,
    ) -> Result<Tensor> {
        self.check_context(weight, "conv2d")?;
        if let Some(bias) = bias {
            self.check_context(bias, "conv2d")?;
        }
        // Shapes first: a valid bias is rank 1 and cannot alias either operand.
        let bias_shape = bias.map(Tensor::shape);
        layout::conv2d_dims(&self.shape(), &weight.shape(), bias_shape.as_ref(), params)?;

        let ctx = self.context();
        let bias_state = bias.map(|b| b.read());
        let bias_storage = bias_state.as_ref().map(|s| &s.storage);
        let out: Storage = self.with_storages(weight, |a, b| {
            if let (Storage::Gpu(x), Storage::Gpu(w)) = (a, b) {
                let gpu_bias = match bias_storage {
                    None => Some(None),
                    Some(Storage::Gpu(t)) => Some(Some(t)),
                    Some(Storage::Cpu(_)) => None,
                };
                if let Some(gpu_bias) = gpu_bias {
                    match ctx.gpu().and_then(|gpu| gpu.conv2d(x, w, gpu_bias, params)) {
                        Ok(t) => return Ok(Storage::Gpu(t)),
                        Err(e) if e.is_device_failure() => ctx.note_fallback("conv2d", &e),
                        Err(e) => return Err(e),
                    }
                }
            }
            let (x, w) = (ctx.host(a)?, ctx.host(b)?);
            let bias_host = bias_storage.map(|s| ctx.host(s)).transpose()?;
            ctx.cpu()
                .conv2d(&x, &w, bias_host.as_deref(), params)
                .map(Storage::from)
        })?;
        Ok(Tensor::from_storage(ctx, out))
    }
}

//! Stand-in used when the crate is built without the `opencl` feature.
//!
//! Neither type can be constructed, so every method body is unreachable.

use std::convert::Infallible;
use std::ops::Range;

use tg_backend_cpu::CpuTensor;
use tg_tensor::prelude::*;

use crate::GpuOptions;

#[derive(Debug)]
pub struct GpuTensor {
    never: Infallible,
}

impl GpuTensor {
    pub fn to_host(&self) -> Result<CpuTensor> {
        match self.never {}
    }

    pub fn release(&mut self) {
        match self.never {}
    }

    pub fn is_released(&self) -> bool {
        match self.never {}
    }
}

impl TensorData for GpuTensor {
    fn shape(&self) -> &Shape {
        match self.never {}
    }

    fn strides(&self) -> &Strides {
        match self.never {}
    }
}

#[derive(Debug, Clone)]
pub struct GpuBackend {
    never: Infallible,
}

impl GpuBackend {
    pub fn new(_options: GpuOptions) -> Result<Self> {
        Err(TensorError::DeviceInitialization(
            "built without the `opencl` feature".to_string(),
        ))
    }

    pub fn device_name(&self) -> &str {
        match self.never {}
    }

    pub fn upload(&self, _x: &CpuTensor) -> Result<GpuTensor> {
        match self.never {}
    }
}

impl Backend for GpuBackend {
    type Tensor = GpuTensor;

    fn name(&self) -> &'static str {
        match self.never {}
    }

    fn from_vec(&self, _data: Vec<f32>, _shape: Shape) -> Result<GpuTensor> {
        match self.never {}
    }

    fn full(&self, _shape: &Shape, _value: f32) -> Result<GpuTensor> {
        match self.never {}
    }

    fn to_vec(&self, _x: &GpuTensor) -> Result<Vec<f32>> {
        match self.never {}
    }

    fn read_at(&self, _x: &GpuTensor, _linear: usize) -> Result<f32> {
        match self.never {}
    }

    fn write_at(&self, _x: &mut GpuTensor, _linear: usize, _value: f32) -> Result<()> {
        match self.never {}
    }

    fn copy(&self, _x: &GpuTensor) -> Result<GpuTensor> {
        match self.never {}
    }

    fn unary(&self, _op: UnaryOp, _x: &GpuTensor) -> Result<GpuTensor> {
        match self.never {}
    }

    fn binary(&self, _op: BinaryOp, _a: &GpuTensor, _b: &GpuTensor) -> Result<GpuTensor> {
        match self.never {}
    }

    fn binary_scalar(&self, _op: BinaryOp, _a: &GpuTensor, _scalar: f32) -> Result<GpuTensor> {
        match self.never {}
    }

    fn reduce(&self, _op: ReduceOp, _x: &GpuTensor) -> Result<f32> {
        match self.never {}
    }

    fn sum_to(&self, _x: &GpuTensor, _shape: &Shape) -> Result<GpuTensor> {
        match self.never {}
    }

    fn softmax(&self, _x: &GpuTensor) -> Result<GpuTensor> {
        match self.never {}
    }

    fn matmul(&self, _a: &GpuTensor, _b: &GpuTensor) -> Result<GpuTensor> {
        match self.never {}
    }

    fn transpose(&self, _x: &GpuTensor) -> Result<GpuTensor> {
        match self.never {}
    }

    fn reshape_in_place(&self, _x: &mut GpuTensor, _shape: &Shape) -> Result<()> {
        match self.never {}
    }

    fn slice(&self, _x: &GpuTensor, _ranges: &[Range<usize>]) -> Result<GpuTensor> {
        match self.never {}
    }

    fn concat(&self, _a: &GpuTensor, _b: &GpuTensor, _axis: usize) -> Result<GpuTensor> {
        match self.never {}
    }

    fn conv_same(&self, _input: &GpuTensor, _kernel: &GpuTensor) -> Result<GpuTensor> {
        match self.never {}
    }

    fn conv2d(
        &self,
        _input: &GpuTensor,
        _weight: &GpuTensor,
        _bias: Option<&GpuTensor>,
        _params: Conv2dParams,
    ) -> Result<GpuTensor> {
        match self.never {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialization_reports_missing_feature() {
        let err = GpuBackend::new(GpuOptions::default()).unwrap_err();
        assert!(err.is_device_failure());
        assert!(err.to_string().contains("opencl"));
    }
}

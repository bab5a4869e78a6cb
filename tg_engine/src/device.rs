//! Execution targets.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tg_tensor::TensorError;

/// Where a tensor's storage lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cpu,
    Gpu,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Gpu => f.write_str("gpu"),
        }
    }
}

impl FromStr for Device {
    type Err = TensorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Device::Cpu),
            "gpu" | "opencl" => Ok(Device::Gpu),
            other => Err(TensorError::Config(format!(
                "unknown device '{other}'; expected 'cpu' or 'gpu'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        assert_eq!("CPU".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!("opencl".parse::<Device>().unwrap(), Device::Gpu);
        assert_eq!(Device::Gpu.to_string(), "gpu");
        assert!(matches!("tpu".parse::<Device>(), Err(TensorError::Config(_))));
    }
}

use std::fmt;

use serde::{Deserialize, Serialize};

/// Compute device for tensor storage and operations.
///
/// Placement is decided once, when a model or tensor is built. Only `Cpu`
/// storage exists in this build; `Cuda` is accepted in configuration so
/// that callers get a typed `UnsupportedDevice` error instead of a silent
/// fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    #[default]
    Cpu,
    /// CUDA GPU with device index
    Cuda(usize),
}

impl Device {
    /// Whether this is a CPU device.
    pub fn is_cpu(&self) -> bool {
        matches!(self, Device::Cpu)
    }

    /// Whether this is a CUDA device.
    pub fn is_cuda(&self) -> bool {
        matches!(self, Device::Cuda(_))
    }

    /// Fail unless tensors can actually be allocated on this device.
    pub fn ensure_available(&self) -> crate::Result<()> {
        match self {
            Device::Cpu => Ok(()),
            other => Err(crate::KilnError::UnsupportedDevice(*other)),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(idx) => write!(f, "cuda:{idx}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_properties() {
        assert!(Device::Cpu.is_cpu());
        assert!(!Device::Cpu.is_cuda());
        assert!(Device::Cuda(0).is_cuda());
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Device::Cpu), "cpu");
        assert_eq!(format!("{}", Device::Cuda(1)), "cuda:1");
    }

    #[test]
    fn test_only_cpu_available() {
        assert!(Device::default().ensure_available().is_ok());
        assert!(Device::Cuda(0).ensure_available().is_err());
    }
}

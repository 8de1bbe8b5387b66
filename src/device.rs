//! Compute device discovery and selection.
//!
//! Picks an accelerated device when one is available and compiled in
//! (`cuda` or `metal` feature), otherwise falls back to the CPU.

use candle_core::{DType, Device, DeviceLocation};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::inference::model_loader::ModelLoadError;

/// Which device the engine should be bound to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    /// First available accelerator, else CPU.
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

/// Resolve a preference into a concrete device.
///
/// `Auto` never fails: an accelerator that reports available but cannot be
/// opened is logged and skipped. An explicit accelerator that is missing is
/// a load error.
pub fn resolve_device(preference: DevicePreference) -> Result<Device, ModelLoadError> {
    match preference {
        DevicePreference::Cpu => Ok(Device::Cpu),
        DevicePreference::Cuda => Device::new_cuda(0)
            .map_err(|e| ModelLoadError::Device(format!("CUDA device 0 unavailable: {e}"))),
        DevicePreference::Metal => Device::new_metal(0)
            .map_err(|e| ModelLoadError::Device(format!("Metal device 0 unavailable: {e}"))),
        DevicePreference::Auto => Ok(detect_accelerator().unwrap_or(Device::Cpu)),
    }
}

fn detect_accelerator() -> Option<Device> {
    if candle_core::utils::cuda_is_available() {
        match Device::new_cuda(0) {
            Ok(device) => return Some(device),
            Err(e) => warn!("CUDA reported available but failed to open: {e}"),
        }
    }

    if candle_core::utils::metal_is_available() {
        match Device::new_metal(0) {
            Ok(device) => return Some(device),
            Err(e) => warn!("Metal reported available but failed to open: {e}"),
        }
    }

    #[cfg(not(any(feature = "cuda", feature = "metal")))]
    tracing::info!("No accelerator support compiled in, running in CPU-only mode");

    None
}

/// Short label for logs and the UI, e.g. "cpu" or "cuda:0".
pub fn device_label(device: &Device) -> String {
    match device.location() {
        DeviceLocation::Cpu => "cpu".to_string(),
        DeviceLocation::Cuda { gpu_id } => format!("cuda:{gpu_id}"),
        DeviceLocation::Metal { gpu_id } => format!("metal:{gpu_id}"),
    }
}

/// Weight precision used on each device class.
pub fn dtype_for(device: &Device) -> DType {
    match device.location() {
        DeviceLocation::Cpu => DType::F32,
        DeviceLocation::Cuda { .. } => DType::BF16,
        DeviceLocation::Metal { .. } => DType::F16,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_preference() {
        let device = resolve_device(DevicePreference::Cpu).unwrap();
        assert_eq!(device_label(&device), "cpu");
        assert_eq!(dtype_for(&device), DType::F32);
    }

    #[test]
    fn test_auto_always_resolves() {
        assert!(resolve_device(DevicePreference::Auto).is_ok());
    }

    #[test]
    fn test_preference_serde() {
        let pref: DevicePreference = serde_json::from_str("\"metal\"").unwrap();
        assert_eq!(pref, DevicePreference::Metal);
        assert_eq!(serde_json::to_string(&DevicePreference::Auto).unwrap(), "\"auto\"");
    }
}

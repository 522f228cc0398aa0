use crate::error::{DepthError, DepthResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Environment variable that overrides device detection (`cpu`, `cuda`, `cuda:N`).
pub const DEVICE_ENV: &str = "MONODEPTH_DEVICE";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Device {
	Cpu,
	Cuda(i32),
}

impl Device {
	pub fn is_accelerator(&self) -> bool {
		!matches!(self, Device::Cpu)
	}
}

impl fmt::Display for Device {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Device::Cpu => write!(f, "cpu"),
			Device::Cuda(id) => write!(f, "cuda:{}", id),
		}
	}
}

impl FromStr for Device {
	type Err = DepthError;

	fn from_str(s: &str) -> DepthResult<Self> {
		let s = s.trim().to_lowercase();
		match s.as_str() {
			"cpu" => Ok(Device::Cpu),
			"cuda" | "gpu" => Ok(Device::Cuda(0)),
			_ => match s.strip_prefix("cuda:") {
				Some(id) => id
					.parse::<i32>()
					.ok()
					.filter(|id| *id >= 0)
					.map(Device::Cuda)
					.ok_or_else(|| DepthError::Config(format!("Invalid CUDA device id: {}", id))),
				None => Err(DepthError::Config(format!(
					"Unknown device '{}'. Use: cpu, cuda or cuda:N",
					s
				))),
			},
		}
	}
}

/// Picks the best available device: an accelerator when the runtime reports
/// one, the CPU otherwise. Never fails.
pub fn select_device() -> Device {
	if let Ok(value) = std::env::var(DEVICE_ENV) {
		match value.parse::<Device>() {
			Ok(device) => {
				tracing::debug!("{} set, using {}", DEVICE_ENV, device);
				return device;
			}
			Err(e) => tracing::warn!("Ignoring {}: {}", DEVICE_ENV, e),
		}
	}

	let device = if accelerator_available() {
		Device::Cuda(0)
	} else {
		Device::Cpu
	};
	tracing::debug!("Selected compute device: {}", device);
	device
}

#[cfg(feature = "onnx")]
fn accelerator_available() -> bool {
	use ort::execution_providers::{CUDAExecutionProvider, ExecutionProvider};

	match CUDAExecutionProvider::default().is_available() {
		Ok(available) => available,
		Err(e) => {
			tracing::warn!("Failed to query CUDA execution provider, using CPU: {}", e);
			false
		}
	}
}

#[cfg(not(feature = "onnx"))]
fn accelerator_available() -> bool {
	false
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_device_names() {
		assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
		assert_eq!("CUDA".parse::<Device>().unwrap(), Device::Cuda(0));
		assert_eq!("cuda:2".parse::<Device>().unwrap(), Device::Cuda(2));
		assert!("cuda:-1".parse::<Device>().is_err());
		assert!("tpu".parse::<Device>().is_err());
	}

	#[test]
	fn display_round_trips() {
		let device = Device::Cuda(1);
		assert_eq!(device.to_string().parse::<Device>().unwrap(), device);
		assert_eq!(Device::Cpu.to_string(), "cpu");
	}

	#[test]
	fn select_always_yields_a_device() {
		let device = select_device();
		assert!(matches!(device, Device::Cpu | Device::Cuda(_)));
	}
}

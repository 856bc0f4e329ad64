use std::fmt;
use std::str::FromStr;

use ort::ExecutionProviderDispatch;
#[cfg(any(feature = "cuda", feature = "coreml"))]
use ort::ExecutionProvider;
use tracing::{info, warn};

/// Compute target the backbone graph is executed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cuda,
    CoreMl,
    Cpu,
}

/// Device preference taken from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceChoice {
    #[default]
    Auto,
    Cuda,
    CoreMl,
    Cpu,
}

impl Device {
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Cuda => "cuda",
            Device::CoreMl => "coreml",
            Device::Cpu => "cpu",
        }
    }

    /// GPU first, then Apple silicon, then plain CPU.
    pub fn detect() -> Self {
        if cuda_available() {
            Device::Cuda
        } else if coreml_available() {
            Device::CoreMl
        } else {
            Device::Cpu
        }
    }

    /// Resolves a preference into a concrete device. A forced accelerator that
    /// is not usable falls back to CPU with a warning.
    pub fn resolve(choice: DeviceChoice) -> Self {
        match choice {
            DeviceChoice::Auto => Self::detect(),
            DeviceChoice::Cpu => Device::Cpu,
            DeviceChoice::Cuda if cuda_available() => Device::Cuda,
            DeviceChoice::CoreMl if coreml_available() => Device::CoreMl,
            forced => {
                warn!("{forced:?} requested but not available, using CPU");
                Device::Cpu
            }
        }
    }

    pub(crate) fn execution_providers(&self) -> Vec<ExecutionProviderDispatch> {
        match self {
            #[cfg(feature = "cuda")]
            Device::Cuda => vec![ort::CUDAExecutionProvider::default().build()],
            #[cfg(feature = "coreml")]
            Device::CoreMl => vec![ort::CoreMLExecutionProvider::default().build()],
            _ => {
                info!("No accelerator registered, using the CPU execution provider");
                Vec::new()
            }
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceChoice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(DeviceChoice::Auto),
            "cuda" | "gpu" => Ok(DeviceChoice::Cuda),
            "coreml" | "mps" => Ok(DeviceChoice::CoreMl),
            "cpu" => Ok(DeviceChoice::Cpu),
            other => Err(format!(
                "unknown device `{other}`, expected one of auto, cuda, coreml, cpu"
            )),
        }
    }
}

fn cuda_available() -> bool {
    #[cfg(feature = "cuda")]
    {
        ort::CUDAExecutionProvider::default()
            .is_available()
            .unwrap_or(false)
    }
    #[cfg(not(feature = "cuda"))]
    false
}

fn coreml_available() -> bool {
    #[cfg(feature = "coreml")]
    {
        ort::CoreMLExecutionProvider::default()
            .is_available()
            .unwrap_or(false)
    }
    #[cfg(not(feature = "coreml"))]
    false
}

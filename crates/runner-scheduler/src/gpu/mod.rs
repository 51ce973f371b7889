//! Compute device inventory

pub mod inventory;
pub mod mock;

pub use inventory::SystemInventory;
pub use mock::MockInventory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const MIB: u64 = 1024 * 1024;

/// Backend library a device is driven by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Library {
    Cuda,
    Rocm,
    Metal,
    Cpu,
}

impl Library {
    /// Whether a model may be split between this device and host memory
    pub fn supports_partial_offload(&self) -> bool {
        !matches!(self, Library::Metal)
    }

    /// Memory the driver keeps for itself on every device
    pub fn default_reserved(&self) -> u64 {
        match self {
            Library::Cuda | Library::Rocm => 457 * MIB,
            Library::Metal | Library::Cpu => 0,
        }
    }

    /// Environment variable that restricts a runner to a subset of devices
    pub fn visible_devices_env(&self) -> Option<&'static str> {
        match self {
            Library::Cuda => Some("CUDA_VISIBLE_DEVICES"),
            Library::Rocm => Some("HIP_VISIBLE_DEVICES"),
            Library::Metal | Library::Cpu => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Library::Cuda => "cuda",
            Library::Rocm => "rocm",
            Library::Metal => "metal",
            Library::Cpu => "cpu",
        }
    }
}

impl fmt::Display for Library {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Library {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cuda" => Ok(Library::Cuda),
            "rocm" | "hip" => Ok(Library::Rocm),
            "metal" => Ok(Library::Metal),
            "cpu" => Ok(Library::Cpu),
            other => Err(format!("unknown library: {}", other)),
        }
    }
}

/// One accelerator as seen at query time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub library: Library,
    pub name: String,
    pub total_memory: u64,
    pub free_memory: u64,
    /// Bytes that must stay unused (driver reserve plus configured overhead)
    pub reserved_memory: u64,
}

impl DeviceInfo {
    pub fn new(id: impl Into<String>, library: Library, total_memory: u64, free_memory: u64) -> Self {
        let id = id.into();
        Self {
            name: format!("{} {}", library, id),
            id,
            library,
            total_memory,
            free_memory,
            reserved_memory: library.default_reserved(),
        }
    }

    pub fn with_reserved(mut self, reserved: u64) -> Self {
        self.reserved_memory = reserved;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Host memory as seen at query time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuMemory {
    pub total: u64,
    pub free: u64,
    pub free_swap: u64,
}

#[async_trait]
pub trait InventoryProvider: Send + Sync {
    /// Accelerators currently usable; empty on CPU-only hosts
    async fn list_devices(&self) -> Vec<DeviceInfo>;

    async fn cpu_memory(&self) -> CpuMemory;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_parse() {
        assert_eq!("CUDA".parse::<Library>().unwrap(), Library::Cuda);
        assert_eq!("hip".parse::<Library>().unwrap(), Library::Rocm);
        assert!("vulkan".parse::<Library>().is_err());
    }

    #[test]
    fn test_partial_offload() {
        assert!(Library::Cuda.supports_partial_offload());
        assert!(!Library::Metal.supports_partial_offload());
    }

    #[test]
    fn test_device_defaults_reserve() {
        let dev = DeviceInfo::new("0", Library::Cuda, 8 << 30, 8 << 30);
        assert_eq!(dev.reserved_memory, 457 * MIB);
        assert_eq!(dev.name, "cuda 0");
        assert_eq!(Library::Cuda.visible_devices_env(), Some("CUDA_VISIBLE_DEVICES"));
    }
}

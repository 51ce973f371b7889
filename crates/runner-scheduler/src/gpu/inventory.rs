//! Inventory backed by the host: sysinfo for system memory, NVML for NVIDIA GPUs

use super::{CpuMemory, DeviceInfo, InventoryProvider, Library};
use async_trait::async_trait;
use sysinfo::System;
use tracing::{debug, info, warn};

#[cfg(feature = "nvml")]
use nvml_wrapper::Nvml;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LibraryFilter {
    Any,
    CpuOnly,
    Only(Library),
}

pub struct SystemInventory {
    gpu_overhead: u64,
    filter: LibraryFilter,
    #[cfg(feature = "nvml")]
    nvml: Option<Nvml>,
}

impl SystemInventory {
    /// `gpu_overhead` is added to each device's reserve; `library` forces one backend
    pub fn new(gpu_overhead: u64, library: Option<&str>) -> Self {
        let filter = parse_filter(library);

        #[cfg(feature = "nvml")]
        let nvml = if filter == LibraryFilter::CpuOnly {
            None
        } else {
            match Nvml::init() {
                Ok(nvml) => {
                    info!("NVML initialized");
                    Some(nvml)
                }
                Err(e) => {
                    debug!("NVML unavailable: {}", e);
                    None
                }
            }
        };

        Self {
            gpu_overhead,
            filter,
            #[cfg(feature = "nvml")]
            nvml,
        }
    }

    fn discover(&self) -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        #[cfg(feature = "nvml")]
        if let Some(nvml) = &self.nvml {
            devices.extend(nvml_devices(nvml));
        }

        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        devices.push(metal_device());

        devices
    }
}

#[async_trait]
impl InventoryProvider for SystemInventory {
    async fn list_devices(&self) -> Vec<DeviceInfo> {
        let devices = self.discover();
        let devices = apply_filter(devices, self.filter)
            .into_iter()
            .map(|d| {
                let reserved = d.reserved_memory + self.gpu_overhead;
                d.with_reserved(reserved)
            })
            .collect::<Vec<_>>();
        debug!("Inventory reports {} device(s)", devices.len());
        devices
    }

    async fn cpu_memory(&self) -> CpuMemory {
        let mut system = System::new();
        system.refresh_memory();
        CpuMemory {
            total: system.total_memory(),
            free: system.available_memory(),
            free_swap: system.free_swap(),
        }
    }
}

fn parse_filter(library: Option<&str>) -> LibraryFilter {
    match library.map(str::trim).filter(|s| !s.is_empty()) {
        None => LibraryFilter::Any,
        Some(name) => match name.parse::<Library>() {
            Ok(Library::Cpu) => {
                info!("Library override: CPU only");
                LibraryFilter::CpuOnly
            }
            Ok(lib) => {
                info!("Library override: {}", lib);
                LibraryFilter::Only(lib)
            }
            Err(e) => {
                warn!("Ignoring library override: {}", e);
                LibraryFilter::Any
            }
        },
    }
}

fn apply_filter(devices: Vec<DeviceInfo>, filter: LibraryFilter) -> Vec<DeviceInfo> {
    match filter {
        LibraryFilter::Any => devices,
        LibraryFilter::CpuOnly => Vec::new(),
        LibraryFilter::Only(lib) => devices.into_iter().filter(|d| d.library == lib).collect(),
    }
}

#[cfg(feature = "nvml")]
fn nvml_devices(nvml: &Nvml) -> Vec<DeviceInfo> {
    let count = match nvml.device_count() {
        Ok(count) => count,
        Err(e) => {
            warn!("Failed to count NVIDIA devices: {}", e);
            return Vec::new();
        }
    };

    (0..count)
        .filter_map(|index| {
            let device = nvml
                .device_by_index(index)
                .map_err(|e| warn!("Failed to open GPU {}: {}", index, e))
                .ok()?;
            let memory = device
                .memory_info()
                .map_err(|e| warn!("Failed to read memory of GPU {}: {}", index, e))
                .ok()?;
            let name = device.name().unwrap_or_else(|_| format!("GPU {}", index));
            Some(
                DeviceInfo::new(index.to_string(), Library::Cuda, memory.total, memory.free)
                    .with_name(name),
            )
        })
        .collect()
}

/// Apple silicon shares host memory; roughly two thirds of it is usable by the GPU
#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
fn metal_device() -> DeviceInfo {
    let mut system = System::new();
    system.refresh_memory();
    let total = system.total_memory() / 3 * 2;
    let free = total.min(system.available_memory());
    DeviceInfo::new("0", Library::Metal, total, free).with_name("Apple GPU")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn devices() -> Vec<DeviceInfo> {
        vec![
            DeviceInfo::new("0", Library::Cuda, 8 << 30, 8 << 30),
            DeviceInfo::new("1", Library::Rocm, 4 << 30, 4 << 30),
        ]
    }

    #[test]
    fn test_parse_filter() {
        assert_eq!(parse_filter(None), LibraryFilter::Any);
        assert_eq!(parse_filter(Some("")), LibraryFilter::Any);
        assert_eq!(parse_filter(Some("cpu")), LibraryFilter::CpuOnly);
        assert_eq!(parse_filter(Some("rocm")), LibraryFilter::Only(Library::Rocm));
        assert_eq!(parse_filter(Some("opencl")), LibraryFilter::Any);
    }

    #[test]
    fn test_apply_filter() {
        assert_eq!(apply_filter(devices(), LibraryFilter::Any).len(), 2);
        assert!(apply_filter(devices(), LibraryFilter::CpuOnly).is_empty());
        let rocm = apply_filter(devices(), LibraryFilter::Only(Library::Rocm));
        assert_eq!(rocm.len(), 1);
        assert_eq!(rocm[0].id, "1");
    }

    #[tokio::test]
    async fn test_cpu_override_hides_devices() {
        let inventory = SystemInventory::new(0, Some("cpu"));
        assert!(inventory.list_devices().await.is_empty());
        let cpu = inventory.cpu_memory().await;
        assert!(cpu.total > 0);
        assert!(cpu.free <= cpu.total);
    }
}

//! Mock inventory for tests and dry runs

use super::{CpuMemory, DeviceInfo, InventoryProvider, Library};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

const GIB: u64 = 1024 * 1024 * 1024;

/// Inventory whose devices and host memory are set by the caller
#[derive(Clone, Default)]
pub struct MockInventory {
    devices: Arc<RwLock<Vec<DeviceInfo>>>,
    cpu: Arc<RwLock<CpuMemory>>,
}

impl MockInventory {
    pub fn new(devices: Vec<DeviceInfo>, cpu: CpuMemory) -> Self {
        Self {
            devices: Arc::new(RwLock::new(devices)),
            cpu: Arc::new(RwLock::new(cpu)),
        }
    }

    /// CUDA devices with the given sizes in bytes, fully free, no reserve, and 64 GiB of host memory
    pub fn with_gpus(sizes: &[u64]) -> Self {
        let devices = sizes
            .iter()
            .enumerate()
            .map(|(i, size)| DeviceInfo::new(i.to_string(), Library::Cuda, *size, *size).with_reserved(0))
            .collect();
        Self::new(devices, CpuMemory { total: 64 * GIB, free: 64 * GIB, free_swap: 0 })
    }

    pub fn cpu_only(total: u64) -> Self {
        Self::new(Vec::new(), CpuMemory { total, free: total, free_swap: 0 })
    }

    /// Overwrite the reported free memory of one device
    pub async fn set_free(&self, id: &str, free: u64) {
        let mut devices = self.devices.write().await;
        if let Some(dev) = devices.iter_mut().find(|d| d.id == id) {
            dev.free_memory = free;
        }
    }

    pub async fn set_cpu(&self, cpu: CpuMemory) {
        *self.cpu.write().await = cpu;
    }
}

#[async_trait]
impl InventoryProvider for MockInventory {
    async fn list_devices(&self) -> Vec<DeviceInfo> {
        let devices = self.devices.read().await.clone();
        debug!("Mock inventory reports {} device(s)", devices.len());
        devices
    }

    async fn cpu_memory(&self) -> CpuMemory {
        *self.cpu.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_gpus() {
        let inv = MockInventory::with_gpus(&[8 * GIB, 4 * GIB]);
        let devices = inv.list_devices().await;
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[1].total_memory, 4 * GIB);
        assert_eq!(devices[0].reserved_memory, 0);
    }

    #[tokio::test]
    async fn test_set_free() {
        let inv = MockInventory::with_gpus(&[8 * GIB]);
        inv.set_free("0", GIB).await;
        assert_eq!(inv.list_devices().await[0].free_memory, GIB);
        inv.set_free("missing", 0).await;
    }

    #[tokio::test]
    async fn test_cpu_only() {
        let inv = MockInventory::cpu_only(16 * GIB);
        assert!(inv.list_devices().await.is_empty());
        assert_eq!(inv.cpu_memory().await.free, 16 * GIB);
    }
}

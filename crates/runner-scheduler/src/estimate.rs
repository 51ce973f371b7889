//! Memory estimation: how many layers of a model fit on which devices
//!
//! Sizes come from external metadata, so every sum saturates at `u64::MAX`.

use crate::gpu::DeviceInfo;
use crate::model::{ModelMetadata, ProjectorInfo};
use crate::options::RunnerOptions;
use serde::Serialize;
use std::collections::BTreeMap;

/// Compute graph scratch charged per token of batch
pub const GRAPH_BYTES_PER_BATCH_TOKEN: u64 = 16 * 1024;

/// Placement plan for one model configuration. All sizes are bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemoryEstimate {
    pub layers_on_gpu: u64,
    pub layer_count: u64,
    /// Device id to bytes used on that device; only devices holding layers appear
    pub per_device_vram: BTreeMap<String, u64>,
    pub total_vram: u64,
    /// Whole footprint: device bytes plus host bytes
    pub total_size: u64,
    pub layers_per_device: BTreeMap<String, u64>,
    pub graph: u64,
    pub kv_cache: u64,
    pub projector: u64,
    /// Device holding the projector; `None` when it stays in host memory
    pub projector_device: Option<String>,
}

impl MemoryEstimate {
    /// Bytes that stay in host memory
    pub fn system_bytes(&self) -> u64 {
        self.total_size.saturating_sub(self.total_vram)
    }

    pub fn fully_offloaded(&self) -> bool {
        self.layer_count > 0 && self.layers_on_gpu == self.layer_count
    }
}

struct Slot<'a> {
    device: &'a DeviceInfo,
    usable: u64,
    used: u64,
    layers: Vec<u64>,
}

/// Decide how many layers go to each device and what the load will cost
pub fn estimate_gpu_layers(
    devices: &[DeviceInfo],
    metadata: &dyn ModelMetadata,
    projectors: &[ProjectorInfo],
    options: &RunnerOptions,
) -> MemoryEstimate {
    let layer_count = metadata.layer_count();
    let kv_cache = metadata
        .context_bytes_per_token()
        .saturating_mul(options.total_ctx());
    let kv_per_layer = if layer_count > 0 { kv_cache / layer_count } else { 0 };
    let kv_remainder = kv_cache - kv_per_layer * layer_count;
    let graph = options.num_batch as u64 * GRAPH_BYTES_PER_BATCH_TOKEN;

    let mut projector = projectors.iter().map(|p| p.byte_size).fold(0, u64::saturating_add);
    if metadata.has_projector() {
        projector = projector.saturating_add(metadata.projector_byte_size());
    }

    let layer_cost = |i: u64| metadata.layer_byte_size(i).saturating_add(kv_per_layer);

    let max_gpu_layers = if options.num_gpu == 0 || devices.is_empty() {
        0
    } else if options.num_gpu > 0 {
        (options.num_gpu as u64).min(layer_count)
    } else {
        layer_count
    };

    let mut ordered: Vec<&DeviceInfo> = devices.iter().collect();
    ordered.sort_by(|a, b| b.free_memory.cmp(&a.free_memory).then_with(|| a.id.cmp(&b.id)));

    let mut slots: Vec<Slot> = ordered
        .into_iter()
        .map(|device| Slot {
            device,
            usable: device
                .free_memory
                .saturating_sub(device.reserved_memory)
                .saturating_sub(graph),
            used: 0,
            layers: Vec::new(),
        })
        .collect();

    let mut next_layer = 0u64;
    for slot in slots.iter_mut() {
        if next_layer >= max_gpu_layers {
            break;
        }
        if slot.device.library.supports_partial_offload() {
            while next_layer < max_gpu_layers {
                let cost = layer_cost(next_layer);
                if slot.used.saturating_add(cost) > slot.usable {
                    break;
                }
                slot.used = slot.used.saturating_add(cost);
                slot.layers.push(next_layer);
                next_layer += 1;
            }
        } else {
            let rest = (next_layer..max_gpu_layers).map(layer_cost).fold(0, u64::saturating_add);
            if rest <= slot.usable {
                slot.used = rest;
                slot.layers.extend(next_layer..max_gpu_layers);
                next_layer = max_gpu_layers;
            }
        }
    }

    // Layers that no longer fit go back to the host
    let mut cpu_layers: Vec<u64> = (next_layer..layer_count).collect();

    let mut projector_device = None;
    if projector > 0 {
        let target = slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.layers.is_empty())
            .max_by(|(ia, a), (ib, b)| a.layers.len().cmp(&b.layers.len()).then_with(|| ib.cmp(ia)))
            .map(|(i, _)| i);

        if let Some(i) = target {
            let slot = &mut slots[i];
            if slot.device.library.supports_partial_offload() {
                while slot.used.saturating_add(projector) > slot.usable {
                    match slot.layers.pop() {
                        Some(layer) => {
                            slot.used = slot.used.saturating_sub(layer_cost(layer));
                            cpu_layers.push(layer);
                        }
                        None => break,
                    }
                }
            } else if slot.used.saturating_add(projector) > slot.usable {
                cpu_layers.append(&mut slot.layers);
                slot.used = 0;
            }

            if !slot.layers.is_empty() {
                slot.used = slot.used.saturating_add(projector);
                projector_device = Some(slot.device.id.clone());
            }
        }
    }

    let mut per_device_vram = BTreeMap::new();
    let mut layers_per_device = BTreeMap::new();
    for slot in slots.iter().filter(|s| !s.layers.is_empty()) {
        per_device_vram.insert(slot.device.id.clone(), slot.used.saturating_add(graph));
        layers_per_device.insert(slot.device.id.clone(), slot.layers.len() as u64);
    }

    let layers_on_gpu: u64 = layers_per_device.values().sum();
    let total_vram = per_device_vram.values().copied().fold(0, u64::saturating_add);

    let mut host = cpu_layers
        .iter()
        .map(|&i| layer_cost(i))
        .fold(kv_remainder, u64::saturating_add);
    if !cpu_layers.is_empty() || layer_count == 0 {
        host = host.saturating_add(graph);
    }
    if projector_device.is_none() {
        host = host.saturating_add(projector);
    }

    MemoryEstimate {
        layers_on_gpu,
        layer_count,
        per_device_vram,
        total_vram,
        total_size: total_vram.saturating_add(host),
        layers_per_device,
        graph,
        kv_cache,
        projector,
        projector_device,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::Library;
    use crate::model::StaticMetadata;
    use proptest::prelude::*;
    use std::path::PathBuf;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn gpu(id: &str, size: u64) -> DeviceInfo {
        DeviceInfo::new(id, Library::Cuda, size, size).with_reserved(0)
    }

    fn opts() -> RunnerOptions {
        RunnerOptions::default()
    }

    #[test]
    fn test_two_gpus_fill_largest_first() {
        let devices = vec![gpu("1", 4 * GIB), gpu("0", 8 * GIB)];
        let meta = StaticMetadata::uniform(10, GIB);
        let est = estimate_gpu_layers(&devices, &meta, &[], &opts());

        assert_eq!(est.layers_on_gpu, 10);
        assert_eq!(est.layers_per_device["0"], 7);
        assert_eq!(est.layers_per_device["1"], 3);
        assert_eq!(est.total_vram, est.per_device_vram.values().sum::<u64>());
        assert!(est.total_vram <= 12 * GIB);
        assert!(est.total_vram <= est.total_size);
        assert!(est.fully_offloaded());
    }

    #[test]
    fn test_cpu_only_when_no_devices() {
        let meta = StaticMetadata::uniform(4, GIB);
        let est = estimate_gpu_layers(&[], &meta, &[], &opts());
        assert_eq!(est.layers_on_gpu, 0);
        assert_eq!(est.total_vram, 0);
        assert_eq!(est.system_bytes(), 4 * GIB + est.graph);
    }

    #[test]
    fn test_num_gpu_zero_forces_cpu() {
        let devices = vec![gpu("0", 80 * GIB)];
        let meta = StaticMetadata::uniform(4, GIB);
        let options = RunnerOptions { num_gpu: 0, ..opts() };
        let est = estimate_gpu_layers(&devices, &meta, &[], &options);
        assert_eq!(est.layers_on_gpu, 0);
        assert!(est.per_device_vram.is_empty());
    }

    #[test]
    fn test_num_gpu_caps_layers() {
        let devices = vec![gpu("0", 80 * GIB)];
        let meta = StaticMetadata::uniform(10, GIB);
        let options = RunnerOptions { num_gpu: 3, ..opts() };
        let est = estimate_gpu_layers(&devices, &meta, &[], &options);
        assert_eq!(est.layers_on_gpu, 3);
        assert_eq!(est.system_bytes(), 7 * GIB + est.graph);
    }

    #[test]
    fn test_whole_or_nothing_device_too_small() {
        let devices = vec![DeviceInfo::new("0", Library::Metal, 8 * GIB, 8 * GIB)];
        let meta = StaticMetadata::uniform(10, GIB);
        let est = estimate_gpu_layers(&devices, &meta, &[], &opts());
        assert_eq!(est.layers_on_gpu, 0);
        assert_eq!(est.total_vram, 0);
    }

    #[test]
    fn test_whole_or_nothing_device_fits() {
        let devices = vec![DeviceInfo::new("0", Library::Metal, 16 * GIB, 16 * GIB)];
        let meta = StaticMetadata::uniform(10, GIB);
        let est = estimate_gpu_layers(&devices, &meta, &[], &opts());
        assert_eq!(est.layers_on_gpu, 10);
    }

    #[test]
    fn test_reserved_memory_respected() {
        let devices = vec![gpu("0", 4 * GIB).with_reserved(GIB)];
        let meta = StaticMetadata::uniform(10, GIB);
        let est = estimate_gpu_layers(&devices, &meta, &[], &opts());
        assert_eq!(est.layers_on_gpu, 2);
    }

    #[test]
    fn test_kv_cache_shared_across_layers() {
        let devices = vec![gpu("0", 100 * GIB)];
        let meta = StaticMetadata::uniform(4, 1000).with_context_bytes_per_token(10);
        let options = RunnerOptions { num_ctx: 1000, num_parallel: 2, num_batch: 0, ..opts() };
        let est = estimate_gpu_layers(&devices, &meta, &[], &options);
        assert_eq!(est.kv_cache, 20_000);
        assert_eq!(est.total_vram, 4 * 1000 + 20_000);
        assert_eq!(est.system_bytes(), 0);
    }

    #[test]
    fn test_projector_goes_to_busiest_device() {
        let devices = vec![gpu("0", 8 * GIB), gpu("1", 4 * GIB)];
        let meta = StaticMetadata::uniform(4, GIB).with_projector(GIB / 2);
        let proj = ProjectorInfo { path: PathBuf::from("proj.gguf"), byte_size: GIB / 2 };
        let est = estimate_gpu_layers(&devices, &meta, &[proj], &opts());
        assert_eq!(est.projector, GIB);
        assert_eq!(est.projector_device.as_deref(), Some("0"));
        assert_eq!(est.per_device_vram["0"], 5 * GIB + est.graph);
    }

    #[test]
    fn test_projector_pushes_layers_to_cpu() {
        let devices = vec![gpu("0", 4 * GIB)];
        let meta = StaticMetadata::uniform(3, GIB).with_projector(2 * GIB);
        let options = RunnerOptions { num_batch: 0, ..opts() };
        let est = estimate_gpu_layers(&devices, &meta, &[], &options);
        assert_eq!(est.layers_on_gpu, 2);
        assert_eq!(est.per_device_vram["0"], 4 * GIB);
        assert_eq!(est.system_bytes(), GIB);
    }

    #[test]
    fn test_projector_on_cpu_without_offload() {
        let meta = StaticMetadata::uniform(2, GIB).with_projector(GIB);
        let options = RunnerOptions { num_batch: 0, ..opts() };
        let est = estimate_gpu_layers(&[], &meta, &[], &options);
        assert_eq!(est.projector_device, None);
        assert_eq!(est.total_size, 3 * GIB);
    }

    #[test]
    fn test_oversized_layers_saturate() {
        let devices = vec![gpu("0", 8 * GIB)];
        let meta = StaticMetadata::uniform(4, u64::MAX / 2).with_projector(u64::MAX);
        let est = estimate_gpu_layers(&devices, &meta, &[], &opts());
        assert_eq!(est.layers_on_gpu, 0);
        assert_eq!(est.total_size, u64::MAX);
        assert_eq!(est.system_bytes(), u64::MAX);
    }

    #[test]
    fn test_deterministic_tie_break() {
        let devices = vec![gpu("b", 4 * GIB), gpu("a", 4 * GIB)];
        let meta = StaticMetadata::uniform(3, GIB);
        let est = estimate_gpu_layers(&devices, &meta, &[], &opts());
        assert_eq!(est.layers_per_device["a"], 3);
        assert!(!est.layers_per_device.contains_key("b"));
    }

    proptest! {
        #[test]
        fn prop_estimate_invariants(
            sizes in prop::collection::vec(0u64..(16 * GIB), 0..4),
            layers in 0u64..64,
            layer_bytes in 1u64..(2 * GIB),
            kv in 0u64..4096,
            num_gpu in -1i32..80,
            projector in 0u64..GIB,
        ) {
            let devices: Vec<DeviceInfo> = sizes
                .iter()
                .enumerate()
                .map(|(i, s)| DeviceInfo::new(i.to_string(), Library::Cuda, *s, *s))
                .collect();
            let meta = StaticMetadata::uniform(layers, layer_bytes)
                .with_context_bytes_per_token(kv)
                .with_projector(projector);
            let options = RunnerOptions { num_gpu, ..RunnerOptions::default() };
            let est = estimate_gpu_layers(&devices, &meta, &[], &options);

            prop_assert!(est.total_vram <= est.total_size);
            prop_assert_eq!(est.per_device_vram.values().sum::<u64>(), est.total_vram);
            prop_assert!(est.layers_on_gpu <= layers);
            if num_gpu >= 0 {
                prop_assert!(est.layers_on_gpu <= num_gpu as u64);
            }
            for dev in &devices {
                if let Some(used) = est.per_device_vram.get(&dev.id) {
                    prop_assert!(*used <= dev.free_memory - dev.reserved_memory.min(dev.free_memory));
                }
            }
            let again = estimate_gpu_layers(&devices, &meta, &[], &options);
            prop_assert_eq!(est, again);
        }
    }
}

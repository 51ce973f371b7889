//! Placement arithmetic used by the decision loop
//!
//! A device counts as having `min(reported free + released, total - committed)` available.

use crate::estimate::MemoryEstimate;
use crate::gpu::{CpuMemory, DeviceInfo};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Loaded models allowed per GPU (or in total on CPU-only hosts) when not configured
pub const DEFAULT_MODELS_PER_GPU: usize = 3;

/// Bytes held by runners the loop has started, per device and in host memory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Commitment {
    pub devices: BTreeMap<String, u64>,
    pub host: u64,
}

impl Commitment {
    pub fn add(&mut self, estimate: &MemoryEstimate) {
        for (id, bytes) in &estimate.per_device_vram {
            let committed = self.devices.entry(id.clone()).or_default();
            *committed = committed.saturating_add(*bytes);
        }
        self.host = self.host.saturating_add(estimate.system_bytes());
    }
}

/// Device view corrected by committed memory and by memory about to be released
pub fn effective_devices(devices: &[DeviceInfo], committed: &Commitment, released: &Commitment) -> Vec<DeviceInfo> {
    devices
        .iter()
        .map(|d| {
            let used = committed.devices.get(&d.id).copied().unwrap_or(0);
            let freed = released.devices.get(&d.id).copied().unwrap_or(0);
            let mut d = d.clone();
            d.free_memory = d
                .free_memory
                .saturating_add(freed)
                .min(d.total_memory.saturating_sub(used));
            d
        })
        .collect()
}

/// Same devices as if nothing were loaded
pub fn empty_devices(devices: &[DeviceInfo]) -> Vec<DeviceInfo> {
    devices
        .iter()
        .map(|d| {
            let mut d = d.clone();
            d.free_memory = d.total_memory;
            d
        })
        .collect()
}

/// Host bytes a new runner may use, swap included
pub fn effective_host_free(cpu: &CpuMemory, committed: &Commitment, released: &Commitment) -> u64 {
    cpu.free
        .saturating_add(released.host)
        .min(cpu.total.saturating_sub(committed.host))
        .saturating_add(cpu.free_swap)
}

/// A placement fits when its host share fits in host memory and it offloads
/// as many layers as an empty machine would. Falling short of `ideal` is
/// accepted while no loaded runner holds memory on the devices `ideal` uses.
pub fn fits(estimate: &MemoryEstimate, ideal: &MemoryEstimate, host_free: u64, contended: bool) -> bool {
    let offload_ok = estimate.layers_on_gpu >= ideal.layers_on_gpu || !contended;
    offload_ok && estimate.system_bytes() <= host_free
}

pub fn max_loaded_models(configured: usize, gpu_count: usize) -> usize {
    if configured > 0 {
        configured
    } else {
        DEFAULT_MODELS_PER_GPU * gpu_count.max(1)
    }
}

/// An idle runner that could be evicted
#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: u64,
    /// `None` for runners kept alive forever
    pub expires_at: Option<DateTime<Utc>>,
    pub freed: u64,
    pub loaded_at: DateTime<Utc>,
}

/// Eviction order: soonest expiry, then largest footprint, then oldest load
pub fn eviction_order(mut candidates: Vec<Candidate>) -> Vec<u64> {
    candidates.sort_by(|a, b| {
        let by_expiry = match (a.expires_at, b.expires_at) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        by_expiry
            .then_with(|| b.freed.cmp(&a.freed))
            .then_with(|| a.loaded_at.cmp(&b.loaded_at))
            .then_with(|| a.id.cmp(&b.id))
    });
    candidates.into_iter().map(|c| c.id).collect()
}

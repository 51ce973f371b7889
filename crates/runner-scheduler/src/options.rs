//! Per-request runner options and keep-alive policy

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_NUM_CTX: u32 = 2048;
pub const DEFAULT_NUM_BATCH: u32 = 512;

/// Resolved runner options. Two requests can share a runner only if these are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerOptions {
    /// Context length per parallel slot
    pub num_ctx: u32,
    pub num_batch: u32,
    /// Layers to offload: `-1` lets the estimator decide, `0` forces CPU
    pub num_gpu: i32,
    /// Inference threads; `0` leaves the choice to the runner
    pub num_thread: u32,
    /// Concurrent sequences served by one runner
    pub num_parallel: u32,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            num_ctx: DEFAULT_NUM_CTX,
            num_batch: DEFAULT_NUM_BATCH,
            num_gpu: -1,
            num_thread: 0,
            num_parallel: 1,
        }
    }
}

impl RunnerOptions {
    /// Context tokens the runner must allocate across all parallel slots
    pub fn total_ctx(&self) -> u64 {
        self.num_ctx as u64 * self.num_parallel.max(1) as u64
    }

    /// Fill unset fields from scheduler defaults
    pub fn resolve(mut self, default_parallel: u32, default_threads: u32) -> Self {
        if self.num_parallel == 0 {
            self.num_parallel = default_parallel.max(1);
        }
        if self.num_thread == 0 {
            self.num_thread = default_threads;
        }
        if self.num_ctx == 0 {
            self.num_ctx = DEFAULT_NUM_CTX;
        }
        if self.num_batch == 0 {
            self.num_batch = DEFAULT_NUM_BATCH;
        }
        self
    }
}

/// How long a runner stays loaded after its last user releases it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeepAlive {
    Duration(Duration),
    Forever,
}

impl KeepAlive {
    /// Interpret a seconds value; negative means never expire
    pub fn from_secs(secs: i64) -> Self {
        if secs < 0 {
            KeepAlive::Forever
        } else {
            KeepAlive::Duration(Duration::from_secs(secs as u64))
        }
    }

    pub fn is_zero(&self) -> bool {
        matches!(self, KeepAlive::Duration(d) if d.is_zero())
    }

    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            KeepAlive::Duration(d) => Some(*d),
            KeepAlive::Forever => None,
        }
    }
}

impl Default for KeepAlive {
    fn default() -> Self {
        KeepAlive::Duration(Duration::from_secs(5 * 60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = RunnerOptions::default();
        assert_eq!(opts.num_ctx, 2048);
        assert_eq!(opts.num_gpu, -1);
        assert_eq!(opts.total_ctx(), 2048);
    }

    #[test]
    fn test_resolve_fills_unset_fields() {
        let opts = RunnerOptions { num_parallel: 0, num_thread: 0, ..Default::default() }.resolve(4, 8);
        assert_eq!(opts.num_parallel, 4);
        assert_eq!(opts.num_thread, 8);
        assert_eq!(opts.total_ctx(), 2048 * 4);
    }

    #[test]
    fn test_resolve_keeps_explicit_fields() {
        let opts = RunnerOptions { num_parallel: 2, num_thread: 3, ..Default::default() }.resolve(4, 8);
        assert_eq!(opts.num_parallel, 2);
        assert_eq!(opts.num_thread, 3);
    }

    #[test]
    fn test_keep_alive_from_secs() {
        assert_eq!(KeepAlive::from_secs(-1), KeepAlive::Forever);
        assert!(KeepAlive::from_secs(0).is_zero());
        assert_eq!(KeepAlive::from_secs(30).as_duration(), Some(Duration::from_secs(30)));
        assert_eq!(KeepAlive::Forever.as_duration(), None);
    }

    #[test]
    fn test_options_deserialize_partial() {
        let opts: RunnerOptions = serde_json::from_str(r#"{"num_ctx": 4096}"#).unwrap();
        assert_eq!(opts.num_ctx, 4096);
        assert_eq!(opts.num_batch, DEFAULT_NUM_BATCH);
    }
}

use super::request::LlmRequest;
use super::Event;
use crate::estimate::MemoryEstimate;
use crate::gpu::DeviceInfo;
use crate::model::{Model, ModelName};
use crate::options::{KeepAlive, RunnerOptions};
use crate::runner::RunnerServer;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerState {
    Loading,
    Ready,
    Expiring,
    Unloaded,
}

/// Identity of a runner configuration; equal keys may share a runner
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunnerKey {
    pub name: String,
    pub digest: String,
    pub options: RunnerOptions,
    pub adapters: Vec<PathBuf>,
    pub projectors: Vec<PathBuf>,
}

impl RunnerKey {
    pub fn new(model: &Model, options: &RunnerOptions) -> Self {
        let name = ModelName::parse(&model.name)
            .map(|n| n.canonical())
            .unwrap_or_else(|_| model.name.to_ascii_lowercase());
        Self {
            name,
            digest: model.digest.clone(),
            options: options.clone(),
            adapters: model.adapters.clone(),
            projectors: model.projectors.iter().map(|p| p.path.clone()).collect(),
        }
    }

    /// Same model, different configuration
    pub fn conflicts_with(&self, other: &RunnerKey) -> bool {
        self.name == other.name && self != other
    }
}

pub(crate) struct Runner {
    pub id: u64,
    pub key: RunnerKey,
    pub model: Arc<Model>,
    pub options: RunnerOptions,
    pub estimate: MemoryEstimate,
    pub devices: Vec<DeviceInfo>,
    pub server: Option<Arc<dyn RunnerServer>>,
    pub state: RunnerState,
    pub ref_count: u32,
    pub keep_alive: KeepAlive,
    pub expires_at: Option<DateTime<Utc>>,
    pub expiry_generation: u64,
    pub expiry_timer: Option<JoinHandle<()>>,
    pub loaded_at: DateTime<Utc>,
    pub load_duration: Option<Duration>,
    pub load_task: Option<JoinHandle<()>>,
    pub waiters: Vec<LlmRequest>,
}

impl Runner {
    pub fn new(
        id: u64,
        model: Arc<Model>,
        options: RunnerOptions,
        estimate: MemoryEstimate,
        devices: Vec<DeviceInfo>,
        keep_alive: KeepAlive,
    ) -> Self {
        Self {
            id,
            key: RunnerKey::new(&model, &options),
            model,
            options,
            estimate,
            devices,
            server: None,
            state: RunnerState::Loading,
            ref_count: 0,
            keep_alive,
            expires_at: None,
            expiry_generation: 0,
            expiry_timer: None,
            loaded_at: Utc::now(),
            load_duration: None,
            load_task: None,
            waiters: Vec::new(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.ref_count == 0 && matches!(self.state, RunnerState::Ready | RunnerState::Expiring)
    }

    /// Invalidate any armed expiry timer
    pub fn disarm(&mut self) {
        self.expiry_generation += 1;
        self.expires_at = None;
        if let Some(timer) = self.expiry_timer.take() {
            timer.abort();
        }
    }

    /// Hand out one more reference; the runner must have a live server
    pub fn acquire(&mut self, events: &mpsc::UnboundedSender<Event>) -> Option<RunnerHandle> {
        let server = self.server.clone()?;
        self.disarm();
        self.ref_count += 1;
        self.state = RunnerState::Ready;
        Some(RunnerHandle {
            runner_id: self.id,
            model: self.model.clone(),
            options: self.options.clone(),
            estimate: Arc::new(self.estimate.clone()),
            server,
            events: events.clone(),
        })
    }

    pub fn status(&self) -> RunnerStatus {
        RunnerStatus {
            id: self.id,
            model: self.model.name.clone(),
            digest: self.model.digest.clone(),
            state: self.state,
            ref_count: self.ref_count,
            layers_on_gpu: self.estimate.layers_on_gpu,
            total_vram: self.estimate.total_vram,
            total_size: self.estimate.total_size,
            per_device_vram: self.estimate.per_device_vram.clone(),
            options: self.options.clone(),
            expires_at: self.expires_at,
            loaded_at: self.loaded_at,
            load_duration_ms: self.load_duration.map(|d| d.as_millis() as u64),
        }
    }
}

impl fmt::Debug for Runner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runner")
            .field("id", &self.id)
            .field("model", &self.model.name)
            .field("state", &self.state)
            .field("ref_count", &self.ref_count)
            .finish()
    }
}

/// Read-only listing entry for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct RunnerStatus {
    pub id: u64,
    pub model: String,
    pub digest: String,
    pub state: RunnerState,
    pub ref_count: u32,
    pub layers_on_gpu: u64,
    pub total_vram: u64,
    pub total_size: u64,
    pub per_device_vram: BTreeMap<String, u64>,
    pub options: RunnerOptions,
    pub expires_at: Option<DateTime<Utc>>,
    pub loaded_at: DateTime<Utc>,
    pub load_duration_ms: Option<u64>,
}

/// A caller's reference to a ready runner
///
/// Not `Clone`: every handle is one unit of the runner's reference count, and
/// dropping it (or passing it to `Scheduler::release_runner`) gives it back.
pub struct RunnerHandle {
    runner_id: u64,
    model: Arc<Model>,
    options: RunnerOptions,
    estimate: Arc<MemoryEstimate>,
    server: Arc<dyn RunnerServer>,
    events: mpsc::UnboundedSender<Event>,
}

impl RunnerHandle {
    pub fn id(&self) -> u64 {
        self.runner_id
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.options
    }

    pub fn estimate(&self) -> &MemoryEstimate {
        &self.estimate
    }

    pub fn server(&self) -> &Arc<dyn RunnerServer> {
        &self.server
    }
}

impl fmt::Debug for RunnerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnerHandle")
            .field("runner_id", &self.runner_id)
            .field("model", &self.model.name)
            .finish()
    }
}

impl Drop for RunnerHandle {
    fn drop(&mut self) {
        let _ = self.events.send(Event::Finished { runner_id: self.runner_id });
    }
}

//! Runner scheduler
//!
//! One decision loop owns every runner; events are drained before new requests.

pub mod placement;
pub(crate) mod request;
pub mod runner;

pub use request::PendingRunner;
pub use runner::{RunnerHandle, RunnerKey, RunnerState, RunnerStatus};

use crate::error::{Result, SchedulerError};
use crate::estimate::{estimate_gpu_layers, MemoryEstimate};
use crate::gpu::{CpuMemory, DeviceInfo, InventoryProvider};
use crate::metrics;
use crate::model::{Model, ModelName};
use crate::options::{KeepAlive, RunnerOptions};
use crate::runner::{ExitReport, LaunchSpec, RunnerFactory, RunnerServer};
use arc_swap::ArcSwap;
use chrono::Utc;
use placement::{Candidate, Commitment};
use request::LlmRequest;
use runner::Runner;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Applied when a request does not carry its own keep-alive
    pub default_keep_alive: KeepAlive,
    pub load_timeout: Duration,
    /// How long an unload waits for the process to exit
    pub unload_timeout: Duration,
    /// 0 derives the limit from the GPU count
    pub max_loaded_models: usize,
    pub num_parallel: u32,
    /// 0 leaves the choice to the runner
    pub num_threads: u32,
    pub max_queue: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_keep_alive: KeepAlive::default(),
            load_timeout: Duration::from_secs(5 * 60),
            unload_timeout: Duration::from_secs(10),
            max_loaded_models: 0,
            num_parallel: 1,
            num_threads: 0,
            max_queue: 512,
        }
    }
}

/// Lifecycle notifications delivered to the decision loop
#[derive(Debug)]
pub(crate) enum Event {
    Finished { runner_id: u64 },
    Expired { runner_id: u64, generation: u64 },
    Exited { runner_id: u64, report: ExitReport },
    Cancelled { request_id: u64 },
    Shutdown { ack: oneshot::Sender<()> },
}

struct LoadCompletion {
    runner_id: u64,
    result: Result<Arc<dyn RunnerServer>>,
    elapsed: Duration,
}

enum Dispatch {
    Done,
    /// Blocked behind a busy runner of the same model; retried on the next release
    Deferred(LlmRequest),
}

struct Plan {
    estimate: MemoryEstimate,
    devices: Vec<DeviceInfo>,
}

/// Cheap to clone; all clones talk to the same decision loop
#[derive(Clone)]
pub struct Scheduler {
    config: Arc<SchedulerConfig>,
    pending_tx: mpsc::Sender<LlmRequest>,
    events_tx: mpsc::UnboundedSender<Event>,
    snapshot: Arc<ArcSwap<Vec<RunnerStatus>>>,
    next_request_id: Arc<AtomicU64>,
    closed: CancellationToken,
}

impl Scheduler {
    /// Create a scheduler and spawn its decision loop on the current runtime
    pub fn new(
        config: SchedulerConfig,
        inventory: Arc<dyn InventoryProvider>,
        factory: Arc<dyn RunnerFactory>,
    ) -> Self {
        let config = Arc::new(config);
        let (pending_tx, pending_rx) = mpsc::channel(config.max_queue.max(1));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let snapshot = Arc::new(ArcSwap::from_pointee(Vec::new()));

        let decider = Decider {
            config: config.clone(),
            inventory,
            factory,
            runners: BTreeMap::new(),
            deferred: VecDeque::new(),
            next_runner_id: 1,
            events_tx: events_tx.clone(),
            completions_tx,
            snapshot: snapshot.clone(),
        };
        tokio::spawn(decider.run(pending_rx, completions_rx, events_rx));

        Self {
            config,
            pending_tx,
            events_tx,
            snapshot,
            next_request_id: Arc::new(AtomicU64::new(1)),
            closed: CancellationToken::new(),
        }
    }

    /// Ask for a ready runner of `model` configured with `options`.
    ///
    /// Never blocks: the request is validated and queued synchronously and
    /// the returned future resolves exactly once. Cancelling `ctx` resolves
    /// it with [`SchedulerError::Cancelled`].
    pub fn get_runner(
        &self,
        ctx: CancellationToken,
        model: Arc<Model>,
        options: RunnerOptions,
        keep_alive: Option<KeepAlive>,
    ) -> PendingRunner {
        if self.closed.is_cancelled() {
            return PendingRunner::failed(SchedulerError::ShuttingDown);
        }
        if let Err(e) = ModelName::parse(&model.name) {
            return PendingRunner::failed(e);
        }
        if model.adapters.len() > 1 {
            return PendingRunner::failed(SchedulerError::InvalidRequest(format!(
                "this model supports at most one adapter, got {}",
                model.adapters.len()
            )));
        }
        if model.metadata.total_layer_bytes().is_none() {
            return PendingRunner::failed(SchedulerError::InvalidRequest(format!(
                "{} reports layer sizes that overflow 64 bits",
                model.name
            )));
        }
        if ctx.is_cancelled() {
            return PendingRunner::failed(SchedulerError::Cancelled);
        }

        let options = options.resolve(self.config.num_parallel, self.config.num_threads);
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        let request = LlmRequest {
            id,
            model,
            options,
            keep_alive,
            ctx: ctx.clone(),
            reply,
            enqueued_at: Instant::now(),
        };

        match self.pending_tx.try_send(request) {
            Ok(()) => metrics::inc_pending(),
            Err(TrySendError::Full(req)) => {
                warn!("Pending queue full, rejecting request for {}", req.model.name);
                return PendingRunner::failed(SchedulerError::QueueFull(format!(
                    "{} requests already waiting",
                    self.config.max_queue
                )));
            }
            Err(TrySendError::Closed(_)) => return PendingRunner::failed(SchedulerError::ShuttingDown),
        }

        let watch = CancellationToken::new();
        let done = watch.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = ctx.cancelled() => {
                    let _ = events.send(Event::Cancelled { request_id: id });
                }
                _ = done.cancelled() => {}
            }
        });

        PendingRunner::new(rx, watch.drop_guard())
    }

    /// Give a runner reference back; equivalent to dropping the handle
    pub fn release_runner(&self, handle: RunnerHandle) {
        drop(handle);
    }

    /// Snapshot of loaded and loading runners as of the last loop iteration
    pub fn loaded_runners(&self) -> Arc<Vec<RunnerStatus>> {
        self.snapshot.load_full()
    }

    /// Stop accepting requests, fail outstanding ones and unload every runner
    pub async fn shutdown(&self) {
        self.closed.cancel();
        let (ack, done) = oneshot::channel();
        if self.events_tx.send(Event::Shutdown { ack }).is_ok() {
            let _ = done.await;
        }
    }
}

/// State owned by the decision loop task
struct Decider {
    config: Arc<SchedulerConfig>,
    inventory: Arc<dyn InventoryProvider>,
    factory: Arc<dyn RunnerFactory>,
    runners: BTreeMap<u64, Runner>,
    deferred: VecDeque<LlmRequest>,
    next_runner_id: u64,
    events_tx: mpsc::UnboundedSender<Event>,
    completions_tx: mpsc::UnboundedSender<LoadCompletion>,
    snapshot: Arc<ArcSwap<Vec<RunnerStatus>>>,
}

impl Decider {
    async fn run(
        mut self,
        mut pending_rx: mpsc::Receiver<LlmRequest>,
        mut completions_rx: mpsc::UnboundedReceiver<LoadCompletion>,
        mut events_rx: mpsc::UnboundedReceiver<Event>,
    ) {
        info!("Scheduler loop started (queue capacity {})", self.config.max_queue);
        loop {
            tokio::select! {
                biased;
                Some(event) = events_rx.recv() => match event {
                    Event::Shutdown { ack } => {
                        self.shutdown(&mut pending_rx).await;
                        let _ = ack.send(());
                        break;
                    }
                    event => self.handle_event(event).await,
                },
                Some(completion) = completions_rx.recv() => self.handle_load_completion(completion).await,
                request = pending_rx.recv() => match request {
                    Some(req) => {
                        metrics::dec_pending();
                        self.handle_request(req).await;
                    }
                    None => {
                        self.shutdown(&mut pending_rx).await;
                        break;
                    }
                },
            }
            self.publish();
        }
        info!("Scheduler loop stopped");
    }

    fn publish(&self) {
        let statuses: Vec<RunnerStatus> = self.runners.values().map(Runner::status).collect();
        metrics::set_runners_loaded(statuses.len());
        self.snapshot.store(Arc::new(statuses));
    }

    async fn handle_request(&mut self, req: LlmRequest) {
        if req.is_cancelled() {
            req.resolve(Err(SchedulerError::Cancelled));
            return;
        }
        debug!(
            "Scheduling request {} for {} (queued {:?})",
            req.id,
            req.model.name,
            req.enqueued_at.elapsed()
        );
        if let Dispatch::Deferred(req) = self.schedule(req).await {
            debug!("Request {} waits for {} to become idle", req.id, req.model.name);
            self.deferred.push_back(req);
        }
    }

    async fn schedule(&mut self, req: LlmRequest) -> Dispatch {
        let key = RunnerKey::new(&req.model, &req.options);
        let keep_alive = req.keep_alive.unwrap_or(self.config.default_keep_alive);

        if let Some(runner) = self.runners.values_mut().find(|r| r.key == key) {
            runner.keep_alive = keep_alive;
            if runner.state == RunnerState::Loading {
                debug!("Request {} joins load of runner {}", req.id, runner.id);
                runner.waiters.push(req);
            } else {
                match runner.acquire(&self.events_tx) {
                    Some(handle) => {
                        debug!("Reusing runner {} for request {} (refs {})", runner.id, req.id, runner.ref_count);
                        req.resolve(Ok(handle));
                    }
                    None => req.resolve(Err(SchedulerError::LoadFailed(format!(
                        "runner {} has no live server",
                        runner.id
                    )))),
                }
            }
            return Dispatch::Done;
        }

        let conflicting: Vec<u64> = self
            .runners
            .values()
            .filter(|r| r.key.conflicts_with(&key))
            .map(|r| r.id)
            .collect();
        if !conflicting.is_empty() {
            let busy = conflicting
                .iter()
                .any(|id| self.runners.get(id).map_or(false, |r| !r.is_idle()));
            if busy {
                return Dispatch::Deferred(req);
            }
            info!("Reloading {} with a different configuration", key.name);
            self.evict(&conflicting, "reconfigured").await;
        }

        match self.place(&req).await {
            Ok(plan) => self.start_load(req, plan, keep_alive),
            Err(e) => {
                warn!("Cannot place {}: {}", req.model.name, e);
                metrics::inc_load(e.kind());
                req.resolve(Err(e));
            }
        }
        Dispatch::Done
    }

    async fn inventory_view(&self) -> (Vec<DeviceInfo>, CpuMemory) {
        (self.inventory.list_devices().await, self.inventory.cpu_memory().await)
    }

    /// Memory held by every runner except `exclude`
    fn commitment(&self, exclude: &[u64]) -> Commitment {
        let mut committed = Commitment::default();
        for runner in self.runners.values().filter(|r| !exclude.contains(&r.id)) {
            committed.add(&runner.estimate);
        }
        committed
    }

    fn released(&self, ids: &[u64]) -> Commitment {
        let mut released = Commitment::default();
        for id in ids {
            if let Some(runner) = self.runners.get(id) {
                released.add(&runner.estimate);
            }
        }
        released
    }

    fn estimate(devices: &[DeviceInfo], req: &LlmRequest) -> MemoryEstimate {
        estimate_gpu_layers(devices, req.model.metadata.as_ref(), &req.model.projectors, &req.options)
    }

    /// Estimate with `victims` gone, and whether the result is acceptable
    fn try_fit(
        &self,
        devices: &[DeviceInfo],
        cpu: &CpuMemory,
        ideal: &MemoryEstimate,
        req: &LlmRequest,
        victims: &[u64],
        limit: usize,
    ) -> (MemoryEstimate, bool) {
        let committed = self.commitment(victims);
        let released = self.released(victims);
        let estimate = Self::estimate(&placement::effective_devices(devices, &committed, &released), req);
        let host_free = placement::effective_host_free(cpu, &committed, &released);
        let contended = self
            .runners
            .values()
            .filter(|r| !victims.contains(&r.id))
            .any(|r| r.estimate.per_device_vram.keys().any(|id| ideal.per_device_vram.contains_key(id)));
        let remaining = self.runners.len().saturating_sub(victims.len());
        let ok = placement::fits(&estimate, ideal, host_free, contended) && remaining < limit;
        (estimate, ok)
    }

    async fn place(&mut self, req: &LlmRequest) -> Result<Plan> {
        let (devices, cpu) = self.inventory_view().await;
        let limit = placement::max_loaded_models(self.config.max_loaded_models, devices.len());
        let ideal = Self::estimate(&placement::empty_devices(&devices), req);

        let (estimate, ok) = self.try_fit(&devices, &cpu, &ideal, req, &[], limit);
        if ok {
            return Ok(Plan { estimate, devices });
        }

        let victims = self.choose_victims(&devices, &cpu, &ideal, req, limit).ok_or_else(|| {
            SchedulerError::ResourceExhausted(format!(
                "{} needs {} bytes ({} layers on GPU) and no idle runner can make room",
                req.model.name, ideal.total_size, ideal.layers_on_gpu
            ))
        })?;
        info!("Evicting {} idle runner(s) to load {}", victims.len(), req.model.name);
        for _ in &victims {
            metrics::inc_eviction();
        }
        self.evict(&victims, "evicted").await;

        let (devices, cpu) = self.inventory_view().await;
        let limit = placement::max_loaded_models(self.config.max_loaded_models, devices.len());
        let ideal = Self::estimate(&placement::empty_devices(&devices), req);
        let (estimate, ok) = self.try_fit(&devices, &cpu, &ideal, req, &[], limit);
        if ok {
            Ok(Plan { estimate, devices })
        } else {
            Err(SchedulerError::ResourceExhausted(format!(
                "{} still does not fit after eviction",
                req.model.name
            )))
        }
    }

    /// Shortest prefix of the eviction order that makes the request fit
    fn choose_victims(
        &self,
        devices: &[DeviceInfo],
        cpu: &CpuMemory,
        ideal: &MemoryEstimate,
        req: &LlmRequest,
        limit: usize,
    ) -> Option<Vec<u64>> {
        let candidates = self
            .runners
            .values()
            .filter(|r| r.is_idle())
            .map(|r| Candidate {
                id: r.id,
                expires_at: r.expires_at,
                freed: r.estimate.total_size,
                loaded_at: r.loaded_at,
            })
            .collect();
        let order = placement::eviction_order(candidates);
        (1..=order.len())
            .map(|k| &order[..k])
            .find(|victims| self.try_fit(devices, cpu, ideal, req, victims, limit).1)
            .map(|victims| victims.to_vec())
    }

    fn start_load(&mut self, req: LlmRequest, plan: Plan, keep_alive: KeepAlive) {
        let id = self.next_runner_id;
        self.next_runner_id += 1;

        info!(
            "Loading {} as runner {}: {}/{} layers on GPU, {} bytes VRAM, {} bytes total",
            req.model.name,
            id,
            plan.estimate.layers_on_gpu,
            plan.estimate.layer_count,
            plan.estimate.total_vram,
            plan.estimate.total_size
        );
        if !plan.estimate.fully_offloaded() {
            debug!(
                "{} keeps {} of {} layers on CPU",
                req.model.name,
                plan.estimate.layer_count.saturating_sub(plan.estimate.layers_on_gpu),
                plan.estimate.layer_count
            );
        }

        let spec = LaunchSpec {
            runner_id: id,
            model: req.model.clone(),
            options: req.options.clone(),
            estimate: plan.estimate.clone(),
            devices: plan.devices.clone(),
        };
        let mut runner = Runner::new(
            id,
            req.model.clone(),
            req.options.clone(),
            plan.estimate,
            plan.devices,
            keep_alive,
        );

        let factory = self.factory.clone();
        let completions = self.completions_tx.clone();
        let timeout = self.config.load_timeout;
        runner.load_task = Some(tokio::spawn(async move {
            let started = Instant::now();
            let result = load_runner(factory, spec, timeout).await;
            let _ = completions.send(LoadCompletion { runner_id: id, result, elapsed: started.elapsed() });
        }));
        runner.waiters.push(req);
        self.runners.insert(id, runner);
    }

    async fn handle_load_completion(&mut self, completion: LoadCompletion) {
        let LoadCompletion { runner_id, result, elapsed } = completion;
        let Some(runner) = self.runners.get_mut(&runner_id) else {
            // Removed while loading; nobody wants it any more
            if let Ok(server) = result {
                server.close().await;
            }
            return;
        };
        runner.load_task = None;

        match result {
            Ok(server) => {
                runner.server = Some(server.clone());
                runner.state = RunnerState::Ready;
                runner.load_duration = Some(elapsed);
                metrics::inc_load("success");
                metrics::observe_load_duration(elapsed.as_secs_f64());
                info!("Runner {} ready for {} in {:.2?}", runner_id, runner.model.name, elapsed);

                let events = self.events_tx.clone();
                tokio::spawn(async move {
                    let report = server.wait_exit().await;
                    let _ = events.send(Event::Exited { runner_id, report });
                });

                for waiter in std::mem::take(&mut runner.waiters) {
                    if waiter.is_cancelled() {
                        waiter.resolve(Err(SchedulerError::Cancelled));
                        continue;
                    }
                    match runner.acquire(&self.events_tx) {
                        Some(handle) => waiter.resolve(Ok(handle)),
                        None => waiter.resolve(Err(SchedulerError::LoadFailed("runner has no server".into()))),
                    }
                }

                if runner.ref_count == 0 {
                    self.arm_expiry(runner_id);
                    self.retry_deferred().await;
                }
            }
            Err(e) => {
                warn!("Runner {} for {} failed to load: {}", runner_id, runner.model.name, e);
                metrics::inc_load(e.kind());
                if let Some(mut runner) = self.take_runner(runner_id, "load_failed") {
                    for waiter in runner.waiters.drain(..) {
                        let err = if waiter.is_cancelled() { SchedulerError::Cancelled } else { e.clone() };
                        waiter.resolve(Err(err));
                    }
                }
                self.retry_deferred().await;
            }
        }
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Finished { runner_id } => {
                let Some(runner) = self.runners.get_mut(&runner_id) else { return };
                runner.ref_count = runner.ref_count.saturating_sub(1);
                debug!("Runner {} released (refs {})", runner_id, runner.ref_count);
                if runner.ref_count == 0 {
                    self.arm_expiry(runner_id);
                    self.retry_deferred().await;
                }
            }
            Event::Expired { runner_id, generation } => {
                let due = self.runners.get(&runner_id).map_or(false, |r| {
                    r.expiry_generation == generation && r.ref_count == 0 && r.state == RunnerState::Expiring
                });
                if !due {
                    return;
                }
                if let Some(runner) = self.take_runner(runner_id, "expired") {
                    self.unload_in_background(runner);
                }
                self.retry_deferred().await;
            }
            Event::Exited { runner_id, report } => {
                let Some(mut runner) = self.take_runner(runner_id, "crashed") else { return };
                warn!("Runner {} for {} exited unexpectedly: {}", runner_id, runner.model.name, report);
                for waiter in runner.waiters.drain(..) {
                    waiter.resolve(Err(SchedulerError::RunnerCrashed(report.to_string())));
                }
                self.retry_deferred().await;
            }
            Event::Cancelled { request_id } => self.cancel_request(request_id),
            // Handled by the loop itself
            Event::Shutdown { .. } => {}
        }
    }

    fn arm_expiry(&mut self, runner_id: u64) {
        let Some(runner) = self.runners.get_mut(&runner_id) else { return };
        runner.disarm();
        runner.state = RunnerState::Expiring;
        let generation = runner.expiry_generation;

        match runner.keep_alive {
            KeepAlive::Forever => debug!("Runner {} idle, kept loaded", runner_id),
            keep_alive if keep_alive.is_zero() => {
                let _ = self.events_tx.send(Event::Expired { runner_id, generation });
            }
            KeepAlive::Duration(d) => {
                runner.expires_at = chrono::Duration::from_std(d)
                    .ok()
                    .and_then(|d| Utc::now().checked_add_signed(d));
                debug!("Runner {} idle, expires in {:?}", runner_id, d);
                let events = self.events_tx.clone();
                runner.expiry_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(d).await;
                    let _ = events.send(Event::Expired { runner_id, generation });
                }));
            }
        }
    }

    fn cancel_request(&mut self, request_id: u64) {
        for runner in self.runners.values_mut() {
            if let Some(pos) = runner.waiters.iter().position(|w| w.id == request_id) {
                let waiter = runner.waiters.remove(pos);
                debug!("Request {} cancelled while runner {} loads", request_id, runner.id);
                waiter.resolve(Err(SchedulerError::Cancelled));
                return;
            }
        }
        if let Some(pos) = self.deferred.iter().position(|r| r.id == request_id) {
            if let Some(req) = self.deferred.remove(pos) {
                debug!("Deferred request {} cancelled", request_id);
                req.resolve(Err(SchedulerError::Cancelled));
            }
        }
    }

    async fn retry_deferred(&mut self) {
        if self.deferred.is_empty() {
            return;
        }
        for req in std::mem::take(&mut self.deferred) {
            if req.is_cancelled() {
                req.resolve(Err(SchedulerError::Cancelled));
                continue;
            }
            if let Dispatch::Deferred(req) = self.schedule(req).await {
                self.deferred.push_back(req);
            }
        }
    }

    /// Remove a runner from the table; the caller deals with its waiters and server
    fn take_runner(&mut self, runner_id: u64, reason: &str) -> Option<Runner> {
        let mut runner = self.runners.remove(&runner_id)?;
        runner.disarm();
        runner.state = RunnerState::Unloaded;
        if let Some(task) = runner.load_task.take() {
            task.abort();
        }
        metrics::inc_unload(reason);
        info!("Unloading runner {} ({}): {}", runner_id, runner.model.name, reason);
        Some(runner)
    }

    /// Unload idle runners and wait for their processes to exit
    async fn evict(&mut self, ids: &[u64], reason: &str) {
        let mut servers = Vec::new();
        for id in ids {
            if let Some(mut runner) = self.take_runner(*id, reason) {
                if let Some(server) = runner.server.take() {
                    server.close().await;
                    servers.push(server);
                }
            }
        }
        await_exits(servers, self.config.unload_timeout).await;
    }

    fn unload_in_background(&self, mut runner: Runner) {
        let Some(server) = runner.server.take() else { return };
        let timeout = self.config.unload_timeout;
        tokio::spawn(async move {
            server.close().await;
            await_exits(vec![server], timeout).await;
        });
    }

    async fn shutdown(&mut self, pending_rx: &mut mpsc::Receiver<LlmRequest>) {
        info!("Scheduler shutting down, unloading {} runner(s)", self.runners.len());
        pending_rx.close();
        while let Ok(req) = pending_rx.try_recv() {
            metrics::dec_pending();
            req.resolve(Err(SchedulerError::ShuttingDown));
        }
        for req in self.deferred.drain(..) {
            req.resolve(Err(SchedulerError::ShuttingDown));
        }

        let ids: Vec<u64> = self.runners.keys().copied().collect();
        let mut servers = Vec::new();
        for id in ids {
            if let Some(mut runner) = self.take_runner(id, "shutdown") {
                for waiter in runner.waiters.drain(..) {
                    waiter.resolve(Err(SchedulerError::ShuttingDown));
                }
                if let Some(server) = runner.server.take() {
                    server.close().await;
                    servers.push(server);
                }
            }
        }
        await_exits(servers, self.config.unload_timeout).await;
        self.publish();
    }
}

/// Start a runner and wait for it to become ready, closing it on failure
async fn load_runner(
    factory: Arc<dyn RunnerFactory>,
    spec: LaunchSpec,
    timeout: Duration,
) -> Result<Arc<dyn RunnerServer>> {
    let server = factory.start(spec).await?;
    let ready = match tokio::time::timeout(timeout, server.wait_until_ready(timeout)).await {
        Ok(result) => result,
        Err(_) => Err(SchedulerError::LoadTimeout(format!("not ready after {:?}", timeout))),
    };
    match ready {
        Ok(()) => Ok(server),
        Err(e) => {
            server.close().await;
            Err(e)
        }
    }
}

async fn await_exits(servers: Vec<Arc<dyn RunnerServer>>, timeout: Duration) {
    if servers.is_empty() {
        return;
    }
    let waits = servers.iter().map(|s| tokio::time::timeout(timeout, s.wait_exit()));
    for result in futures_util::future::join_all(waits).await {
        if result.is_err() {
            warn!("Runner did not exit within {:?}", timeout);
        }
    }
}

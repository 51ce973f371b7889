use prometheus::{Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder};
use lazy_static::lazy_static;
use std::sync::OnceLock;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}
static RUNNER_LOADS: OnceLock<IntCounterVec> = OnceLock::new();
static RUNNER_EVICTIONS: OnceLock<IntCounter> = OnceLock::new();
static RUNNER_UNLOADS: OnceLock<IntCounterVec> = OnceLock::new();
static RUNNERS_LOADED: OnceLock<IntGauge> = OnceLock::new();
static PENDING_REQUESTS: OnceLock<IntGauge> = OnceLock::new();
static LOAD_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Register scheduler metrics. Safe to call more than once; helpers are no-ops before it.
pub fn init_metrics() -> prometheus::Result<()> {
    let loads = IntCounterVec::new(
        prometheus::opts!("runner_loads_total", "Runner loads by result"),
        &["result"],
    )?;
    let evictions = IntCounter::new("runner_evictions_total", "Idle runners evicted to make room")?;
    let unloads = IntCounterVec::new(
        prometheus::opts!("runner_unloads_total", "Runner unloads by reason"),
        &["reason"],
    )?;
    let loaded = IntGauge::new("runners_loaded", "Runners currently loaded or loading")?;
    let pending = IntGauge::new("scheduler_pending_requests", "Requests waiting in the scheduler queue")?;
    let load_duration = Histogram::with_opts(
        prometheus::HistogramOpts::new("runner_load_duration_seconds", "Time from spawn to ready")
            .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
    )?;

    let loads = RUNNER_LOADS.get_or_init(|| loads);
    let evictions = RUNNER_EVICTIONS.get_or_init(|| evictions);
    let unloads = RUNNER_UNLOADS.get_or_init(|| unloads);
    let loaded = RUNNERS_LOADED.get_or_init(|| loaded);
    let pending = PENDING_REQUESTS.get_or_init(|| pending);
    let load_duration = LOAD_DURATION.get_or_init(|| load_duration);

    REGISTRY.register(Box::new(loads.clone())).ok();
    REGISTRY.register(Box::new(evictions.clone())).ok();
    REGISTRY.register(Box::new(unloads.clone())).ok();
    REGISTRY.register(Box::new(loaded.clone())).ok();
    REGISTRY.register(Box::new(pending.clone())).ok();
    REGISTRY.register(Box::new(load_duration.clone())).ok();
    Ok(())
}

pub fn inc_load(result: &str) {
    if let Some(counter) = RUNNER_LOADS.get() {
        counter.with_label_values(&[result]).inc();
    }
}

pub fn inc_eviction() {
    if let Some(counter) = RUNNER_EVICTIONS.get() {
        counter.inc();
    }
}

pub fn inc_unload(reason: &str) {
    if let Some(counter) = RUNNER_UNLOADS.get() {
        counter.with_label_values(&[reason]).inc();
    }
}

pub fn set_runners_loaded(count: usize) {
    if let Some(gauge) = RUNNERS_LOADED.get() {
        gauge.set(count as i64);
    }
}

pub fn inc_pending() {
    if let Some(gauge) = PENDING_REQUESTS.get() {
        gauge.inc();
    }
}

pub fn dec_pending() {
    if let Some(gauge) = PENDING_REQUESTS.get() {
        gauge.dec();
    }
}

pub fn observe_load_duration(seconds: f64) {
    if let Some(histogram) = LOAD_DURATION.get() {
        histogram.observe(seconds);
    }
}

/// Text exposition of every registered metric
pub fn gather() -> anyhow::Result<Vec<u8>> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(buffer)
}

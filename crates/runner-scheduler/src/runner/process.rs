//! llama-server subprocess runner

use super::{CompletionChunk, CompletionRequest, ExitReport, LaunchSpec, RunnerFactory, RunnerServer};
use crate::error::{Result, SchedulerError};
use anyhow::Context;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(250);
const HEALTH_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

pub struct LlamaServerFactory {
    bin: PathBuf,
    host: String,
    client: reqwest::Client,
}

impl LlamaServerFactory {
    pub fn new(bin: impl Into<PathBuf>, host: impl Into<String>) -> Self {
        Self {
            bin: bin.into(),
            host: host.into(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(600))
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl RunnerFactory for LlamaServerFactory {
    async fn start(&self, spec: LaunchSpec) -> Result<Arc<dyn RunnerServer>> {
        if !self.bin.exists() {
            return Err(SchedulerError::LoadFailed(format!(
                "llama-server binary not found at: {}",
                self.bin.display()
            )));
        }
        let server = LlamaServerProcess::spawn(&self.bin, &self.host, &spec, self.client.clone())?;
        Ok(Arc::new(server))
    }
}

pub struct LlamaServerProcess {
    base_url: String,
    client: reqwest::Client,
    slots: Arc<Semaphore>,
    kill: CancellationToken,
    exit_rx: watch::Receiver<Option<ExitReport>>,
}

#[derive(Debug, PartialEq, Eq)]
enum Health {
    Ready,
    Loading,
}

#[derive(Debug, Deserialize)]
struct CompletionEvent {
    #[serde(default)]
    content: String,
    #[serde(default)]
    stop: bool,
    #[serde(default)]
    stop_type: Option<String>,
    #[serde(default)]
    tokens_predicted: u64,
    #[serde(default)]
    tokens_evaluated: u64,
}

impl From<CompletionEvent> for CompletionChunk {
    fn from(event: CompletionEvent) -> Self {
        CompletionChunk {
            content: event.content,
            done: event.stop,
            stop_reason: if event.stop { event.stop_type } else { None },
            prompt_eval_count: event.tokens_evaluated,
            eval_count: event.tokens_predicted,
        }
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct TokenizeResponse {
    tokens: Vec<i32>,
}

#[derive(Debug, Deserialize)]
struct DetokenizeResponse {
    content: String,
}

impl LlamaServerProcess {
    /// Start llama-server for `spec` on a free port of `host`
    pub fn spawn(bin: &Path, host: &str, spec: &LaunchSpec, client: reqwest::Client) -> Result<Self> {
        let port = free_port(host)?;
        let (args, env) = launch_args(spec, host, port);

        info!(
            "Starting runner {} for {}: {} GPU layers, ctx {}, port {}",
            spec.runner_id,
            spec.model.name,
            spec.estimate.layers_on_gpu,
            spec.options.total_ctx(),
            port
        );
        debug!("{} {}", bin.display(), args.join(" "));

        let mut cmd = Command::new(bin);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            SchedulerError::LoadFailed(format!("failed to spawn {}: {}", bin.display(), e))
        })?;
        let pid = child.id();

        let last_line: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let stderr_task = child.stderr.take().map(|stderr| {
            let last_line = last_line.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "runner", pid = ?pid, "{}", line);
                    if !line.trim().is_empty() {
                        *last_line.lock().await = Some(line);
                    }
                }
            })
        });

        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = CancellationToken::new();
        let kill_signal = kill.clone();

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_signal.cancelled() => {
                    if let Err(e) = child.start_kill() {
                        warn!("Failed to kill runner process {:?}: {}", pid, e);
                    }
                    child.wait().await
                }
            };
            if let Some(task) = stderr_task {
                let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
            }
            let report = ExitReport {
                code: status.ok().and_then(|s| s.code()),
                last_error: last_line.lock().await.clone(),
            };
            info!("Runner process {:?} exited: {}", pid, report);
            let _ = exit_tx.send(Some(report));
        });

        Ok(Self {
            base_url: format!("http://{}:{}", host, port),
            client,
            slots: Arc::new(Semaphore::new(spec.options.num_parallel.max(1) as usize)),
            kill,
            exit_rx,
        })
    }

    /// Use an already running llama-server; `close` only detaches from it
    pub fn connect(base_url: impl Into<String>, num_parallel: u32, client: reqwest::Client) -> Self {
        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = CancellationToken::new();
        let detached = kill.clone();
        tokio::spawn(async move {
            detached.cancelled().await;
            let _ = exit_tx.send(Some(ExitReport::default()));
        });

        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            slots: Arc::new(Semaphore::new(num_parallel.max(1) as usize)),
            kill,
            exit_rx,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn health(&self) -> anyhow::Result<Health> {
        let resp = self
            .client
            .get(format!("{}/health", self.base_url))
            .timeout(HEALTH_REQUEST_TIMEOUT)
            .send()
            .await
            .context("Health check failed")?;

        let status = resp.status();
        if status.is_success() {
            Ok(Health::Ready)
        } else if status == reqwest::StatusCode::SERVICE_UNAVAILABLE {
            Ok(Health::Loading)
        } else {
            Err(anyhow::anyhow!("Health check returned: {}", status))
        }
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> anyhow::Result<T> {
        let _permit = self.slots.acquire().await.context("runner is closed")?;
        let resp = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("{} request failed", path))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("{} failed ({}): {}", path, status, body);
        }

        resp.json()
            .await
            .with_context(|| format!("Failed to parse {} response", path))
    }
}

#[async_trait]
impl RunnerServer for LlamaServerProcess {
    async fn ping(&self) -> anyhow::Result<()> {
        match self.health().await? {
            Health::Ready => Ok(()),
            Health::Loading => Err(anyhow::anyhow!("model is still loading")),
        }
    }

    async fn wait_until_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut exit_rx = self.exit_rx.clone();

        loop {
            if let Some(report) = exit_rx.borrow().clone() {
                return Err(SchedulerError::LoadFailed(report.to_string()));
            }
            match self.health().await {
                Ok(Health::Ready) => return Ok(()),
                Ok(Health::Loading) => {}
                Err(e) => debug!("Runner at {} not up yet: {}", self.base_url, e),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SchedulerError::LoadTimeout(format!(
                    "no healthy response from {} within {:?}",
                    self.base_url, timeout
                )));
            }
            tokio::select! {
                _ = tokio::time::sleep(HEALTH_POLL_INTERVAL) => {}
                _ = exit_rx.changed() => {}
            }
        }
    }

    async fn completion(
        &self,
        request: CompletionRequest,
        callback: &mut (dyn FnMut(CompletionChunk) + Send),
    ) -> anyhow::Result<()> {
        let _permit = self.slots.acquire().await.context("runner is closed")?;

        let mut body = serde_json::to_value(&request)?;
        body["stream"] = serde_json::json!(true);
        body["cache_prompt"] = serde_json::json!(true);

        let resp = self
            .client
            .post(format!("{}/completion", self.base_url))
            .json(&body)
            .send()
            .await
            .context("Completion request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Completion failed ({}): {}", status, body);
        }

        let mut stream = resp.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("Stream read error")?;
            buffer.extend_from_slice(&chunk);

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                if let Some(event) = parse_event_line(&String::from_utf8_lossy(&line))? {
                    let done = event.stop;
                    callback(event.into());
                    if done {
                        return Ok(());
                    }
                }
            }
        }

        if let Some(event) = parse_event_line(&String::from_utf8_lossy(&buffer))? {
            if event.stop {
                callback(event.into());
                return Ok(());
            }
        }

        anyhow::bail!("Completion stream ended before the final chunk")
    }

    async fn embed(&self, inputs: Vec<String>) -> anyhow::Result<Vec<Vec<f32>>> {
        let resp: EmbeddingResponse = self
            .post_json("/v1/embeddings", serde_json::json!({ "input": inputs }))
            .await?;
        let mut data = resp.data;
        data.sort_by_key(|d| d.index);
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }

    async fn tokenize(&self, text: &str) -> anyhow::Result<Vec<i32>> {
        let resp: TokenizeResponse = self
            .post_json("/tokenize", serde_json::json!({ "content": text }))
            .await?;
        Ok(resp.tokens)
    }

    async fn detokenize(&self, tokens: &[i32]) -> anyhow::Result<String> {
        let resp: DetokenizeResponse = self
            .post_json("/detokenize", serde_json::json!({ "tokens": tokens }))
            .await?;
        Ok(resp.content)
    }

    async fn close(&self) {
        if !self.kill.is_cancelled() {
            debug!("Closing runner at {}", self.base_url);
            self.kill.cancel();
        }
        self.slots.close();
    }

    async fn wait_exit(&self) -> ExitReport {
        let mut rx = self.exit_rx.clone();
        let report = match rx.wait_for(Option::is_some).await {
            Ok(report) => (*report).clone(),
            Err(_) => None,
        };
        report.unwrap_or_default()
    }
}

impl Drop for LlamaServerProcess {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

/// `data: {...}` lines carry completion events; anything else is ignored
fn parse_event_line(line: &str) -> anyhow::Result<Option<CompletionEvent>> {
    let line = line.trim();
    let Some(data) = line.strip_prefix("data: ") else {
        return Ok(None);
    };
    if data == "[DONE]" {
        return Ok(Some(CompletionEvent {
            content: String::new(),
            stop: true,
            stop_type: None,
            tokens_predicted: 0,
            tokens_evaluated: 0,
        }));
    }
    let event = serde_json::from_str(data).with_context(|| format!("Invalid completion event: {}", data))?;
    Ok(Some(event))
}

fn free_port(host: &str) -> Result<u16> {
    let listener = std::net::TcpListener::bind((host, 0))
        .map_err(|e| SchedulerError::LoadFailed(format!("no free port on {}: {}", host, e)))?;
    listener
        .local_addr()
        .map(|addr| addr.port())
        .map_err(|e| SchedulerError::LoadFailed(format!("no free port on {}: {}", host, e)))
}

/// Command line and environment for one runner
pub(crate) fn launch_args(spec: &LaunchSpec, host: &str, port: u16) -> (Vec<String>, Vec<(String, String)>) {
    let opts = &spec.options;
    let mut args = vec![
        "--model".to_string(),
        spec.model.path.display().to_string(),
        "--ctx-size".to_string(),
        opts.total_ctx().to_string(),
        "--batch-size".to_string(),
        opts.num_batch.to_string(),
        "--n-gpu-layers".to_string(),
        spec.estimate.layers_on_gpu.to_string(),
        "--parallel".to_string(),
        opts.num_parallel.max(1).to_string(),
        "--host".to_string(),
        host.to_string(),
        "--port".to_string(),
        port.to_string(),
        "--embedding".to_string(),
    ];
    if opts.num_thread > 0 {
        args.push("--threads".to_string());
        args.push(opts.num_thread.to_string());
    }
    if let Some(adapter) = spec.model.adapters.first() {
        args.push("--lora".to_string());
        args.push(adapter.display().to_string());
    }
    if let Some(projector) = spec.model.projectors.first() {
        args.push("--mmproj".to_string());
        args.push(projector.path.display().to_string());
    }

    let used: Vec<_> = spec
        .devices
        .iter()
        .filter_map(|d| spec.estimate.layers_per_device.get(&d.id).map(|n| (d, *n)))
        .collect();

    if used.len() > 1 {
        let split: Vec<String> = used.iter().map(|(_, n)| n.to_string()).collect();
        args.push("--tensor-split".to_string());
        args.push(split.join(","));
    }

    let mut env = Vec::new();
    if let Some((first, _)) = used.first() {
        if let Some(var) = first.library.visible_devices_env() {
            let ids: Vec<&str> = used.iter().map(|(d, _)| d.id.as_str()).collect();
            env.push((var.to_string(), ids.join(",")));
        }
    }

    (args, env)
}

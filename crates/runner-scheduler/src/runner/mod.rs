//! Runner subprocess interface

pub mod process;

pub use process::{LlamaServerFactory, LlamaServerProcess};

use crate::error::Result;
use crate::estimate::MemoryEstimate;
use crate::gpu::DeviceInfo;
use crate::model::Model;
use crate::options::RunnerOptions;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub prompt: String,
    /// Tokens to generate; `-1` means until a stop condition
    #[serde(default = "default_n_predict")]
    pub n_predict: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
}

fn default_n_predict() -> i32 {
    -1
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            n_predict: default_n_predict(),
            temperature: None,
            stop: Vec::new(),
            seed: None,
        }
    }
}

/// One streamed piece of a completion; the last chunk has `done == true`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionChunk {
    pub content: String,
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    pub prompt_eval_count: u64,
    pub eval_count: u64,
}

/// Everything a factory needs to start a runner
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub runner_id: u64,
    pub model: Arc<Model>,
    pub options: RunnerOptions,
    pub estimate: MemoryEstimate,
    /// Device view the estimate was computed against
    pub devices: Vec<DeviceInfo>,
}

/// How a runner process ended
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitReport {
    pub code: Option<i32>,
    /// Last line the process wrote to stderr
    pub last_error: Option<String>,
}

impl fmt::Display for ExitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.code, &self.last_error) {
            (_, Some(line)) => f.write_str(line),
            (Some(code), None) => write!(f, "exit status {}", code),
            (None, None) => f.write_str("terminated by signal"),
        }
    }
}

#[async_trait]
pub trait RunnerServer: Send + Sync {
    /// Succeeds when the server answers its health endpoint
    async fn ping(&self) -> anyhow::Result<()>;

    /// Wait for the model to finish loading. Fails with `LoadTimeout` after
    /// `timeout`, or `LoadFailed` if the process exits first.
    async fn wait_until_ready(&self, timeout: Duration) -> Result<()>;

    /// Run a completion, handing each chunk to `callback` as it arrives
    async fn completion(
        &self,
        request: CompletionRequest,
        callback: &mut (dyn FnMut(CompletionChunk) + Send),
    ) -> anyhow::Result<()>;

    async fn embed(&self, inputs: Vec<String>) -> anyhow::Result<Vec<Vec<f32>>>;

    async fn tokenize(&self, text: &str) -> anyhow::Result<Vec<i32>>;

    async fn detokenize(&self, tokens: &[i32]) -> anyhow::Result<String>;

    /// Terminate the process. Safe to call more than once.
    async fn close(&self);

    /// Resolves once the process has exited, for whatever reason
    async fn wait_exit(&self) -> ExitReport;
}

#[async_trait]
pub trait RunnerFactory: Send + Sync {
    /// Start a runner; the returned server may still be loading
    async fn start(&self, spec: LaunchSpec) -> Result<Arc<dyn RunnerServer>>;
}

//! Diagnostics and inference HTTP surface for the binary

use crate::config::Config;
use crate::error::SchedulerError;
use crate::gpu::SystemInventory;
use crate::metrics;
use crate::model::{ManifestCatalog, Model, ModelCatalog};
use crate::options::{KeepAlive, RunnerOptions};
use crate::runner::{CompletionChunk, CompletionRequest, LlamaServerFactory};
use crate::scheduler::{RunnerHandle, Scheduler};
use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use validator::Validate;

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Scheduler,
    pub catalog: Arc<dyn ModelCatalog>,
}

impl AppState {
    async fn acquire(
        &self,
        model: Arc<Model>,
        options: Option<RunnerOptions>,
        keep_alive: Option<i64>,
    ) -> Result<RunnerHandle, ApiError> {
        let ctx = CancellationToken::new();
        let _cancel_on_drop = ctx.clone().drop_guard();
        let pending = self.scheduler.get_runner(
            ctx,
            model,
            options.unwrap_or_default(),
            keep_alive.map(KeepAlive::from_secs),
        );
        Ok(pending.await?)
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    /// The same request may succeed later
    pub retryable: bool,
}

impl ApiError {
    fn runner(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            message: format!("runner error: {:#}", err),
            retryable: false,
        }
    }
}

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        let status = match &err {
            SchedulerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            SchedulerError::ResourceExhausted(_)
            | SchedulerError::QueueFull(_)
            | SchedulerError::ShuttingDown
            | SchedulerError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            SchedulerError::LoadTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            SchedulerError::LoadFailed(_) | SchedulerError::RunnerCrashed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (
            self.status,
            Json(json!({
                "error": self.message,
                "code": self.status.as_u16(),
                "retryable": self.retryable,
            })),
        )
            .into_response()
    }
}

fn validate_request<T: Validate>(req: &T) -> Result<(), ApiError> {
    req.validate().map_err(|e| ApiError {
        status: StatusCode::BAD_REQUEST,
        message: e.to_string(),
        retryable: false,
    })
}

#[derive(Debug, Deserialize, Validate)]
pub struct LoadRequest {
    #[validate(length(min = 1, max = 512))]
    pub model: String,
    #[serde(default)]
    pub options: Option<RunnerOptions>,
    /// Seconds; negative keeps the runner loaded forever
    #[serde(default)]
    pub keep_alive: Option<i64>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct GenerateRequest {
    #[validate(length(min = 1, max = 512))]
    pub model: String,
    #[validate(length(max = 1048576))]
    pub prompt: String,
    #[serde(default)]
    pub options: Option<RunnerOptions>,
    #[serde(default)]
    pub keep_alive: Option<i64>,
    /// `-1` generates until a stop condition
    pub n_predict: Option<i32>,
    #[validate(range(min = 0.0, max = 2.0))]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub stop: Vec<String>,
    pub seed: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub model: String,
    pub response: String,
    pub done: bool,
    pub stop_reason: Option<String>,
    pub prompt_eval_count: u64,
    pub eval_count: u64,
    pub runner_id: u64,
}

#[derive(Debug, Deserialize, Validate)]
pub struct EmbedRequest {
    #[validate(length(min = 1, max = 512))]
    pub model: String,
    #[validate(length(min = 1, max = 2048))]
    pub input: Vec<String>,
    #[serde(default)]
    pub options: Option<RunnerOptions>,
    #[serde(default)]
    pub keep_alive: Option<i64>,
}

async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "models": state.catalog.list().await }))
}

async fn list_runners(State(state): State<AppState>) -> impl IntoResponse {
    let runners = state.scheduler.loaded_runners();
    Json(json!({ "models": &*runners }))
}

/// Warm a model: load it (or refresh its keep-alive) and release it straight away
async fn load_model(
    State(state): State<AppState>,
    Json(req): Json<LoadRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_request(&req)?;
    let model = state.catalog.resolve(&req.model).await?;
    let handle = state.acquire(model, req.options, req.keep_alive).await?;
    let estimate = handle.estimate();
    let body = json!({
        "model": req.model,
        "runner_id": handle.id(),
        "layers_on_gpu": estimate.layers_on_gpu,
        "layer_count": estimate.layer_count,
        "total_vram": estimate.total_vram,
        "total_size": estimate.total_size,
    });
    state.scheduler.release_runner(handle);
    Ok(Json(body))
}

async fn generate(
    State(state): State<AppState>,
    Json(req): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, ApiError> {
    validate_request(&req)?;
    let model = state.catalog.resolve(&req.model).await?;
    let handle = state.acquire(model, req.options, req.keep_alive).await?;

    let mut completion = CompletionRequest::new(req.prompt);
    if let Some(n) = req.n_predict {
        completion.n_predict = n.max(-1);
    }
    completion.temperature = req.temperature;
    completion.stop = req.stop;
    completion.seed = req.seed;

    let mut response = String::new();
    let mut last = CompletionChunk::default();
    handle
        .server()
        .completion(completion, &mut |chunk: CompletionChunk| {
            response.push_str(&chunk.content);
            if chunk.done {
                last = chunk;
            }
        })
        .await
        .map_err(ApiError::runner)?;

    Ok(Json(GenerateResponse {
        model: req.model,
        response,
        done: last.done,
        stop_reason: last.stop_reason,
        prompt_eval_count: last.prompt_eval_count,
        eval_count: last.eval_count,
        runner_id: handle.id(),
    }))
}

async fn embed(
    State(state): State<AppState>,
    Json(req): Json<EmbedRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_request(&req)?;
    let model = state.catalog.resolve(&req.model).await?;
    let handle = state.acquire(model, req.options, req.keep_alive).await?;
    let embeddings = handle.server().embed(req.input).await.map_err(ApiError::runner)?;
    Ok(Json(json!({ "model": req.model, "embeddings": embeddings })))
}

async fn get_metrics() -> impl IntoResponse {
    match metrics::gather() {
        Ok(buffer) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            buffer,
        )
            .into_response(),
        Err(e) => ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("failed to encode metrics: {}", e),
            retryable: false,
        }
        .into_response(),
    }
}

pub fn build_router(state: AppState) -> Router {
    use tower_http::{
        cors::{Any, CorsLayer},
        limit::RequestBodyLimitLayer,
        timeout::TimeoutLayer,
        trace::TraceLayer,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/healthz", get(|| async { "OK" }))
        .route("/metrics", get(get_metrics))
        .route("/api/tags", get(list_models))
        .route("/api/ps", get(list_runners))
        .route("/api/load", post(load_model))
        .route("/api/generate", post(generate))
        .route("/api/embed", post(embed))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(600)))
        .layer(RequestBodyLimitLayer::new(8 * 1024 * 1024))
        .with_state(state)
}

/// Run the scheduler behind the HTTP surface until Ctrl-C
pub async fn run_server(cfg: Config) -> anyhow::Result<()> {
    crate::telemetry::init_tracing();
    metrics::init_metrics().context("Failed to register metrics")?;
    cfg.print_config();

    let catalog = Arc::new(ManifestCatalog::load(Path::new(&cfg.models_manifest))?);
    info!("Loaded {} model(s) from {}", catalog.len(), cfg.models_manifest);

    let inventory = Arc::new(SystemInventory::new(cfg.gpu_overhead, cfg.llm_library.as_deref()));
    let factory = Arc::new(LlamaServerFactory::new(cfg.llama_bin.clone(), cfg.llama_host.clone()));
    let scheduler = Scheduler::new(cfg.scheduler_config(), inventory, factory);

    let state = AppState { scheduler: scheduler.clone(), catalog };
    let addr = cfg.api_addr()?;
    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP server stopped, unloading runners");
    scheduler.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::MockInventory;
    use crate::runner::{LaunchSpec, LlamaServerProcess, RunnerFactory, RunnerServer};
    use crate::scheduler::SchedulerConfig;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::net::SocketAddr;

    const MANIFEST: &str = r#"{"models":[
        {"name":"llama3","path":"llama3.gguf","digest":"sha256:abc",
         "metadata":{"layer_count":4,"bytes_per_layer":1048576}}
    ]}"#;

    /// Attaches every runner to one already running server
    struct ConnectFactory {
        url: String,
    }

    #[async_trait]
    impl RunnerFactory for ConnectFactory {
        async fn start(&self, spec: LaunchSpec) -> crate::error::Result<Arc<dyn RunnerServer>> {
            Ok(Arc::new(LlamaServerProcess::connect(
                self.url.clone(),
                spec.options.num_parallel,
                reqwest::Client::new(),
            )))
        }
    }

    async fn spawn_app(runner_url: String) -> SocketAddr {
        let catalog = ManifestCatalog::from_json(MANIFEST, Path::new("/models")).unwrap();
        let scheduler = Scheduler::new(
            SchedulerConfig { load_timeout: Duration::from_secs(5), ..Default::default() },
            Arc::new(MockInventory::with_gpus(&[1 << 30])),
            Arc::new(ConnectFactory { url: runner_url }),
        );
        let state = AppState { scheduler, catalog: Arc::new(catalog) };

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, build_router(state)).await.unwrap();
        });
        addr
    }

    async fn runner_with_health() -> mockito::ServerGuard {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/health")
            .with_status(200)
            .with_body(r#"{"status":"ok"}"#)
            .create_async()
            .await;
        server
    }

    #[tokio::test]
    async fn test_healthz() {
        let addr = spawn_app("http://127.0.0.1:9".into()).await;
        let body = reqwest::get(format!("http://{}/healthz", addr)).await.unwrap().text().await.unwrap();
        assert_eq!(body, "OK");
    }

    #[tokio::test]
    async fn test_generate_returns_completion() {
        let mut runner = runner_with_health().await;
        runner
            .mock("POST", "/completion")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(concat!(
                "data: {\"content\":\"Hi\",\"stop\":false}\n\n",
                "data: {\"content\":\" there\",\"stop\":true,\"stop_type\":\"eos\",",
                "\"tokens_predicted\":2,\"tokens_evaluated\":4}\n\n",
            ))
            .create_async()
            .await;
        let addr = spawn_app(runner.url()).await;

        let resp = reqwest::Client::new()
            .post(format!("http://{}/api/generate", addr))
            .json(&json!({ "model": "llama3", "prompt": "hello" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["response"], "Hi there");
        assert_eq!(body["done"], true);
        assert_eq!(body["eval_count"], 2);

        let ps: Value = reqwest::get(format!("http://{}/api/ps", addr)).await.unwrap().json().await.unwrap();
        assert_eq!(ps["models"][0]["model"], "llama3");
    }

    #[tokio::test]
    async fn test_load_then_ps() {
        let runner = runner_with_health().await;
        let addr = spawn_app(runner.url()).await;

        let resp = reqwest::Client::new()
            .post(format!("http://{}/api/load", addr))
            .json(&json!({ "model": "llama3", "keep_alive": -1 }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["layers_on_gpu"], 4);

        // The release reaches the scheduler asynchronously
        let mut ps = Value::Null;
        for _ in 0..100 {
            ps = reqwest::get(format!("http://{}/api/ps", addr)).await.unwrap().json().await.unwrap();
            if ps["models"][0]["state"] == "expiring" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(ps["models"].as_array().map(Vec::len), Some(1));
        assert_eq!(ps["models"][0]["state"], "expiring");
        assert!(ps["models"][0]["expires_at"].is_null());
    }

    #[tokio::test]
    async fn test_embed() {
        let mut runner = runner_with_health().await;
        runner
            .mock("POST", "/v1/embeddings")
            .with_status(200)
            .with_body(r#"{"data":[{"embedding":[0.5,0.5],"index":0}]}"#)
            .create_async()
            .await;
        let addr = spawn_app(runner.url()).await;

        let body: Value = reqwest::Client::new()
            .post(format!("http://{}/api/embed", addr))
            .json(&json!({ "model": "llama3", "input": ["hello"] }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["embeddings"][0][0], 0.5);
    }

    #[tokio::test]
    async fn test_unknown_model_is_bad_request() {
        let addr = spawn_app("http://127.0.0.1:9".into()).await;
        let resp = reqwest::Client::new()
            .post(format!("http://{}/api/generate", addr))
            .json(&json!({ "model": "mistral", "prompt": "hello" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["code"], 400);
        assert_eq!(body["retryable"], false);
    }

    #[tokio::test]
    async fn test_validation_rejects_empty_model() {
        let addr = spawn_app("http://127.0.0.1:9".into()).await;
        let resp = reqwest::Client::new()
            .post(format!("http://{}/api/embed", addr))
            .json(&json!({ "model": "", "input": [] }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn test_tags_lists_catalog() {
        let addr = spawn_app("http://127.0.0.1:9".into()).await;
        let body: Value = reqwest::get(format!("http://{}/api/tags", addr)).await.unwrap().json().await.unwrap();
        assert_eq!(body["models"].as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        metrics::init_metrics().unwrap();
        let addr = spawn_app("http://127.0.0.1:9".into()).await;
        let resp = reqwest::get(format!("http://{}/metrics", addr)).await.unwrap();
        assert_eq!(resp.status(), 200);
        assert!(resp.text().await.unwrap().contains("runners_loaded"));
    }

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (SchedulerError::InvalidRequest("x".into()), StatusCode::BAD_REQUEST),
            (SchedulerError::QueueFull("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (SchedulerError::ResourceExhausted("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (SchedulerError::LoadTimeout("x".into()), StatusCode::GATEWAY_TIMEOUT),
            (SchedulerError::RunnerCrashed("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status, status);
        }
    }

    #[test]
    fn test_error_retryable_flag() {
        assert!(ApiError::from(SchedulerError::QueueFull("x".into())).retryable);
        assert!(ApiError::from(SchedulerError::ResourceExhausted("x".into())).retryable);
        assert!(!ApiError::from(SchedulerError::InvalidRequest("x".into())).retryable);
        assert!(!ApiError::runner(anyhow::anyhow!("connection refused")).retryable);
    }
}

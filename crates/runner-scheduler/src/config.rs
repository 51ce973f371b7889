use crate::options::KeepAlive;
use crate::scheduler::SchedulerConfig;
use anyhow::{anyhow, Context, Result};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct Config {
    pub llama_bin: PathBuf,
    pub llama_host: String,
    pub models_manifest: String,
    /// Seconds; negative keeps runners loaded forever
    pub keep_alive_seconds: i64,
    pub load_timeout_seconds: u64,
    pub unload_timeout_seconds: u64,
    /// 0 means 3 per GPU (3 in total on CPU-only hosts)
    pub max_loaded_models: usize,
    pub num_parallel: u32,
    pub max_queue: usize,
    /// Bytes reserved on every GPU on top of the library reserve
    pub gpu_overhead: u64,
    pub llm_library: Option<String>,
    pub threads: u32,
    pub api_host: String,
    pub api_port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        load_dotenv();
        Self::from_source(|key| env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment
    pub fn from_source(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let bin = var("LLAMA_BIN", "llama-server");
        let llama_bin = which::which(&bin)
            .map_err(|e| anyhow!("{}", e))
            .with_context(|| format!("Llama binary not found: {}. Set LLAMA_BIN to a llama-server executable", bin))?;
        info!("Using llama binary: {}", llama_bin.display());

        // Auto-detect threads if set to "auto"
        let threads = match var("THREADS", "auto").as_str() {
            "auto" => Self::auto_detect_threads(),
            value => value.parse().context("THREADS must be a number or \"auto\"")?,
        };

        let llm_library = get("LLM_LIBRARY").filter(|s| !s.trim().is_empty());

        Ok(Self {
            llama_bin,
            llama_host: var("LLAMA_HOST", "127.0.0.1"),
            models_manifest: var("MODELS_MANIFEST", "./models.json"),
            keep_alive_seconds: parse(&get, "KEEP_ALIVE", "300")?,
            load_timeout_seconds: parse(&get, "LOAD_TIMEOUT_SECONDS", "300")?,
            unload_timeout_seconds: parse(&get, "UNLOAD_TIMEOUT_SECONDS", "10")?,
            max_loaded_models: parse(&get, "MAX_LOADED_MODELS", "0")?,
            num_parallel: parse(&get, "NUM_PARALLEL", "1")?,
            max_queue: parse(&get, "MAX_QUEUE", "512")?,
            gpu_overhead: parse(&get, "GPU_OVERHEAD", "0")?,
            llm_library,
            threads,
            api_host: var("API_HOST", "127.0.0.1"),
            api_port: parse(&get, "API_PORT", "11435")?,
        })
    }

    fn auto_detect_threads() -> u32 {
        let num_cpus = num_cpus::get() as u32;
        info!("Auto-detected CPU cores: {}", num_cpus);

        match num_cpus {
            1..=2 => 1,
            3..=4 => (num_cpus * 2) / 3,
            5..=8 => (num_cpus * 3) / 5,
            9..=16 => num_cpus / 2,
            17..=32 => (num_cpus * 2) / 5,
            _ => 16,
        }
    }

    pub fn keep_alive(&self) -> KeepAlive {
        KeepAlive::from_secs(self.keep_alive_seconds)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            default_keep_alive: self.keep_alive(),
            load_timeout: Duration::from_secs(self.load_timeout_seconds),
            unload_timeout: Duration::from_secs(self.unload_timeout_seconds),
            max_loaded_models: self.max_loaded_models,
            num_parallel: self.num_parallel,
            num_threads: self.threads,
            max_queue: self.max_queue,
        }
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- Llama Binary: {}", self.llama_bin.display());
        info!("- Runner Host: {}", self.llama_host);
        info!("- Models Manifest: {}", self.models_manifest);
        match self.keep_alive() {
            KeepAlive::Forever => info!("- Keep Alive: forever"),
            KeepAlive::Duration(d) => info!("- Keep Alive: {}s", d.as_secs()),
        }
        info!("- Load Timeout: {}s", self.load_timeout_seconds);
        info!("- Max Loaded Models: {}", self.max_loaded_models);
        info!("- Parallel Slots: {}", self.num_parallel);
        info!("- Queue Size: {}", self.max_queue);
        info!("- GPU Overhead: {} bytes", self.gpu_overhead);
        info!("- Library: {}", self.llm_library.as_deref().unwrap_or("auto"));
        info!("- Threads: {}", self.threads);
        info!("- API: {}:{}", self.api_host, self.api_port);
    }

    pub fn api_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.api_host, self.api_port)
            .parse()
            .with_context(|| format!("Invalid API address {}:{}", self.api_host, self.api_port))
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = get(key).unwrap_or_else(|| default.to_string());
    raw.trim()
        .parse()
        .with_context(|| format!("Invalid value for {}: {:?}", key, raw))
}

#[cfg(feature = "cli")]
fn load_dotenv() {
    if let Err(e) = dotenvy::dotenv() {
        warn!("Failed to load .env file: {}. Using system environment variables.", e);
    } else {
        info!("Loaded environment variables from .env file");
    }
}

#[cfg(not(feature = "cli"))]
fn load_dotenv() {
    warn!("Built without dotenv support; reading system environment variables only");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Helper function to create a test Config with default values
    fn create_test_config() -> Config {
        Config {
            llama_bin: PathBuf::from("/test/llama-server"),
            llama_host: "127.0.0.1".to_string(),
            models_manifest: "/test/models.json".to_string(),
            keep_alive_seconds: 300,
            load_timeout_seconds: 300,
            unload_timeout_seconds: 10,
            max_loaded_models: 0,
            num_parallel: 1,
            max_queue: 512,
            gpu_overhead: 0,
            llm_library: None,
            threads: 6,
            api_host: "127.0.0.1".to_string(),
            api_port: 11435,
        }
    }

    fn from_map(pairs: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_source(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_api_addr_parsing() {
        let config = create_test_config();
        let addr = config.api_addr().unwrap();

        assert_eq!(addr.ip().to_string(), "127.0.0.1");
        assert_eq!(addr.port(), 11435);
    }

    #[test]
    fn test_api_addr_invalid_host() {
        let mut config = create_test_config();
        config.api_host = "not a host".to_string();
        tokio_test::assert_err!(config.api_addr());
    }

    #[test]
    fn test_scheduler_config_projection() {
        let mut config = create_test_config();
        config.max_loaded_models = 2;
        config.load_timeout_seconds = 30;

        let sched = config.scheduler_config();
        assert_eq!(sched.default_keep_alive, KeepAlive::Duration(Duration::from_secs(300)));
        assert_eq!(sched.load_timeout, Duration::from_secs(30));
        assert_eq!(sched.unload_timeout, Duration::from_secs(10));
        assert_eq!(sched.max_loaded_models, 2);
        assert_eq!(sched.num_threads, 6);
        assert_eq!(sched.max_queue, 512);
    }

    #[test]
    fn test_negative_keep_alive_is_forever() {
        let mut config = create_test_config();
        config.keep_alive_seconds = -1;
        assert_eq!(config.scheduler_config().default_keep_alive, KeepAlive::Forever);
    }

    #[test]
    fn test_from_source_defaults() {
        let config = tokio_test::assert_ok!(from_map(&[("LLAMA_BIN", "sh"), ("THREADS", "4")]));
        assert!(config.llama_bin.is_absolute());
        assert_eq!(config.threads, 4);
        assert_eq!(config.keep_alive_seconds, 300);
        assert_eq!(config.max_queue, 512);
        assert_eq!(config.num_parallel, 1);
        assert!(config.llm_library.is_none());
    }

    #[test]
    fn test_from_source_overrides() {
        let config = from_map(&[
            ("LLAMA_BIN", "sh"),
            ("KEEP_ALIVE", "-1"),
            ("MAX_LOADED_MODELS", "2"),
            ("GPU_OVERHEAD", "1073741824"),
            ("LLM_LIBRARY", "cpu"),
            ("API_PORT", "9000"),
        ])
        .unwrap();
        assert_eq!(config.keep_alive(), KeepAlive::Forever);
        assert_eq!(config.max_loaded_models, 2);
        assert_eq!(config.gpu_overhead, 1 << 30);
        assert_eq!(config.llm_library.as_deref(), Some("cpu"));
        assert_eq!(config.api_port, 9000);
    }

    #[test]
    fn test_from_source_missing_binary() {
        let err = tokio_test::assert_err!(from_map(&[("LLAMA_BIN", "/definitely/not/llama-server")]));
        assert!(err.to_string().contains("Llama binary not found"));
    }

    #[test]
    fn test_from_source_rejects_bad_number() {
        let err = from_map(&[("LLAMA_BIN", "sh"), ("MAX_QUEUE", "lots")]).unwrap_err();
        assert!(err.to_string().contains("MAX_QUEUE"));
    }

    #[test]
    fn test_auto_threads() {
        let config = from_map(&[("LLAMA_BIN", "sh")]).unwrap();
        assert!(config.threads > 0);
        assert!(Config::auto_detect_threads() <= 16);
    }
}

#[cfg(feature = "cli")]
use clap::Parser;
#[cfg(feature = "cli")]
use runner_scheduler::{config::Config, run_server};

/// Schedule llama-server runners and serve them over HTTP
#[cfg(feature = "cli")]
#[derive(Debug, Parser)]
#[command(name = "runner-scheduler", version, about)]
struct Cli {
    /// Model manifest (overrides MODELS_MANIFEST)
    #[arg(long)]
    models: Option<String>,

    /// Listen port (overrides API_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Force a GPU library, e.g. `cpu` (overrides LLM_LIBRARY)
    #[arg(long)]
    library: Option<String>,

    /// Print the resolved configuration and exit
    #[arg(long)]
    check: bool,
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut cfg = Config::from_env()?;
    if let Some(models) = cli.models {
        cfg.models_manifest = models;
    }
    if let Some(port) = cli.port {
        cfg.api_port = port;
    }
    if let Some(library) = cli.library {
        cfg.llm_library = Some(library);
    }

    if cli.check {
        runner_scheduler::telemetry::init_tracing();
        cfg.print_config();
        return Ok(());
    }
    run_server(cfg).await
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}

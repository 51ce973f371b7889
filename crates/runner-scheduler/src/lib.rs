//! Runner scheduler for local LLM inference
//!
//! Loads llama-server runners on demand and shares GPU and host memory between them.

pub mod config;
pub mod error;
pub mod estimate;
pub mod gpu;
pub mod metrics;
pub mod model;
pub mod options;
pub mod runner;
pub mod scheduler;
#[cfg(feature = "cli")]
pub mod server;
pub mod telemetry;

pub use config::Config;
pub use error::{Result, SchedulerError};
pub use estimate::{estimate_gpu_layers, MemoryEstimate};
pub use gpu::{CpuMemory, DeviceInfo, InventoryProvider, Library, MockInventory, SystemInventory};
pub use model::{ManifestCatalog, Model, ModelCatalog, ModelMetadata, ModelName, StaticMetadata};
pub use options::{KeepAlive, RunnerOptions};
pub use runner::{LlamaServerFactory, RunnerFactory, RunnerServer};
pub use scheduler::{PendingRunner, RunnerHandle, RunnerState, RunnerStatus, Scheduler, SchedulerConfig};
#[cfg(feature = "cli")]
pub use server::run_server;

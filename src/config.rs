//! Runtime configuration for offload-gateway.
//!
//! Configuration is loaded from a JSON file or constructed programmatically.
//! Every section has defaults, so a partial file only overrides what it names.

use std::path::{Path, PathBuf};

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::device::{DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "offload-gateway", about = "HTTP gateway for GPU vector offload")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address (overrides the config file).
    #[arg(long)]
    pub listen: Option<String>,

    /// Accelerator backend.
    #[arg(long, value_enum, default_value_t = BackendKind::default())]
    pub backend: BackendKind,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Which driver executes kernels.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Emulated device on the host CPU.
    Host,
    /// NVIDIA driver (requires the `cuda` feature).
    Cuda,
}

impl Default for BackendKind {
    fn default() -> Self {
        if cfg!(feature = "cuda") {
            BackendKind::Cuda
        } else {
            BackendKind::Host
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,

    /// Device selection and session policy.
    pub device: DeviceConfig,

    /// Kernel artifact.
    pub kernel: KernelConfig,

    /// Request limits.
    pub limits: LimitsConfig,

    /// Timing and verification signals.
    pub telemetry: TelemetryConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:8080").
    pub listen: String,

    /// Maximum offloads running on the device at once.
    pub max_concurrent_requests: usize,

    /// How long a request may wait for its device round-trip, in seconds.
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            max_concurrent_requests: 4,
            request_timeout_secs: 30,
        }
    }
}

/// Device settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device ordinal.
    pub index: usize,

    /// Keep released sessions for reuse instead of destroying them.
    pub pool_sessions: bool,

    /// Memory of the emulated host device in bytes.
    pub host_memory_bytes: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            index: 0,
            pool_sessions: false,
            host_memory_bytes: crate::device::host::DEFAULT_HOST_CAPACITY,
        }
    }
}

/// Kernel artifact settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Path to the compiled PTX module.
    pub module_path: PathBuf,

    /// Entry point with the `(int n, float *x, float *y)` signature.
    pub entry_point: String,

    /// Threads per block.
    pub block_size: u32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            // Set by build.rs when the module was compiled with nvcc.
            module_path: PathBuf::from(
                option_env!("OFFLOAD_KERNEL_PTX").unwrap_or("kernels/vector_add.ptx"),
            ),
            entry_point: "add".to_string(),
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

/// Request limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Largest accepted vector length.
    pub max_elements: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_elements: 16 * 1024 * 1024,
        }
    }
}

/// Telemetry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Recompute the sum on the host after each offload to time it and
    /// count mismatching elements.
    pub host_verification: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            host_verification: true,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Reject settings the gateway cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            (1..=MAX_BLOCK_SIZE).contains(&self.kernel.block_size),
            "kernel.block_size must be in 1..={MAX_BLOCK_SIZE}, got {}",
            self.kernel.block_size
        );
        anyhow::ensure!(
            !self.kernel.entry_point.is_empty(),
            "kernel.entry_point must not be empty"
        );
        anyhow::ensure!(
            self.server.max_concurrent_requests > 0,
            "server.max_concurrent_requests must be at least 1"
        );
        anyhow::ensure!(
            self.server.request_timeout_secs > 0,
            "server.request_timeout_secs must be at least 1"
        );
        anyhow::ensure!(
            self.limits.max_elements > 0,
            "limits.max_elements must be at least 1"
        );
        Ok(())
    }
}

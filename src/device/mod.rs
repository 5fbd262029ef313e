//! Accelerator device access.
//!
//! - [`session`]: scoped device sessions (context + module + kernel)
//! - [`buffer`]: device-resident buffers freed exactly once
//! - [`host`]: emulated device that runs kernels on the CPU
//! - `cuda`: NVIDIA driver backend (requires the `cuda` feature)
//!
//! Everything above this module talks to the accelerator through
//! [`ComputeBackend`], so the session and invocation layers never see a raw
//! driver handle.

pub mod buffer;
#[cfg(feature = "cuda")]
pub mod cuda;
pub mod host;
pub mod session;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::KernelConfig;
use crate::error::OffloadError;

/// Threads per block used for 1-D launches.
pub const DEFAULT_BLOCK_SIZE: u32 = 1024;

/// Upper bound on threads per block accepted by the driver.
pub const MAX_BLOCK_SIZE: u32 = 1024;

/// Which kernel module to load and which entry point to resolve in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSpec {
    /// Path to the compiled module (PTX).
    pub module_path: PathBuf,

    /// Name of the `(n, x, y)` entry point.
    pub entry_point: String,

    /// Threads per block.
    pub block_size: u32,
}

impl From<&KernelConfig> for KernelSpec {
    fn from(cfg: &KernelConfig) -> Self {
        Self {
            module_path: cfg.module_path.clone(),
            entry_point: cfg.entry_point.clone(),
            block_size: cfg.block_size,
        }
    }
}

/// 1-D launch geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchGeometry {
    /// Number of blocks.
    pub grid: u32,

    /// Threads per block.
    pub block: u32,
}

impl LaunchGeometry {
    /// Geometry covering `n` elements: `(n + block - 1) / block` blocks.
    pub fn for_len(n: usize, block: u32) -> Self {
        let block = block.max(1);
        let grid = n.div_ceil(block as usize);
        Self {
            grid: grid as u32,
            block,
        }
    }

    /// Total threads launched; always `>= n` for the length it was built for.
    pub fn total_threads(&self) -> usize {
        self.grid as usize * self.block as usize
    }

    pub fn grid_dim(&self) -> (u32, u32, u32) {
        (self.grid, 1, 1)
    }

    pub fn block_dim(&self) -> (u32, u32, u32) {
        (self.block, 1, 1)
    }
}

/// Driver seam between the offload layers and a concrete accelerator.
///
/// A `Context` bundles everything a session owns on the device (execution
/// context, loaded module, resolved kernel). Buffers are only valid with the
/// context that allocated them.
///
/// Implementations must make `init` idempotent; the session manager calls it
/// before every context creation.
pub trait ComputeBackend: Send + Sync + 'static {
    type Context: Send;
    type Buffer: Send;

    /// Short name for logs and metrics.
    fn name(&self) -> &'static str;

    /// One-time driver initialization.
    fn init(&self) -> Result<(), OffloadError>;

    /// Create an execution context on `device`, load `kernel.module_path` and
    /// resolve `kernel.entry_point`.
    fn create_context(
        &self,
        device: usize,
        kernel: &KernelSpec,
    ) -> Result<Self::Context, OffloadError>;

    /// Destroy a context. Called exactly once per created context.
    fn destroy_context(&self, context: Self::Context);

    /// Allocate room for `len` `f32` elements.
    fn alloc(&self, context: &Self::Context, len: usize) -> Result<Self::Buffer, OffloadError>;

    /// Free a buffer. Called exactly once per allocated buffer.
    fn free(&self, context: &Self::Context, buffer: Self::Buffer);

    /// Host → device copy.
    fn copy_to_device(
        &self,
        context: &Self::Context,
        src: &[f32],
        dst: &mut Self::Buffer,
    ) -> Result<(), OffloadError>;

    /// Device → host copy.
    fn copy_to_host(
        &self,
        context: &Self::Context,
        src: &Self::Buffer,
        dst: &mut [f32],
    ) -> Result<(), OffloadError>;

    /// Launch the resolved entry point with `(n, x, y)`. The kernel writes
    /// its result into `y`.
    fn launch(
        &self,
        context: &Self::Context,
        geometry: LaunchGeometry,
        n: i32,
        x: &Self::Buffer,
        y: &mut Self::Buffer,
    ) -> Result<(), OffloadError>;

    /// Block until all work issued on `context` has finished.
    fn synchronize(&self, context: &Self::Context) -> Result<(), OffloadError>;
}

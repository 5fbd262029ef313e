//! Emulated accelerator that runs kernels on the host CPU.
//!
//! Used when the crate is built without the `cuda` feature and by the test
//! suite. It keeps the device semantics that matter to the layers above:
//! a bounded memory pool, contexts that must be created and destroyed, a
//! kernel registry resolved by entry-point name, and launches that execute
//! every thread of the requested grid so geometry bugs show up as wrong
//! results instead of being papered over.

use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use tracing::{debug, info};

use super::{ComputeBackend, KernelSpec, LaunchGeometry, MAX_BLOCK_SIZE};
use crate::error::OffloadError;

/// A kernel body executed once per thread.
///
/// Arguments: global thread index, element count, `x`, `y`.
pub type HostKernel = fn(usize, usize, &[f32], &mut [f32]);

/// `y[i] = x[i] + y[i]` for `i < n`.
fn add_kernel(idx: usize, n: usize, x: &[f32], y: &mut [f32]) {
    if idx < n {
        y[idx] += x[idx];
    }
}

/// Default emulated device memory: 1 GiB.
pub const DEFAULT_HOST_CAPACITY: usize = 1024 * 1024 * 1024;

/// Emulated context: the resolved kernel on a given device index.
pub struct HostContext {
    device: usize,
    entry_point: String,
    kernel: HostKernel,
}

impl std::fmt::Debug for HostContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostContext")
            .field("device", &self.device)
            .field("entry_point", &self.entry_point)
            .finish_non_exhaustive()
    }
}

impl HostContext {
    pub fn device(&self) -> usize {
        self.device
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }
}

/// Emulated device allocation.
#[derive(Debug)]
pub struct HostBuffer {
    data: Vec<f32>,
}

pub struct HostBackend {
    /// Set once the emulated driver has been brought up.
    initialized: OnceLock<()>,

    /// Number of emulated devices; indices `>=` this fail to initialize.
    device_count: usize,

    /// Emulated device memory.
    capacity_bytes: usize,

    /// Bytes currently allocated.
    used_bytes: AtomicUsize,

    /// Entry points available in the emulated module.
    kernels: HashMap<&'static str, HostKernel>,
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_HOST_CAPACITY)
    }
}

impl HostBackend {
    /// Single emulated device with `capacity_bytes` of memory.
    pub fn with_capacity(capacity_bytes: usize) -> Self {
        let mut kernels: HashMap<&'static str, HostKernel> = HashMap::new();
        kernels.insert("add", add_kernel);

        Self {
            initialized: OnceLock::new(),
            device_count: 1,
            capacity_bytes,
            used_bytes: AtomicUsize::new(0),
            kernels,
        }
    }

    /// Register an additional entry point.
    pub fn with_kernel(mut self, name: &'static str, kernel: HostKernel) -> Self {
        self.kernels.insert(name, kernel);
        self
    }

    /// Bytes currently allocated on the emulated device.
    pub fn bytes_in_use(&self) -> usize {
        self.used_bytes.load(Ordering::Acquire)
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.get().is_some()
    }
}

impl ComputeBackend for HostBackend {
    type Context = HostContext;
    type Buffer = HostBuffer;

    fn name(&self) -> &'static str {
        "host"
    }

    fn init(&self) -> Result<(), OffloadError> {
        self.initialized.get_or_init(|| {
            info!(
                devices = self.device_count,
                capacity_bytes = self.capacity_bytes,
                "Emulated accelerator initialized"
            );
        });
        Ok(())
    }

    fn create_context(
        &self,
        device: usize,
        kernel: &KernelSpec,
    ) -> Result<HostContext, OffloadError> {
        if !self.is_initialized() {
            return Err(OffloadError::DeviceInit {
                device,
                reason: "driver not initialized".to_string(),
            });
        }
        if device >= self.device_count {
            return Err(OffloadError::DeviceInit {
                device,
                reason: format!("only {} emulated device(s) available", self.device_count),
            });
        }

        let entry = self
            .kernels
            .get(kernel.entry_point.as_str())
            .copied()
            .ok_or_else(|| OffloadError::SymbolNotFound(kernel.entry_point.clone()))?;

        debug!(
            device,
            entry_point = %kernel.entry_point,
            "Created emulated context"
        );

        Ok(HostContext {
            device,
            entry_point: kernel.entry_point.clone(),
            kernel: entry,
        })
    }

    fn destroy_context(&self, context: HostContext) {
        debug!(device = context.device, "Destroyed emulated context");
    }

    fn alloc(&self, _context: &HostContext, len: usize) -> Result<HostBuffer, OffloadError> {
        let bytes = len * mem::size_of::<f32>();
        self.used_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes)
                    .filter(|&total| total <= self.capacity_bytes)
            })
            .map_err(|_| OffloadError::DeviceOom { bytes })?;

        Ok(HostBuffer {
            data: vec![0.0; len],
        })
    }

    fn free(&self, _context: &HostContext, buffer: HostBuffer) {
        let bytes = buffer.data.len() * mem::size_of::<f32>();
        self.used_bytes.fetch_sub(bytes, Ordering::AcqRel);
    }

    fn copy_to_device(
        &self,
        _context: &HostContext,
        src: &[f32],
        dst: &mut HostBuffer,
    ) -> Result<(), OffloadError> {
        let dst = dst
            .data
            .get_mut(..src.len())
            .ok_or_else(|| OffloadError::Transfer {
                direction: "host_to_device",
                reason: format!("source of {} elements overruns buffer", src.len()),
            })?;
        dst.copy_from_slice(src);
        Ok(())
    }

    fn copy_to_host(
        &self,
        _context: &HostContext,
        src: &HostBuffer,
        dst: &mut [f32],
    ) -> Result<(), OffloadError> {
        let src = src
            .data
            .get(..dst.len())
            .ok_or_else(|| OffloadError::Transfer {
                direction: "device_to_host",
                reason: format!("destination of {} elements overruns buffer", dst.len()),
            })?;
        dst.copy_from_slice(src);
        Ok(())
    }

    fn launch(
        &self,
        context: &HostContext,
        geometry: LaunchGeometry,
        n: i32,
        x: &HostBuffer,
        y: &mut HostBuffer,
    ) -> Result<(), OffloadError> {
        if geometry.block == 0 || geometry.block > MAX_BLOCK_SIZE || geometry.grid == 0 {
            return Err(OffloadError::KernelLaunch(format!(
                "invalid launch geometry {}x{}",
                geometry.grid, geometry.block
            )));
        }
        let n = usize::try_from(n)
            .map_err(|_| OffloadError::KernelLaunch(format!("negative element count {n}")))?;
        if x.data.len() < n || y.data.len() < n {
            return Err(OffloadError::KernelExecution(format!(
                "out-of-bounds access: n = {n}, x = {}, y = {}",
                x.data.len(),
                y.data.len()
            )));
        }

        for block in 0..geometry.grid as usize {
            for thread in 0..geometry.block as usize {
                let idx = block * geometry.block as usize + thread;
                (context.kernel)(idx, n, &x.data, &mut y.data);
            }
        }
        Ok(())
    }

    fn synchronize(&self, _context: &HostContext) -> Result<(), OffloadError> {
        // Launches run to completion on the calling thread.
        Ok(())
    }
}

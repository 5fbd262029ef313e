//! NVIDIA driver backend built on `cudarc`.
//!
//! Each context owns a retained primary context on its device, its default
//! stream, the loaded PTX module and the resolved entry point. Device memory
//! is `CudaSlice<f32>`, which the driver frees when the slice is dropped, so
//! [`ComputeBackend::free`] just drops it.

use std::sync::{Arc, OnceLock};

use cudarc::driver::{
    CudaContext, CudaFunction, CudaModule, CudaSlice, CudaStream, DriverError, LaunchConfig,
    PushKernelArg,
};
use cudarc::nvrtc::Ptx;
use tracing::{debug, info};

use super::{ComputeBackend, KernelSpec, LaunchGeometry};
use crate::error::OffloadError;

/// Process-wide driver initialization result.
static DRIVER_INIT: OnceLock<Result<(), String>> = OnceLock::new();

/// A session's device-side state.
pub struct CudaSessionContext {
    device: usize,
    // Field order matters: the function and module must go before the context.
    function: CudaFunction,
    _module: Arc<CudaModule>,
    stream: Arc<CudaStream>,
    _ctx: Arc<CudaContext>,
}

#[derive(Debug, Default)]
pub struct CudaBackend;

impl CudaBackend {
    pub fn new() -> Self {
        Self
    }

    /// Number of CUDA devices visible to the driver.
    pub fn device_count() -> Result<usize, OffloadError> {
        CudaBackend.init()?;
        CudaContext::device_count()
            .map(|n| n as usize)
            .map_err(|e| OffloadError::DeviceInit {
                device: 0,
                reason: e.to_string(),
            })
    }
}

fn driver_reason(e: DriverError) -> String {
    e.to_string()
}

impl ComputeBackend for CudaBackend {
    type Context = CudaSessionContext;
    type Buffer = CudaSlice<f32>;

    fn name(&self) -> &'static str {
        "cuda"
    }

    fn init(&self) -> Result<(), OffloadError> {
        let result = DRIVER_INIT.get_or_init(|| {
            // The dynamic loader panics when libcuda is missing.
            match std::panic::catch_unwind(cudarc::driver::result::init) {
                Ok(Ok(())) => {
                    info!("CUDA driver initialized");
                    Ok(())
                }
                Ok(Err(e)) => Err(driver_reason(e)),
                Err(_) => Err("CUDA driver library not available".to_string()),
            }
        });
        result.clone().map_err(|reason| OffloadError::DeviceInit { device: 0, reason })
    }

    fn create_context(
        &self,
        device: usize,
        kernel: &KernelSpec,
    ) -> Result<CudaSessionContext, OffloadError> {
        let ctx = CudaContext::new(device).map_err(|e| OffloadError::DeviceInit {
            device,
            reason: driver_reason(e),
        })?;
        let stream = ctx.default_stream();

        let path = kernel.module_path.display().to_string();
        if !kernel.module_path.is_file() {
            return Err(OffloadError::ModuleLoad {
                path,
                reason: "file not found".to_string(),
            });
        }
        let module = ctx
            .load_module(Ptx::from_file(&kernel.module_path))
            .map_err(|e| OffloadError::ModuleLoad {
                path: path.clone(),
                reason: driver_reason(e),
            })?;
        let function = module
            .load_function(&kernel.entry_point)
            .map_err(|_| OffloadError::SymbolNotFound(kernel.entry_point.clone()))?;

        debug!(device, module = %path, entry_point = %kernel.entry_point, "Loaded CUDA module");

        Ok(CudaSessionContext {
            device,
            function,
            _module: module,
            stream,
            _ctx: ctx,
        })
    }

    fn destroy_context(&self, context: CudaSessionContext) {
        let device = context.device;
        drop(context);
        debug!(device, "Released CUDA context");
    }

    fn alloc(
        &self,
        context: &CudaSessionContext,
        len: usize,
    ) -> Result<CudaSlice<f32>, OffloadError> {
        context
            .stream
            .alloc_zeros::<f32>(len)
            .map_err(|_| OffloadError::DeviceOom {
                bytes: len * std::mem::size_of::<f32>(),
            })
    }

    fn free(&self, _context: &CudaSessionContext, buffer: CudaSlice<f32>) {
        drop(buffer);
    }

    fn copy_to_device(
        &self,
        context: &CudaSessionContext,
        src: &[f32],
        dst: &mut CudaSlice<f32>,
    ) -> Result<(), OffloadError> {
        context
            .stream
            .memcpy_htod(src, dst)
            .map_err(|e| OffloadError::Transfer {
                direction: "host_to_device",
                reason: driver_reason(e),
            })
    }

    fn copy_to_host(
        &self,
        context: &CudaSessionContext,
        src: &CudaSlice<f32>,
        dst: &mut [f32],
    ) -> Result<(), OffloadError> {
        let map = |e| OffloadError::Transfer {
            direction: "device_to_host",
            reason: driver_reason(e),
        };
        context.stream.memcpy_dtoh(src, dst).map_err(map)?;
        context.stream.synchronize().map_err(map)
    }

    fn launch(
        &self,
        context: &CudaSessionContext,
        geometry: LaunchGeometry,
        n: i32,
        x: &CudaSlice<f32>,
        y: &mut CudaSlice<f32>,
    ) -> Result<(), OffloadError> {
        let cfg = LaunchConfig {
            grid_dim: geometry.grid_dim(),
            block_dim: geometry.block_dim(),
            shared_mem_bytes: 0,
        };

        let mut builder = context.stream.launch_builder(&context.function);
        builder.arg(&n);
        builder.arg(x);
        builder.arg(y);

        // SAFETY: the entry point takes `(int, float*, float*)`, both slices
        // hold at least `n` elements and were allocated on this context, and
        // the kernel bounds-checks its global index against `n`.
        unsafe { builder.launch(cfg) }
            .map(|_| ())
            .map_err(|e| OffloadError::KernelLaunch(driver_reason(e)))
    }

    fn synchronize(&self, context: &CudaSessionContext) -> Result<(), OffloadError> {
        context
            .stream
            .synchronize()
            .map_err(|e| OffloadError::KernelExecution(driver_reason(e)))
    }
}

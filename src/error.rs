//! Error taxonomy for the offload path.
//!
//! Every failure a request can hit maps to exactly one [`OffloadError`]
//! variant. Client-caused variants never touch the device; everything else
//! is reported only after the session and its buffers have been released.

use axum::http::StatusCode;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OffloadError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Shape mismatch: left has {left} elements, right has {right}")]
    ShapeMismatch { left: usize, right: usize },

    #[error("Device {device} failed to initialize: {reason}")]
    DeviceInit { device: usize, reason: String },

    #[error("Failed to load kernel module '{path}': {reason}")]
    ModuleLoad { path: String, reason: String },

    #[error("Kernel entry point '{0}' not found in module")]
    SymbolNotFound(String),

    #[error("Out of device memory allocating {bytes} bytes")]
    DeviceOom { bytes: usize },

    #[error("Transfer failed ({direction}): {reason}")]
    Transfer {
        direction: &'static str,
        reason: String,
    },

    #[error("Kernel launch failed: {0}")]
    KernelLaunch(String),

    #[error("Kernel execution failed: {0}")]
    KernelExecution(String),

    #[error("Sum is not representable as f32 at element {index}")]
    ResultOverflow { index: usize },

    #[error("Offload did not complete within {0} seconds")]
    Timeout(u64),

    #[error("Offload worker failed: {0}")]
    WorkerFailed(String),
}

impl OffloadError {
    /// Stable machine-readable name, used in error payloads and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::ShapeMismatch { .. } => "shape_mismatch",
            Self::DeviceInit { .. } => "device_init",
            Self::ModuleLoad { .. } => "module_load",
            Self::SymbolNotFound(_) => "symbol_not_found",
            Self::DeviceOom { .. } => "device_oom",
            Self::Transfer { .. } => "transfer",
            Self::KernelLaunch(_) => "kernel_launch",
            Self::KernelExecution(_) => "kernel_execution",
            Self::ResultOverflow { .. } => "result_overflow",
            Self::Timeout(_) => "timeout",
            Self::WorkerFailed(_) => "worker_failed",
        }
    }

    /// Whether the caller sent something the gateway cannot process.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidRequest(_) | Self::ShapeMismatch { .. })
    }

    /// Whether the failure comes from the deployment (driver, artifact) rather
    /// than from a single request.
    pub fn is_environment_error(&self) -> bool {
        matches!(
            self,
            Self::DeviceInit { .. } | Self::ModuleLoad { .. } | Self::SymbolNotFound(_)
        )
    }

    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        if self.is_client_error() {
            StatusCode::BAD_REQUEST
        } else if self.is_environment_error() {
            StatusCode::SERVICE_UNAVAILABLE
        } else if matches!(self, Self::Timeout(_)) {
            StatusCode::GATEWAY_TIMEOUT
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

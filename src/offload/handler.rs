//! Request handling: validate, then acquire → run → release.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::invocation;
use crate::config::{Config, LimitsConfig, TelemetryConfig};
use crate::device::session::{SessionManager, SessionStats};
use crate::device::{ComputeBackend, KernelSpec};
use crate::error::OffloadError;
use crate::metrics::OffloadMetrics;

/// Two equal-length vectors to add.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OffloadRequest {
    #[serde(alias = "hostX")]
    pub left: Vec<f32>,

    #[serde(alias = "hostY")]
    pub right: Vec<f32>,
}

impl OffloadRequest {
    pub fn new(left: Vec<f32>, right: Vec<f32>) -> Self {
        Self { left, right }
    }
}

/// Element-wise sum, serialized as a bare array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OffloadResult {
    pub sum: Vec<f32>,
}

/// The offload gateway: owns the session manager for its device.
pub struct Gateway<B: ComputeBackend> {
    sessions: SessionManager<B>,
    limits: LimitsConfig,
    telemetry: TelemetryConfig,
    metrics: Arc<OffloadMetrics>,
}

impl<B: ComputeBackend> Gateway<B> {
    pub fn new(backend: Arc<B>, config: &Config, metrics: Arc<OffloadMetrics>) -> Self {
        let kernel = KernelSpec::from(&config.kernel);
        let sessions = if config.device.pool_sessions {
            SessionManager::pooled(backend, config.device.index, kernel)
        } else {
            SessionManager::new(backend, config.device.index, kernel)
        };

        info!(
            backend = sessions.backend().name(),
            device = config.device.index,
            pooled = config.device.pool_sessions,
            module = %config.kernel.module_path.display(),
            entry_point = %config.kernel.entry_point,
            "Gateway ready"
        );

        Self {
            sessions,
            limits: config.limits.clone(),
            telemetry: config.telemetry.clone(),
            metrics,
        }
    }

    /// Check the request shape without touching the device.
    pub fn validate(&self, request: &OffloadRequest) -> Result<(), OffloadError> {
        let (l, r) = (request.left.len(), request.right.len());
        if l == 0 && r == 0 {
            return Err(OffloadError::InvalidRequest(
                "vectors must not be empty".to_string(),
            ));
        }
        if l != r {
            return Err(OffloadError::InvalidRequest(format!(
                "vectors differ in length: left has {l} elements, right has {r}"
            )));
        }
        if l > self.limits.max_elements {
            return Err(OffloadError::InvalidRequest(format!(
                "{l} elements exceed the limit of {}",
                self.limits.max_elements
            )));
        }
        if i32::try_from(l).is_err() {
            return Err(OffloadError::InvalidRequest(format!(
                "{l} elements exceed the kernel's i32 count"
            )));
        }
        for (side, values) in [("left", &request.left), ("right", &request.right)] {
            if let Some(index) = values.iter().position(|v| !v.is_finite()) {
                return Err(OffloadError::InvalidRequest(format!(
                    "{side}[{index}] is not a finite f32"
                )));
            }
        }
        Ok(())
    }

    /// Add the two vectors on the device.
    ///
    /// The session is released before this returns, whether the kernel
    /// succeeded or not. No partial result is ever returned.
    pub fn handle(&self, request: &OffloadRequest) -> Result<OffloadResult, OffloadError> {
        self.validate(request)?;

        let session = self.sessions.acquire()?;
        self.metrics.observe_sessions(&self.sessions.stats());
        let output = invocation::run(&session, &request.left, &request.right);
        session.release();
        self.metrics.observe_sessions(&self.sessions.stats());
        let output = output?;

        // JSON has no encoding for inf or NaN.
        if let Some(index) = output.sum.iter().position(|v| !v.is_finite()) {
            return Err(OffloadError::ResultOverflow { index });
        }

        let n = output.sum.len();
        self.metrics
            .elements
            .with_label_values(&[self.sessions.backend().name()])
            .inc_by(n as u64);
        self.metrics
            .kernel_seconds
            .observe(output.kernel_time.as_secs_f64());

        if self.telemetry.host_verification {
            let start = Instant::now();
            let reference: Vec<f32> = request
                .left
                .iter()
                .zip(&request.right)
                .map(|(l, r)| l + r)
                .collect();
            let host_time = start.elapsed();
            self.metrics
                .host_reference_seconds
                .observe(host_time.as_secs_f64());

            let mismatched = reference
                .iter()
                .zip(&output.sum)
                .filter(|(h, d)| h != d)
                .count();
            if mismatched > 0 {
                warn!(n, mismatched, "Device result differs from host reference");
            }

            info!(
                n,
                grid = output.geometry.grid,
                block = output.geometry.block,
                kernel_ns = output.kernel_time.as_nanos() as u64,
                host_ns = host_time.as_nanos() as u64,
                "Vector add complete"
            );
        } else {
            info!(
                n,
                grid = output.geometry.grid,
                block = output.geometry.block,
                kernel_ns = output.kernel_time.as_nanos() as u64,
                "Vector add complete"
            );
        }

        Ok(OffloadResult { sum: output.sum })
    }

    pub fn session_stats(&self) -> SessionStats {
        self.sessions.stats()
    }

    pub fn sessions(&self) -> &SessionManager<B> {
        &self.sessions
    }

    pub fn metrics(&self) -> &Arc<OffloadMetrics> {
        &self.metrics
    }

    /// Destroy pooled sessions.
    pub fn shutdown(&self) {
        self.sessions.shutdown();
        self.metrics.observe_sessions(&self.sessions.stats());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::host::HostBackend;

    fn gateway(config: &Config) -> Gateway<HostBackend> {
        let metrics = Arc::new(OffloadMetrics::new().unwrap());
        Gateway::new(Arc::new(HostBackend::default()), config, metrics)
    }

    #[test]
    fn test_handle_scenario() {
        let gw = gateway(&Config::default());
        let req = OffloadRequest::new(vec![1.0, 2.0, 3.0], vec![10.0, 20.0, 30.0]);
        let res = gw.handle(&req).unwrap();
        assert_eq!(res.sum, vec![11.0, 22.0, 33.0]);

        let stats = gw.session_stats();
        assert_eq!(stats.acquired, 1);
        assert_eq!(stats.released, 1);
    }

    #[test]
    fn test_empty_is_invalid() {
        let gw = gateway(&Config::default());
        let err = gw.handle(&OffloadRequest::new(vec![], vec![])).unwrap_err();
        assert!(matches!(err, OffloadError::InvalidRequest(_)));
        assert_eq!(gw.session_stats().acquired, 0);
    }

    #[test]
    fn test_limit_enforced() {
        let mut cfg = Config::default();
        cfg.limits.max_elements = 2;
        let gw = gateway(&cfg);

        let err = gw
            .handle(&OffloadRequest::new(vec![1.0; 3], vec![1.0; 3]))
            .unwrap_err();
        assert!(matches!(err, OffloadError::InvalidRequest(_)));
        assert_eq!(gw.session_stats().acquired, 0);
    }

    #[test]
    fn test_non_finite_input_is_invalid() {
        let gw = gateway(&Config::default());

        // 1e39 is out of f32 range and parses to inf.
        let req: OffloadRequest =
            serde_json::from_str(r#"{"left": [1e39], "right": [1.0]}"#).unwrap();
        let err = gw.handle(&req).unwrap_err();
        assert!(matches!(err, OffloadError::InvalidRequest(ref m) if m.contains("left[0]")));

        let err = gw
            .handle(&OffloadRequest::new(vec![1.0, 2.0], vec![0.0, f32::NAN]))
            .unwrap_err();
        assert!(matches!(err, OffloadError::InvalidRequest(ref m) if m.contains("right[1]")));
        assert_eq!(gw.session_stats().acquired, 0);
    }

    #[test]
    fn test_overflowing_sum_is_rejected() {
        let gw = gateway(&Config::default());
        let err = gw
            .handle(&OffloadRequest::new(vec![1.0, 3.0e38], vec![1.0, 3.0e38]))
            .unwrap_err();
        assert_eq!(err, OffloadError::ResultOverflow { index: 1 });

        let stats = gw.session_stats();
        assert_eq!(stats.acquired, 1);
        assert_eq!(stats.released, 1);
        assert_eq!(stats.resident(), 0);
    }

    #[test]
    fn test_request_accepts_original_field_names() {
        let req: OffloadRequest =
            serde_json::from_str(r#"{"hostX": [1.0], "hostY": [2.0]}"#).unwrap();
        assert_eq!(req.left, vec![1.0]);
        assert_eq!(req.right, vec![2.0]);
    }

    #[test]
    fn test_result_serializes_as_array() {
        let res = OffloadResult {
            sum: vec![1.5, 2.5],
        };
        assert_eq!(serde_json::to_string(&res).unwrap(), "[1.5,2.5]");
    }

    #[test]
    fn test_kernel_timing_recorded() {
        let gw = gateway(&Config::default());
        gw.handle(&OffloadRequest::new(vec![1.0; 8], vec![2.0; 8]))
            .unwrap();
        assert_eq!(gw.metrics().kernel_seconds.get_sample_count(), 1);
        assert_eq!(gw.metrics().host_reference_seconds.get_sample_count(), 1);
    }
}

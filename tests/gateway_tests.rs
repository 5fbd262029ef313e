//! Lifecycle tests for the offload gateway.
//!
//! `FaultyBackend` wraps the emulated device, counts every context and buffer
//! it hands out, and can be told to fail at one step of the offload.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use offload_gateway::config::Config;
use offload_gateway::device::host::{HostBackend, HostBuffer, HostContext};
use offload_gateway::device::{ComputeBackend, KernelSpec, LaunchGeometry};
use offload_gateway::metrics::OffloadMetrics;
use offload_gateway::offload::{Gateway, OffloadRequest};
use offload_gateway::OffloadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Fault {
    None = 0,
    Init,
    ModuleLoad,
    AllocFirst,
    AllocSecond,
    CopyIn,
    Launch,
    Execute,
    CopyOut,
}

impl Fault {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Fault::Init,
            2 => Fault::ModuleLoad,
            3 => Fault::AllocFirst,
            4 => Fault::AllocSecond,
            5 => Fault::CopyIn,
            6 => Fault::Launch,
            7 => Fault::Execute,
            8 => Fault::CopyOut,
            _ => Fault::None,
        }
    }
}

#[derive(Default)]
struct FaultyBackend {
    inner: HostBackend,
    fault: AtomicU8,
    contexts_created: AtomicU64,
    contexts_destroyed: AtomicU64,
    buffers_allocated: AtomicU64,
    buffers_freed: AtomicU64,
    allocs_this_session: AtomicU64,
}

impl FaultyBackend {
    fn failing_at(fault: Fault) -> Self {
        let b = Self::default();
        b.fault.store(fault as u8, Ordering::SeqCst);
        b
    }

    fn fault(&self) -> Fault {
        Fault::from_u8(self.fault.load(Ordering::SeqCst))
    }

    fn assert_balanced(&self) {
        assert_eq!(
            self.contexts_created.load(Ordering::SeqCst),
            self.contexts_destroyed.load(Ordering::SeqCst),
            "context leak"
        );
        assert_eq!(
            self.buffers_allocated.load(Ordering::SeqCst),
            self.buffers_freed.load(Ordering::SeqCst),
            "buffer leak"
        );
        assert_eq!(self.inner.bytes_in_use(), 0);
    }
}

impl ComputeBackend for FaultyBackend {
    type Context = HostContext;
    type Buffer = HostBuffer;

    fn name(&self) -> &'static str {
        "faulty"
    }

    fn init(&self) -> Result<(), OffloadError> {
        if self.fault() == Fault::Init {
            return Err(OffloadError::DeviceInit {
                device: 0,
                reason: "injected".into(),
            });
        }
        self.inner.init()
    }

    fn create_context(
        &self,
        device: usize,
        kernel: &KernelSpec,
    ) -> Result<HostContext, OffloadError> {
        if self.fault() == Fault::ModuleLoad {
            return Err(OffloadError::ModuleLoad {
                path: kernel.module_path.display().to_string(),
                reason: "injected".into(),
            });
        }
        let ctx = self.inner.create_context(device, kernel)?;
        self.contexts_created.fetch_add(1, Ordering::SeqCst);
        self.allocs_this_session.store(0, Ordering::SeqCst);
        Ok(ctx)
    }

    fn destroy_context(&self, context: HostContext) {
        self.contexts_destroyed.fetch_add(1, Ordering::SeqCst);
        self.inner.destroy_context(context);
    }

    fn alloc(&self, context: &HostContext, len: usize) -> Result<HostBuffer, OffloadError> {
        let nth = self.allocs_this_session.fetch_add(1, Ordering::SeqCst);
        let oom = match self.fault() {
            Fault::AllocFirst => nth % 2 == 0,
            Fault::AllocSecond => nth % 2 == 1,
            _ => false,
        };
        if oom {
            return Err(OffloadError::DeviceOom { bytes: len * 4 });
        }
        let buf = self.inner.alloc(context, len)?;
        self.buffers_allocated.fetch_add(1, Ordering::SeqCst);
        Ok(buf)
    }

    fn free(&self, context: &HostContext, buffer: HostBuffer) {
        self.buffers_freed.fetch_add(1, Ordering::SeqCst);
        self.inner.free(context, buffer);
    }

    fn copy_to_device(
        &self,
        context: &HostContext,
        src: &[f32],
        dst: &mut HostBuffer,
    ) -> Result<(), OffloadError> {
        if self.fault() == Fault::CopyIn {
            return Err(OffloadError::Transfer {
                direction: "host_to_device",
                reason: "injected".into(),
            });
        }
        self.inner.copy_to_device(context, src, dst)
    }

    fn copy_to_host(
        &self,
        context: &HostContext,
        src: &HostBuffer,
        dst: &mut [f32],
    ) -> Result<(), OffloadError> {
        if self.fault() == Fault::CopyOut {
            return Err(OffloadError::Transfer {
                direction: "device_to_host",
                reason: "injected".into(),
            });
        }
        self.inner.copy_to_host(context, src, dst)
    }

    fn launch(
        &self,
        context: &HostContext,
        geometry: LaunchGeometry,
        n: i32,
        x: &HostBuffer,
        y: &mut HostBuffer,
    ) -> Result<(), OffloadError> {
        if self.fault() == Fault::Launch {
            return Err(OffloadError::KernelLaunch("injected".into()));
        }
        self.inner.launch(context, geometry, n, x, y)
    }

    fn synchronize(&self, context: &HostContext) -> Result<(), OffloadError> {
        if self.fault() == Fault::Execute {
            return Err(OffloadError::KernelExecution("injected".into()));
        }
        self.inner.synchronize(context)
    }
}

fn gateway_with(backend: Arc<FaultyBackend>, config: &Config) -> Gateway<FaultyBackend> {
    let metrics = Arc::new(OffloadMetrics::new().unwrap());
    Gateway::new(backend, config, metrics)
}

fn request(left: &[f32], right: &[f32]) -> OffloadRequest {
    OffloadRequest::new(left.to_vec(), right.to_vec())
}

#[test]
fn test_sum_is_elementwise() {
    let backend = Arc::new(FaultyBackend::default());
    let gw = gateway_with(backend.clone(), &Config::default());

    for n in [1usize, 7, 1023, 1024, 1025, 4097] {
        let left: Vec<f32> = (0..n).map(|i| i as f32 * 0.5).collect();
        let right: Vec<f32> = (0..n).map(|i| 100.0 - i as f32).collect();
        let res = gw.handle(&request(&left, &right)).unwrap();

        assert_eq!(res.sum.len(), n);
        for i in 0..n {
            assert_eq!(res.sum[i], left[i] + right[i], "n = {n}, i = {i}");
        }
    }
    backend.assert_balanced();
}

#[test]
fn test_scenario_small_vectors() {
    let backend = Arc::new(FaultyBackend::default());
    let gw = gateway_with(backend.clone(), &Config::default());

    let res = gw
        .handle(&request(&[1.0, 2.0, 3.0], &[10.0, 20.0, 30.0]))
        .unwrap();
    assert_eq!(res.sum, vec![11.0, 22.0, 33.0]);
}

#[test]
fn test_mismatched_lengths_touch_no_device() {
    let backend = Arc::new(FaultyBackend::default());
    let gw = gateway_with(backend.clone(), &Config::default());

    let err = gw.handle(&request(&[1.0, 2.0], &[1.0])).unwrap_err();
    assert!(matches!(err, OffloadError::InvalidRequest(_)));
    assert_eq!(gw.session_stats().acquired, 0);
    assert_eq!(backend.contexts_created.load(Ordering::SeqCst), 0);
    assert!(!backend.inner.is_initialized());
}

#[test]
fn test_empty_input_is_invalid() {
    let backend = Arc::new(FaultyBackend::default());
    let gw = gateway_with(backend.clone(), &Config::default());

    let err = gw.handle(&request(&[], &[])).unwrap_err();
    assert!(matches!(err, OffloadError::InvalidRequest(_)));
    assert_eq!(backend.contexts_created.load(Ordering::SeqCst), 0);
}

#[test]
fn test_every_failure_releases_session_and_buffers() {
    let cases = [
        (Fault::AllocFirst, "device_oom"),
        (Fault::AllocSecond, "device_oom"),
        (Fault::CopyIn, "transfer"),
        (Fault::Launch, "kernel_launch"),
        (Fault::Execute, "kernel_execution"),
        (Fault::CopyOut, "transfer"),
    ];

    for (fault, kind) in cases {
        let backend = Arc::new(FaultyBackend::failing_at(fault));
        let gw = gateway_with(backend.clone(), &Config::default());

        let err = gw.handle(&request(&[1.0; 16], &[2.0; 16])).unwrap_err();
        assert_eq!(err.kind(), kind, "{fault:?}");
        assert!(err.status_code().is_server_error());

        let stats = gw.session_stats();
        assert_eq!(stats.acquired, 1, "{fault:?}");
        assert_eq!(stats.released, 1, "{fault:?}");
        backend.assert_balanced();
    }
}

#[test]
fn test_acquire_failures_leave_nothing_behind() {
    for (fault, kind) in [(Fault::Init, "device_init"), (Fault::ModuleLoad, "module_load")] {
        let backend = Arc::new(FaultyBackend::failing_at(fault));
        let gw = gateway_with(backend.clone(), &Config::default());

        let err = gw.handle(&request(&[1.0], &[2.0])).unwrap_err();
        assert_eq!(err.kind(), kind);
        assert!(err.is_environment_error());
        assert_eq!(gw.session_stats().acquired, 0);
        assert_eq!(gw.session_stats().released, 0);
        backend.assert_balanced();
    }
}

#[test]
fn test_missing_entry_point() {
    let backend = Arc::new(FaultyBackend::default());
    let mut cfg = Config::default();
    cfg.kernel.entry_point = "saxpy".to_string();
    let gw = gateway_with(backend.clone(), &cfg);

    let err = gw.handle(&request(&[1.0], &[2.0])).unwrap_err();
    assert_eq!(err, OffloadError::SymbolNotFound("saxpy".to_string()));
    backend.assert_balanced();
}

#[test]
fn test_recovers_on_fresh_session_after_failure() {
    let backend = Arc::new(FaultyBackend::failing_at(Fault::Execute));
    let gw = gateway_with(backend.clone(), &Config::default());

    assert!(gw.handle(&request(&[1.0], &[2.0])).is_err());

    backend.fault.store(Fault::None as u8, Ordering::SeqCst);
    let res = gw.handle(&request(&[1.0], &[2.0])).unwrap();
    assert_eq!(res.sum, vec![3.0]);

    assert_eq!(backend.contexts_created.load(Ordering::SeqCst), 2);
    backend.assert_balanced();
}

#[test]
fn test_repeated_requests_are_idempotent() {
    let backend = Arc::new(FaultyBackend::default());
    let gw = gateway_with(backend.clone(), &Config::default());

    let req = request(&[0.25, -1.0, 3.5, 1e6], &[0.75, 1.0, -3.5, 1.0]);
    let first = gw.handle(&req).unwrap();
    for _ in 0..10 {
        assert_eq!(gw.handle(&req).unwrap(), first);
    }

    let stats = gw.session_stats();
    assert_eq!(stats.acquired, 11);
    assert_eq!(stats.released, 11);
    backend.assert_balanced();
}

#[test]
fn test_pooled_sessions_are_reused_and_drained() {
    let backend = Arc::new(FaultyBackend::default());
    let mut cfg = Config::default();
    cfg.device.pool_sessions = true;
    let gw = gateway_with(backend.clone(), &cfg);

    for _ in 0..5 {
        gw.handle(&request(&[1.0, 1.0], &[2.0, 2.0])).unwrap();
    }
    assert_eq!(backend.contexts_created.load(Ordering::SeqCst), 1);
    assert_eq!(gw.session_stats().resident(), 1);

    gw.shutdown();
    assert_eq!(gw.session_stats().resident(), 0);
    backend.assert_balanced();
}

#[test]
fn test_pooled_failure_returns_session_to_pool() {
    let backend = Arc::new(FaultyBackend::failing_at(Fault::Launch));
    let mut cfg = Config::default();
    cfg.device.pool_sessions = true;
    let gw = gateway_with(backend.clone(), &cfg);

    assert!(gw.handle(&request(&[1.0], &[1.0])).is_err());
    assert_eq!(gw.session_stats().in_use(), 0);
    assert_eq!(
        backend.buffers_allocated.load(Ordering::SeqCst),
        backend.buffers_freed.load(Ordering::SeqCst)
    );

    backend.fault.store(Fault::None as u8, Ordering::SeqCst);
    assert_eq!(gw.handle(&request(&[1.0], &[1.0])).unwrap().sum, vec![2.0]);
    assert_eq!(backend.contexts_created.load(Ordering::SeqCst), 1);

    drop(gw);
    backend.assert_balanced();
}

#[test]
fn test_concurrent_requests_on_pool() {
    let backend = Arc::new(FaultyBackend::default());
    let mut cfg = Config::default();
    cfg.device.pool_sessions = true;
    let gw = Arc::new(gateway_with(backend.clone(), &cfg));

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let gw = gw.clone();
            std::thread::spawn(move || {
                for i in 0..20 {
                    let v = (t * 100 + i) as f32;
                    let res = gw.handle(&request(&[v; 32], &[1.0; 32])).unwrap();
                    assert!(res.sum.iter().all(|s| *s == v + 1.0));
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let stats = gw.session_stats();
    assert_eq!(stats.acquired, 160);
    assert_eq!(stats.released, 160);
    assert!(stats.created <= 8);

    drop(gw);
    backend.assert_balanced();
}

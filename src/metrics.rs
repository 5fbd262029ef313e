//! Prometheus metrics for the offload path.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

use crate::device::session::SessionStats;

/// Kernel times range from microseconds to seconds.
const TIMING_BUCKETS: &[f64] = &[
    0.000_01, 0.000_05, 0.000_1, 0.000_5, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0,
];

pub struct OffloadMetrics {
    registry: Registry,

    /// Finished requests by outcome (`ok` or an error kind).
    pub requests: IntCounterVec,

    /// Launch + synchronize wall time.
    pub kernel_seconds: Histogram,

    /// Host-side reference sum time.
    pub host_reference_seconds: Histogram,

    /// Elements copied to the device.
    pub elements: IntCounterVec,

    /// Device contexts currently alive.
    pub device_contexts: IntGauge,

    /// Sessions currently checked out.
    pub sessions_in_use: IntGauge,
}

impl OffloadMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("offload".to_string()), None)?;

        let requests = IntCounterVec::new(
            Opts::new("requests_total", "Vector add requests by outcome"),
            &["outcome"],
        )?;
        let kernel_seconds = Histogram::with_opts(
            HistogramOpts::new("kernel_seconds", "Kernel launch and synchronize wall time")
                .buckets(TIMING_BUCKETS.to_vec()),
        )?;
        let host_reference_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "host_reference_seconds",
                "Host-side reference computation time",
            )
            .buckets(TIMING_BUCKETS.to_vec()),
        )?;
        let elements = IntCounterVec::new(
            Opts::new("elements_total", "Vector elements offloaded"),
            &["backend"],
        )?;
        let device_contexts =
            IntGauge::new("device_contexts", "Device contexts currently alive")?;
        let sessions_in_use =
            IntGauge::new("sessions_in_use", "Device sessions currently checked out")?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(kernel_seconds.clone()))?;
        registry.register(Box::new(host_reference_seconds.clone()))?;
        registry.register(Box::new(elements.clone()))?;
        registry.register(Box::new(device_contexts.clone()))?;
        registry.register(Box::new(sessions_in_use.clone()))?;

        Ok(Self {
            registry,
            requests,
            kernel_seconds,
            host_reference_seconds,
            elements,
            device_contexts,
            sessions_in_use,
        })
    }

    /// Count one finished request.
    pub fn record_outcome(&self, outcome: &str) {
        self.requests.with_label_values(&[outcome]).inc();
    }

    /// Mirror session counters into the gauges.
    pub fn observe_sessions(&self, stats: &SessionStats) {
        self.device_contexts.set(stats.resident() as i64);
        self.sessions_in_use.set(stats.in_use() as i64);
    }

    /// Text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

//! Connection metrics for the hook server.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `hookgate_connections_total` | Counter | `outcome` |
//! | `hookgate_connections_active` | Gauge | |
//! | `hookgate_connection_duration_seconds` | Histogram | |

use std::time::Duration;

use prometheus::{
    Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

use crate::errors::Result;

pub const DURATION_BUCKETS: &[f64] = &[0.005, 0.025, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0];

/// Receives connection observations. Implementations swallow their own
/// failures; the server never waits on them for protocol decisions.
pub trait MetricsSink: Send + Sync {
    fn connection_opened(&self);

    fn connection_closed(&self, outcome: &str, elapsed: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn connection_opened(&self) {}

    fn connection_closed(&self, _outcome: &str, _elapsed: Duration) {}
}

#[derive(Clone)]
pub struct PrometheusMetrics {
    registry: Registry,
    connections_total: IntCounterVec,
    connections_active: IntGauge,
    connection_duration: Histogram,
}

impl PrometheusMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let connections_total = IntCounterVec::new(
            Opts::new("hookgate_connections_total", "Hook connections by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_active =
            IntGauge::new("hookgate_connections_active", "Hook connections in progress")?;
        registry.register(Box::new(connections_active.clone()))?;

        let connection_duration = Histogram::with_opts(
            HistogramOpts::new(
                "hookgate_connection_duration_seconds",
                "Time from accept to close of a hook connection",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(connection_duration.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            connection_duration,
        })
    }

    pub fn connections(&self, outcome: &str) -> u64 {
        self.connections_total.with_label_values(&[outcome]).get()
    }

    pub fn active(&self) -> i64 {
        self.connections_active.get()
    }

    /// Prometheus text exposition of everything recorded so far.
    pub fn encode_text(&self) -> String {
        TextEncoder::new()
            .encode_to_string(&self.registry.gather())
            .unwrap_or_default()
    }
}

impl MetricsSink for PrometheusMetrics {
    fn connection_opened(&self) {
        self.connections_active.inc();
    }

    fn connection_closed(&self, outcome: &str, elapsed: Duration) {
        self.connections_active.dec();
        self.connections_total.with_label_values(&[outcome]).inc();
        self.connection_duration.observe(elapsed.as_secs_f64());
    }
}

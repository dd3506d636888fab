//! Prometheus metrics for batches, documents and decoder runs

use lazy_static::lazy_static;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder};

lazy_static! {
    /// Registry exposed by the `/metrics` endpoint
    pub static ref REGISTRY: Registry = Registry::new();

    /// Batches by result (`completed`, `rejected`, `workspace_error`)
    pub static ref BATCHES_TOTAL: IntCounterVec = register(IntCounterVec::new(
        Opts::new("matie_batches_total", "Annotation batches by result"),
        &["result"],
    ));

    /// Documents by outcome (`annotated` or an error kind)
    pub static ref DOCUMENTS_TOTAL: IntCounterVec = register(IntCounterVec::new(
        Opts::new("matie_documents_total", "Documents by outcome"),
        &["outcome"],
    ));

    /// Decoder invocations by final status
    pub static ref TOOL_RUNS_TOTAL: IntCounterVec = register(IntCounterVec::new(
        Opts::new("matie_tool_runs_total", "Decoder invocations by status"),
        &["status"],
    ));

    pub static ref TOOL_DURATION_SECONDS: Histogram = register(Histogram::with_opts(
        HistogramOpts::new("matie_tool_duration_seconds", "Wall time of one decoder invocation")
            .buckets(vec![0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
    ));
}

/// Register a metric with [`REGISTRY`], panicking on duplicate names
pub fn register<T>(metric: prometheus::Result<T>) -> T
where
    T: prometheus::core::Collector + Clone + 'static,
{
    let metric = metric.expect("metric options are valid");
    REGISTRY
        .register(Box::new(metric.clone()))
        .expect("metric registered once");
    metric
}

/// Render all registered metrics in the Prometheus text format
pub fn gather_text() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

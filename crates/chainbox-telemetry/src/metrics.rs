//! Prometheus metrics for the execution fabric.
//!
//! Naming convention: `chainbox_<component>_<metric>_<unit>`.
//!
//! ## Metric Types
//!
//! - **Counter**: monotonically increasing (e.g. executions_total)
//! - **Gauge**: value that can go up or down (e.g. node_active_requests)
//! - **Histogram**: distribution of values (e.g. executor duration)

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, Counter, CounterVec, Encoder, Gauge, HistogramVec, Opts, Registry,
    TextEncoder,
};

use crate::TelemetryError;

lazy_static! {
    /// Global metrics registry.
    pub static ref REGISTRY: Registry = Registry::new();

    // =========================================================================
    // EXECUTOR
    // =========================================================================

    /// Invocations entering the executor pipeline.
    pub static ref EXECUTIONS_TOTAL: Counter = Counter::new(
        "chainbox_executor_executions_total",
        "Total invocations entering the executor"
    ).expect("metric creation failed");

    /// Completed invocations by terminal outcome tag.
    pub static ref EXECUTION_OUTCOMES: CounterVec = CounterVec::new(
        Opts::new("chainbox_executor_outcomes_total", "Completed invocations by outcome"),
        &["outcome"]
    ).expect("metric creation failed");

    /// End-to-end invocation duration by execution target.
    pub static ref EXECUTION_DURATION: HistogramVec = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "chainbox_executor_duration_seconds",
            "Invocation duration from gate checks to completion"
        ).buckets(exponential_buckets(0.001, 2.0, 15).unwrap()),
        &["target"]
    ).expect("metric creation failed");

    /// Completed frames observed without an outcome tag.
    pub static ref INVARIANT_VIOLATIONS: Counter = Counter::new(
        "chainbox_executor_invariant_violations_total",
        "Frames that completed without an outcome and were coerced to FAILURE"
    ).expect("metric creation failed");

    /// Retry attempts spent by the executor beyond the first.
    pub static ref EXECUTION_RETRIES: Counter = Counter::new(
        "chainbox_executor_retries_total",
        "Additional attempts spent by the retry wrapper"
    ).expect("metric creation failed");

    // =========================================================================
    // GUARDS
    // =========================================================================

    /// Result-cache hits.
    pub static ref CACHE_HITS: Counter = Counter::new(
        "chainbox_cache_hits_total",
        "Cacheable invocations served from the result cache"
    ).expect("metric creation failed");

    /// Result-cache misses.
    pub static ref CACHE_MISSES: Counter = Counter::new(
        "chainbox_cache_misses_total",
        "Cacheable invocations that missed the result cache"
    ).expect("metric creation failed");

    /// Root calls rejected by the rate limiter.
    pub static ref RATE_LIMITED_TOTAL: Counter = Counter::new(
        "chainbox_rate_limited_total",
        "Root invocations rejected with RATE_LIMITED"
    ).expect("metric creation failed");

    /// Root calls rejected by tenant quota.
    pub static ref TENANT_REJECTIONS: Counter = Counter::new(
        "chainbox_tenant_rejections_total",
        "Root invocations rejected with TENANT_QUOTA_EXCEEDED"
    ).expect("metric creation failed");

    // =========================================================================
    // MESH
    // =========================================================================

    /// Mesh dispatches by outcome.
    pub static ref MESH_CALLS: CounterVec = CounterVec::new(
        Opts::new("chainbox_mesh_calls_total", "Mesh dispatches by outcome"),
        &["outcome"]  // outcome: success/failure/circuit_open
    ).expect("metric creation failed");

    /// Transport-level retries performed by the mesh client.
    pub static ref MESH_RETRIES: Counter = Counter::new(
        "chainbox_mesh_retries_total",
        "Mesh transport retries after a failed attempt"
    ).expect("metric creation failed");

    /// Circuit breaker state transitions.
    pub static ref CIRCUIT_TRANSITIONS: CounterVec = CounterVec::new(
        Opts::new("chainbox_circuit_transitions_total", "Circuit breaker transitions"),
        &["state"]  // state: open/half_open/closed
    ).expect("metric creation failed");

    // =========================================================================
    // NODE SERVER
    // =========================================================================

    /// Requests accepted by the mesh node server.
    pub static ref NODE_REQUESTS: Counter = Counter::new(
        "chainbox_node_requests_total",
        "Requests accepted by the mesh node server"
    ).expect("metric creation failed");

    /// In-flight requests on the mesh node server.
    pub static ref NODE_ACTIVE_REQUESTS: Gauge = Gauge::new(
        "chainbox_node_active_requests",
        "Requests currently being served by the node"
    ).expect("metric creation failed");
}

/// Handle for registered metrics.
pub struct MetricsHandle {
    _registry: Registry,
}

/// Register all fabric metrics with the global registry.
pub fn register_metrics() -> Result<MetricsHandle, TelemetryError> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        // Executor
        Box::new(EXECUTIONS_TOTAL.clone()),
        Box::new(EXECUTION_OUTCOMES.clone()),
        Box::new(EXECUTION_DURATION.clone()),
        Box::new(INVARIANT_VIOLATIONS.clone()),
        Box::new(EXECUTION_RETRIES.clone()),
        // Guards
        Box::new(CACHE_HITS.clone()),
        Box::new(CACHE_MISSES.clone()),
        Box::new(RATE_LIMITED_TOTAL.clone()),
        Box::new(TENANT_REJECTIONS.clone()),
        // Mesh
        Box::new(MESH_CALLS.clone()),
        Box::new(MESH_RETRIES.clone()),
        Box::new(CIRCUIT_TRANSITIONS.clone()),
        // Node
        Box::new(NODE_REQUESTS.clone()),
        Box::new(NODE_ACTIVE_REQUESTS.clone()),
    ];

    for metric in metrics {
        // Re-registration happens when tests build multiple fabrics; ignore.
        let _ = REGISTRY.register(metric);
    }

    Ok(MetricsHandle {
        _registry: REGISTRY.clone(),
    })
}

/// Encode all metrics in Prometheus text format.
pub fn encode_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}

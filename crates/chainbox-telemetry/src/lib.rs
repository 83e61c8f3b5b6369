//! # Chainbox Telemetry
//!
//! Observability for the execution fabric:
//!
//! - **Metrics**: Prometheus counters and histograms for every critical-path
//!   component, rendered for the node's `/metrics` endpoint
//! - **Tracing**: `tracing` subscriber setup with env-filterable levels
//! - **Audit**: append-only ring of completed invocations with an optional
//!   durable NDJSON tail
//!
//! Libraries only record; the node binary calls [`init_telemetry`] once and
//! holds the returned guard for the life of the process.

pub mod audit;
pub mod config;
pub mod metrics;
pub mod tracing_setup;

pub use audit::{AuditConfig, AuditEntry, AuditLevel, AuditLog};
pub use config::TelemetryConfig;
pub use metrics::{encode_metrics, register_metrics, MetricsHandle};
pub use tracing_setup::TracingGuard;

use thiserror::Error;

/// Telemetry initialization errors.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to initialize tracing subscriber: {0}")]
    TracingInit(String),

    #[error("failed to initialize metrics: {0}")]
    MetricsInit(String),

    #[error("invalid telemetry configuration: {0}")]
    Config(String),
}

/// Guard that keeps telemetry active. Drop to flush and shut down.
pub struct TelemetryGuard {
    _tracing: Option<TracingGuard>,
    _metrics: Option<MetricsHandle>,
}

/// Initialize metrics and the tracing subscriber.
///
/// Returns a guard that must be held for the lifetime of the process. With
/// `enabled = false` the guard is inert and nothing is registered.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    if !config.enabled {
        return Ok(TelemetryGuard {
            _tracing: None,
            _metrics: None,
        });
    }

    let metrics_handle = register_metrics()?;
    let tracing_guard = tracing_setup::init_tracing(config)?;

    Ok(TelemetryGuard {
        _tracing: Some(tracing_guard),
        _metrics: Some(metrics_handle),
    })
}

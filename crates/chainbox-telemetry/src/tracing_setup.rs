//! Tracing subscriber initialization.

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::{TelemetryConfig, TelemetryError};

/// Guard keeping the subscriber installed. Currently a marker; dropping it
/// does not uninstall the global subscriber.
pub struct TracingGuard {
    _private: (),
}

/// Install the global tracing subscriber.
///
/// Level comes from `RUST_LOG` when set, else the configured log level.
/// Safe to call more than once; later calls are no-ops (tests initialise
/// telemetry repeatedly).
pub fn init_tracing(config: &TelemetryConfig) -> Result<TracingGuard, TelemetryError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    let installed = if config.log_json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(true)
            .try_init()
            .is_ok()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()
            .is_ok()
    };

    if installed {
        info!(
            service = %config.service_name,
            level = %config.log_level,
            json = config.log_json,
            "Tracing initialized"
        );
    }

    Ok(TracingGuard { _private: () })
}

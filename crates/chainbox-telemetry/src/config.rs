//! Telemetry configuration from environment variables.

/// Observability toggles.
///
/// | Variable | Default | Description |
/// |----------|---------|-------------|
/// | `CHAINBOX_TELEMETRY_ENABLED` | `true` | Master switch |
/// | `CHAINBOX_TELEMETRY_SERVICE_NAME` | `chainbox` | Service name attached to logs |
/// | `CHAINBOX_LOG_LEVEL` | `info` | Log level filter |
/// | `CHAINBOX_LOG_JSON` | `false` | Emit JSON-formatted log lines |
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub service_name: String,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            service_name: "chainbox".to_string(),
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl TelemetryConfig {
    /// Load from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: env_bool("CHAINBOX_TELEMETRY_ENABLED", defaults.enabled),
            service_name: std::env::var("CHAINBOX_TELEMETRY_SERVICE_NAME")
                .unwrap_or(defaults.service_name),
            log_level: std::env::var("CHAINBOX_LOG_LEVEL").unwrap_or(defaults.log_level),
            log_json: env_bool("CHAINBOX_LOG_JSON", defaults.log_json),
        }
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

//! Fabric configuration with env loading and validation.

use std::collections::BTreeMap;
use std::path::PathBuf;

use thiserror::Error;

use chainbox_telemetry::{AuditConfig, AuditLevel};
use chainbox_types::signer::DEFAULT_SIGNATURE_TTL_MS;

use crate::rate_limit::RateRule;
use crate::tenant::TenantConfig;

/// Deployment environment. Production strips internal trace metadata from
/// root results; development attaches the trace tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl std::str::FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(ConfigError::Invalid(format!("unknown environment: {other}"))),
        }
    }
}

/// Bearer-token verification settings.
#[derive(Debug, Clone)]
pub struct AuthSettings {
    /// Symmetric verification secret. Unset means bearer tokens cannot verify.
    pub secret: Option<String>,
    /// Allowed signature algorithms (symmetric HS family only).
    pub algorithms: Vec<String>,
    /// Role assigned when the token carries none.
    pub default_role: String,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            secret: None,
            algorithms: vec!["HS256".to_string()],
            default_role: "user".to_string(),
        }
    }
}

/// One peer node from `mesh.nodes`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEntry {
    pub id: String,
    pub url: String,
}

/// One routing rule from `mesh.routes`: dotted glob to candidate nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub pattern: String,
    pub node_ids: Vec<String>,
}

/// Mesh transport settings.
#[derive(Debug, Clone)]
pub struct MeshSettings {
    /// HMAC secret; enables signing on both ends when set.
    pub secret: Option<String>,
    pub signature_ttl_ms: u64,
    pub nodes: Vec<NodeEntry>,
    pub routes: Vec<RouteEntry>,
    /// Per-origin connection pool size.
    pub connections: usize,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    /// Hard ceiling on a single mesh request.
    pub request_timeout_ms: u64,
}

impl Default for MeshSettings {
    fn default() -> Self {
        Self {
            secret: None,
            signature_ttl_ms: DEFAULT_SIGNATURE_TTL_MS,
            nodes: Vec::new(),
            routes: Vec::new(),
            connections: 100,
            max_retries: 3,
            backoff_base_ms: 100,
            request_timeout_ms: 30_000,
        }
    }
}

/// Circuit breaker tuning.
#[derive(Debug, Clone)]
pub struct CircuitSettings {
    pub failure_threshold: u32,
    pub open_timeout_ms: u64,
    pub success_threshold: u32,
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout_ms: 30_000,
            success_threshold: 2,
        }
    }
}

/// Rate limiter rules.
#[derive(Debug, Clone, Default)]
pub struct RateLimitSettings {
    /// Applied when no per-capability rule matches. Unset means unlimited.
    pub default_rule: Option<RateRule>,
    /// Exact capability names or namespace wildcards (`X.*`) to rules.
    pub rules: Vec<(String, RateRule)>,
}

/// Result cache tuning.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub default_ttl_ms: u64,
    pub max_size: usize,
    /// Name suffix that opts a call into caching.
    pub suffix: String,
    /// Capabilities cacheable without the suffix, with optional TTL override.
    pub per_capability: Vec<(String, Option<u64>)>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            default_ttl_ms: 60_000,
            max_size: 1024,
            suffix: ".Cached".to_string(),
            per_capability: Vec::new(),
        }
    }
}

/// Complete fabric configuration.
#[derive(Debug, Clone)]
pub struct FabricConfig {
    pub environment: Environment,
    /// This process's node id inside the mesh.
    pub node_id: String,
    pub max_call_depth: u32,
    pub default_timeout_ms: u64,
    pub auth: AuthSettings,
    pub mesh: MeshSettings,
    pub circuit: CircuitSettings,
    pub rate: RateLimitSettings,
    pub cache: CacheSettings,
    pub tenants: Vec<TenantConfig>,
    pub audit: AuditConfig,
    /// Root directory for filesystem capability resolution.
    pub registry_root: Option<PathBuf>,
    /// Root directory for KV/blob namespaces.
    pub storage_dir: PathBuf,
    /// Environment variables exposed read-only to handlers.
    pub handler_env: BTreeMap<String, String>,
    /// Mesh node server: request body cap in bytes.
    pub max_body_size: usize,
    /// Mesh node server: bind address.
    pub bind_addr: String,
    /// Mesh node server: drain window before force-exit on shutdown.
    pub shutdown_grace_ms: u64,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            node_id: "local".to_string(),
            max_call_depth: 8,
            default_timeout_ms: 30_000,
            auth: AuthSettings::default(),
            mesh: MeshSettings::default(),
            circuit: CircuitSettings::default(),
            rate: RateLimitSettings::default(),
            cache: CacheSettings::default(),
            tenants: Vec::new(),
            audit: AuditConfig::default(),
            registry_root: None,
            storage_dir: PathBuf::from("./chainbox-data"),
            handler_env: BTreeMap::new(),
            max_body_size: 1024 * 1024,
            bind_addr: "0.0.0.0:4000".to_string(),
            shutdown_grace_ms: 10_000,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("invalid node list entry: {0}")]
    InvalidNode(String),
    #[error("invalid route entry: {0}")]
    InvalidRoute(String),
    #[error("route references unknown node: {0}")]
    UnknownRouteNode(String),
    #[error("invalid rate rule: {0}")]
    InvalidRateRule(String),
    #[error("invalid tenant configs: {0}")]
    InvalidTenants(String),
    #[error("unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl FabricConfig {
    /// Load from `CHAINBOX_*` environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let environment = match std::env::var("CHAINBOX_ENV") {
            Ok(v) => v.parse()?,
            Err(_) => defaults.environment,
        };

        let mesh = MeshSettings {
            secret: env_opt("CHAINBOX_MESH_SECRET"),
            signature_ttl_ms: env_u64("CHAINBOX_MESH_SIGNATURE_TTL_MS", DEFAULT_SIGNATURE_TTL_MS)?,
            nodes: match env_opt("CHAINBOX_MESH_NODES") {
                Some(raw) => parse_node_list(&raw)?,
                None => Vec::new(),
            },
            routes: match env_opt("CHAINBOX_MESH_ROUTES") {
                Some(raw) => parse_route_list(&raw)?,
                None => Vec::new(),
            },
            connections: env_u64("CHAINBOX_MESH_CONNECTIONS", 100)? as usize,
            max_retries: env_u64("CHAINBOX_MESH_MAX_RETRIES", 3)? as u32,
            backoff_base_ms: env_u64("CHAINBOX_MESH_BACKOFF_BASE_MS", 100)?,
            request_timeout_ms: env_u64("CHAINBOX_MESH_REQUEST_TIMEOUT_MS", 30_000)?,
        };

        let rate = RateLimitSettings {
            default_rule: match env_opt("CHAINBOX_RATE_LIMIT_DEFAULT") {
                Some(raw) => Some(
                    raw.parse()
                        .map_err(|e: String| ConfigError::InvalidRateRule(e))?,
                ),
                None => None,
            },
            rules: match env_opt("CHAINBOX_RATE_LIMIT_RULES") {
                Some(raw) => parse_rate_rules(&raw)?,
                None => Vec::new(),
            },
        };

        let tenants = match env_opt("CHAINBOX_TENANT_CONFIGS") {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| ConfigError::InvalidTenants(e.to_string()))?,
            None => Vec::new(),
        };

        let audit = AuditConfig {
            enabled: env_bool("CHAINBOX_AUDIT_ENABLED", true),
            level: match env_opt("CHAINBOX_AUDIT_LEVEL") {
                Some(raw) => raw.parse().map_err(ConfigError::Invalid)?,
                None => AuditLevel::All,
            },
            capacity: env_u64("CHAINBOX_AUDIT_CAPACITY", 1024)? as usize,
            path: env_opt("CHAINBOX_AUDIT_PATH").map(PathBuf::from),
        };

        let handler_env = env_opt("CHAINBOX_HANDLER_ENV")
            .map(|names| {
                names
                    .split(',')
                    .map(str::trim)
                    .filter(|n| !n.is_empty())
                    .filter_map(|n| std::env::var(n).ok().map(|v| (n.to_string(), v)))
                    .collect()
            })
            .unwrap_or_default();

        let config = Self {
            environment,
            node_id: env_opt("CHAINBOX_NODE_ID").unwrap_or(defaults.node_id),
            max_call_depth: env_u64("CHAINBOX_MAX_CALL_DEPTH", 8)? as u32,
            default_timeout_ms: env_u64("CHAINBOX_DEFAULT_TIMEOUT_MS", 30_000)?,
            auth: AuthSettings {
                secret: env_opt("CHAINBOX_AUTH_SECRET"),
                algorithms: env_opt("CHAINBOX_AUTH_ALGORITHMS")
                    .map(|s| s.split(',').map(|a| a.trim().to_string()).collect())
                    .unwrap_or(defaults.auth.algorithms),
                default_role: env_opt("CHAINBOX_DEFAULT_ROLE").unwrap_or(defaults.auth.default_role),
            },
            mesh,
            circuit: CircuitSettings {
                failure_threshold: env_u64("CHAINBOX_CIRCUIT_THRESHOLD", 5)? as u32,
                open_timeout_ms: env_u64("CHAINBOX_CIRCUIT_TIMEOUT_MS", 30_000)?,
                success_threshold: env_u64("CHAINBOX_CIRCUIT_SUCCESS_THRESHOLD", 2)? as u32,
            },
            rate,
            cache: CacheSettings {
                default_ttl_ms: env_u64("CHAINBOX_CACHE_DEFAULT_TTL_MS", 60_000)?,
                max_size: env_u64("CHAINBOX_CACHE_MAX_SIZE", 1024)? as usize,
                suffix: env_opt("CHAINBOX_CACHE_SUFFIX").unwrap_or(defaults.cache.suffix),
                per_capability: Vec::new(),
            },
            tenants,
            audit,
            registry_root: env_opt("CHAINBOX_REGISTRY_ROOT").map(PathBuf::from),
            storage_dir: env_opt("CHAINBOX_STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.storage_dir),
            handler_env,
            max_body_size: env_u64("CHAINBOX_MAX_BODY_SIZE", 1024 * 1024)? as usize,
            bind_addr: env_opt("CHAINBOX_BIND_ADDR").unwrap_or(defaults.bind_addr),
            shutdown_grace_ms: env_u64("CHAINBOX_SHUTDOWN_GRACE_MS", 10_000)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_call_depth == 0 {
            return Err(ConfigError::Invalid("max_call_depth cannot be 0".into()));
        }
        if self.default_timeout_ms == 0 {
            return Err(ConfigError::Invalid("default_timeout_ms cannot be 0".into()));
        }
        if self.max_body_size == 0 {
            return Err(ConfigError::Invalid("max_body_size cannot be 0".into()));
        }
        if self.circuit.failure_threshold == 0 || self.circuit.success_threshold == 0 {
            return Err(ConfigError::Invalid(
                "circuit thresholds cannot be 0".into(),
            ));
        }
        if self.mesh.connections == 0 {
            return Err(ConfigError::Invalid("mesh.connections cannot be 0".into()));
        }

        for alg in &self.auth.algorithms {
            if !matches!(alg.as_str(), "HS256" | "HS384" | "HS512") {
                return Err(ConfigError::UnsupportedAlgorithm(alg.clone()));
            }
        }

        for route in &self.mesh.routes {
            for node_id in &route.node_ids {
                if !self.mesh.nodes.iter().any(|n| &n.id == node_id) {
                    return Err(ConfigError::UnknownRouteNode(node_id.clone()));
                }
            }
        }

        Ok(())
    }
}

/// Parse `id=url,id=url` into node entries.
pub fn parse_node_list(raw: &str) -> Result<Vec<NodeEntry>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|pair| {
            let (id, url) = pair
                .split_once('=')
                .ok_or_else(|| ConfigError::InvalidNode(pair.to_string()))?;
            if id.is_empty() || url.is_empty() {
                return Err(ConfigError::InvalidNode(pair.to_string()));
            }
            Ok(NodeEntry {
                id: id.trim().to_string(),
                url: url.trim().trim_end_matches('/').to_string(),
            })
        })
        .collect()
}

/// Parse `glob:id|id,glob:id` into route entries, preserving order.
pub fn parse_route_list(raw: &str) -> Result<Vec<RouteEntry>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let (pattern, nodes) = entry
                .split_once(':')
                .ok_or_else(|| ConfigError::InvalidRoute(entry.to_string()))?;
            let node_ids: Vec<String> = nodes
                .split('|')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            if pattern.is_empty() || node_ids.is_empty() {
                return Err(ConfigError::InvalidRoute(entry.to_string()));
            }
            Ok(RouteEntry {
                pattern: pattern.trim().to_string(),
                node_ids,
            })
        })
        .collect()
}

/// Parse `name=N/unit,name=N/unit` into per-capability rate rules.
pub fn parse_rate_rules(raw: &str) -> Result<Vec<(String, RateRule)>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|pair| {
            let (name, rule) = pair
                .split_once('=')
                .ok_or_else(|| ConfigError::InvalidRateRule(pair.to_string()))?;
            let parsed: RateRule = rule.parse().map_err(ConfigError::InvalidRateRule)?;
            Ok((name.trim().to_string(), parsed))
        })
        .collect()
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_u64(key: &str, default: u64) -> Result<u64, ConfigError> {
    match env_opt(key) {
        Some(v) => v
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("{key} must be an integer, got {v}"))),
        None => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match env_opt(key) {
        Some(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        assert!(FabricConfig::default().validate().is_ok());
    }

    #[test]
    fn test_parse_node_list() {
        let nodes = parse_node_list("compute=http://h:4000, storage=http://s:4001/").unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].id, "compute");
        assert_eq!(nodes[0].url, "http://h:4000");
        assert_eq!(nodes[1].url, "http://s:4001");
    }

    #[test]
    fn test_parse_node_list_rejects_garbage() {
        assert!(parse_node_list("no-equals-here").is_err());
        assert!(parse_node_list("=http://h:4000").is_err());
    }

    #[test]
    fn test_parse_route_list_preserves_order() {
        let routes = parse_route_list("Heavy.*:compute|compute2,User.*:storage").unwrap();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].pattern, "Heavy.*");
        assert_eq!(routes[0].node_ids, vec!["compute", "compute2"]);
        assert_eq!(routes[1].pattern, "User.*");
    }

    #[test]
    fn test_route_must_reference_known_node() {
        let mut config = FabricConfig::default();
        config.mesh.routes = vec![RouteEntry {
            pattern: "X.*".into(),
            node_ids: vec!["ghost".into()],
        }];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownRouteNode(_))
        ));
    }

    #[test]
    fn test_algorithm_allow_list() {
        let mut config = FabricConfig::default();
        config.auth.algorithms = vec!["RS256".into()];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn test_parse_rate_rules() {
        let rules = parse_rate_rules("User.Create=10/minute, Billing.*=5/second").unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].0, "User.Create");
        assert_eq!(rules[0].1.max_requests, 10);
        assert_eq!(rules[1].1.window_ms, 1_000);
    }
}

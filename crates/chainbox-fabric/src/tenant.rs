//! Per-tenant quotas, routing pool, and effective execution limits.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

use chainbox_telemetry::metrics::TENANT_REJECTIONS;
use chainbox_types::{epoch_ms, FabricError, Identity};

/// Tenant id used for authenticated callers without a tenant claim.
pub const DEFAULT_TENANT: &str = "default";
/// Tenant id used for anonymous callers.
pub const ANONYMOUS_TENANT: &str = "anonymous";

/// Static configuration for one tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantConfig {
    pub tenant_id: String,
    #[serde(default)]
    pub max_calls_per_minute: Option<u64>,
    #[serde(default)]
    pub max_call_depth: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Node-id prefix restricting where this tenant's calls may run.
    #[serde(default)]
    pub node_pool: Option<String>,
    #[serde(default)]
    pub priority: i32,
}

/// Execution limits resolved for one caller.
#[derive(Debug, Clone, Default)]
pub struct TenantLimits {
    pub max_call_depth: Option<u32>,
    pub timeout_ms: Option<u64>,
    pub node_pool: Option<String>,
    pub priority: i32,
}

#[derive(Debug, Default)]
struct TenantWindow {
    count: u64,
    window_start: u64,
    successes: u64,
    failures: u64,
}

/// Quota state and effective limits per tenant.
pub struct TenantManager {
    configs: HashMap<String, TenantConfig>,
    windows: DashMap<String, TenantWindow>,
}

impl TenantManager {
    pub fn new(configs: Vec<TenantConfig>) -> Self {
        Self {
            configs: configs
                .into_iter()
                .map(|c| (c.tenant_id.clone(), c))
                .collect(),
            windows: DashMap::new(),
        }
    }

    /// Tenant id for a caller: `tenant_id` claim, else `org_id`, else the
    /// default/anonymous buckets.
    pub fn tenant_id(identity: Option<&Identity>) -> String {
        match identity {
            Some(identity) => identity
                .claim_str("tenant_id")
                .or_else(|| identity.claim_str("org_id"))
                .unwrap_or(DEFAULT_TENANT)
                .to_string(),
            None => ANONYMOUS_TENANT.to_string(),
        }
    }

    /// Limits the executor applies when building the root frame.
    pub fn effective_limits(&self, identity: Option<&Identity>) -> TenantLimits {
        let tenant = Self::tenant_id(identity);
        match self.configs.get(&tenant) {
            Some(config) => TenantLimits {
                max_call_depth: config.max_call_depth,
                timeout_ms: config.timeout_ms,
                node_pool: config.node_pool.clone(),
                priority: config.priority,
            },
            None => TenantLimits::default(),
        }
    }

    /// Consume one slot of the tenant's per-minute quota or fail with
    /// `TENANT_QUOTA_EXCEEDED`. Tenants without a configured quota are
    /// unlimited.
    pub fn enforce(&self, identity: Option<&Identity>) -> Result<(), FabricError> {
        let tenant = Self::tenant_id(identity);
        let Some(quota) = self.configs.get(&tenant).and_then(|c| c.max_calls_per_minute) else {
            return Ok(());
        };

        let now = epoch_ms();
        let mut window = self.windows.entry(tenant.clone()).or_default();
        if now.saturating_sub(window.window_start) > 60_000 {
            window.count = 0;
            window.window_start = now;
        }

        if window.count >= quota {
            TENANT_REJECTIONS.inc();
            warn!(tenant = %tenant, quota = quota, "Tenant quota exhausted");
            return Err(FabricError::tenant_quota(&tenant));
        }

        window.count += 1;
        Ok(())
    }

    /// Record a completed call for quota accounting.
    pub fn record_call(&self, identity: Option<&Identity>, success: bool) {
        let tenant = Self::tenant_id(identity);
        let mut window = self.windows.entry(tenant).or_default();
        if success {
            window.successes += 1;
        } else {
            window.failures += 1;
        }
    }

    /// (successes, failures) recorded for a tenant since startup.
    pub fn call_counts(&self, tenant_id: &str) -> (u64, u64) {
        self.windows
            .get(tenant_id)
            .map(|w| (w.successes, w.failures))
            .unwrap_or((0, 0))
    }
}

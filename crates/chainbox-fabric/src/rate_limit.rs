//! Per-caller, per-capability window rate limiting.
//!
//! Keys combine the caller (identity id, or the literal `anonymous`) with
//! the capability name. Rules come from configuration as `N/second`,
//! `N/minute`, or `N/hour`; a namespace wildcard (`X.*`) applies when no
//! exact rule matches. Only root invocations are limited; nested calls
//! inherit the admission of their root.

use dashmap::DashMap;
use tracing::{debug, warn};

use chainbox_telemetry::metrics::RATE_LIMITED_TOTAL;
use chainbox_types::{epoch_ms, FabricError, Identity};

use crate::config::RateLimitSettings;

/// Caller key used when no identity is present.
pub const ANONYMOUS: &str = "anonymous";

/// One parsed rate rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateRule {
    pub max_requests: u64,
    pub window_ms: u64,
}

impl std::str::FromStr for RateRule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (count, unit) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| format!("rate rule must be N/unit, got {s}"))?;
        let max_requests: u64 = count
            .trim()
            .parse()
            .map_err(|_| format!("invalid request count in rate rule: {s}"))?;
        if max_requests == 0 {
            return Err(format!("rate rule count cannot be 0: {s}"));
        }
        let window_ms = match unit.trim() {
            "second" => 1_000,
            "minute" => 60_000,
            "hour" => 3_600_000,
            other => return Err(format!("unknown rate unit: {other}")),
        };
        Ok(Self {
            max_requests,
            window_ms,
        })
    }
}

#[derive(Debug)]
struct RateBucket {
    count: u64,
    window_start: u64,
}

/// Admission decision for one attempt.
#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    /// Milliseconds until the window resets. Zero when allowed.
    pub reset_ms: u64,
}

/// Window rate limiter over `(caller, capability)` buckets.
pub struct RateLimiter {
    settings: RateLimitSettings,
    buckets: DashMap<String, RateBucket>,
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            settings,
            buckets: DashMap::new(),
        }
    }

    /// Consume one slot for this caller and capability.
    ///
    /// Unconfigured capabilities are unlimited.
    pub fn is_allowed(&self, identity: Option<&Identity>, fn_name: &str) -> RateDecision {
        let Some(rule) = self.rule_for(fn_name) else {
            return RateDecision {
                allowed: true,
                reset_ms: 0,
            };
        };

        let caller = identity.map(|i| i.id.as_str()).unwrap_or(ANONYMOUS);
        let key = format!("{caller}:{fn_name}");
        let now = epoch_ms();

        let mut bucket = self.buckets.entry(key).or_insert_with(|| {
            debug!(fn_name = %fn_name, caller = %caller, "Opening rate bucket");
            RateBucket {
                count: 0,
                window_start: now,
            }
        });

        if now.saturating_sub(bucket.window_start) > rule.window_ms {
            bucket.count = 0;
            bucket.window_start = now;
        }

        if bucket.count >= rule.max_requests {
            let reset_ms = (bucket.window_start + rule.window_ms).saturating_sub(now).max(1);
            return RateDecision {
                allowed: false,
                reset_ms,
            };
        }

        bucket.count += 1;
        RateDecision {
            allowed: true,
            reset_ms: 0,
        }
    }

    /// Consume one slot or fail with `RATE_LIMITED` carrying `resetMs`.
    pub fn enforce(&self, identity: Option<&Identity>, fn_name: &str) -> Result<(), FabricError> {
        let decision = self.is_allowed(identity, fn_name);
        if decision.allowed {
            return Ok(());
        }
        RATE_LIMITED_TOTAL.inc();
        warn!(
            fn_name = %fn_name,
            caller = identity.map(|i| i.id.as_str()).unwrap_or(ANONYMOUS),
            reset_ms = decision.reset_ms,
            "Rate limit exceeded"
        );
        Err(FabricError::rate_limited(decision.reset_ms).with_function(fn_name))
    }

    /// Rule lookup: exact capability, then namespace wildcard, then default.
    fn rule_for(&self, fn_name: &str) -> Option<RateRule> {
        if let Some((_, rule)) = self.settings.rules.iter().find(|(name, _)| name == fn_name) {
            return Some(*rule);
        }
        if let Some(namespace) = fn_name.split('.').next() {
            let wildcard = format!("{namespace}.*");
            if let Some((_, rule)) = self
                .settings
                .rules
                .iter()
                .find(|(name, _)| name == &wildcard)
            {
                return Some(*rule);
            }
        }
        self.settings.default_rule
    }

    /// Drop buckets idle for more than two of their windows.
    pub fn cleanup(&self) {
        let now = epoch_ms();
        self.buckets.retain(|_, bucket| {
            // Window length is not stored per bucket; an hour covers the
            // largest configurable unit.
            now.saturating_sub(bucket.window_start) <= 2 * 3_600_000
        });
    }

    /// Number of live buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

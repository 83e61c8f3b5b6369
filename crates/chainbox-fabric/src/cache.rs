//! Fingerprint-keyed result cache with TTL and a bounded entry count.

use dashmap::DashMap;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use chainbox_telemetry::metrics::{CACHE_HITS, CACHE_MISSES};
use chainbox_types::{epoch_ms, fingerprint, FabricError};

use crate::config::CacheSettings;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    expires_at: u64,
    inserted_at: u64,
    hits: u64,
}

/// Process-wide result cache.
///
/// Keys are `<capability>:<fingerprint>` so invalidation can address a whole
/// capability by prefix. When the entry count exceeds the bound, expired
/// entries go first, then the oldest by insertion time.
pub struct ResultCache {
    settings: CacheSettings,
    entries: DashMap<String, CacheEntry>,
}

impl ResultCache {
    pub fn new(settings: CacheSettings) -> Self {
        Self {
            settings,
            entries: DashMap::new(),
        }
    }

    /// Whether a call under this name participates in caching: either the
    /// name carries the configured suffix or an explicit per-capability
    /// entry exists.
    pub fn is_cacheable(&self, fn_name: &str) -> bool {
        if fn_name.ends_with(&self.settings.suffix) && fn_name.len() > self.settings.suffix.len() {
            return true;
        }
        self.settings
            .per_capability
            .iter()
            .any(|(name, _)| name == fn_name)
    }

    /// Fetch a non-expired entry, bumping its hit count.
    pub fn get(&self, fn_name: &str, input: &Value) -> Option<Value> {
        let key = cache_key(fn_name, input);
        let now = epoch_ms();

        let mut expired = false;
        let mut found = None;
        if let Some(mut entry) = self.entries.get_mut(&key) {
            if entry.expires_at > now {
                entry.hits += 1;
                found = Some(entry.value.clone());
            } else {
                expired = true;
            }
        }
        if expired {
            self.entries.remove(&key);
        }

        match found {
            Some(value) => {
                CACHE_HITS.inc();
                debug!(fn_name = %fn_name, "Result cache hit");
                Some(value)
            }
            None => {
                CACHE_MISSES.inc();
                None
            }
        }
    }

    /// Store a result under the capability's TTL, evicting as needed.
    pub fn set(&self, fn_name: &str, input: &Value, value: Value) {
        let ttl = self
            .settings
            .per_capability
            .iter()
            .find(|(name, _)| name == fn_name)
            .and_then(|(_, ttl)| *ttl)
            .unwrap_or(self.settings.default_ttl_ms);

        let now = epoch_ms();
        let key = cache_key(fn_name, input);
        self.entries.insert(
            key,
            CacheEntry {
                value,
                expires_at: now + ttl,
                inserted_at: now,
                hits: 0,
            },
        );

        if self.entries.len() > self.settings.max_size {
            self.evict(now);
        }
    }

    /// Hit count for one entry, if present.
    pub fn hits(&self, fn_name: &str, input: &Value) -> Option<u64> {
        self.entries.get(&cache_key(fn_name, input)).map(|e| e.hits)
    }

    /// Remove the entry for one exact invocation.
    pub fn invalidate(&self, fn_name: &str, input: &Value) -> bool {
        self.entries.remove(&cache_key(fn_name, input)).is_some()
    }

    /// Remove every entry for one capability.
    pub fn invalidate_capability(&self, fn_name: &str) -> usize {
        let prefix = format!("{fn_name}:");
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(&prefix));
        before - self.entries.len()
    }

    /// Remove every entry whose capability name matches a pattern.
    pub fn invalidate_pattern(&self, pattern: &str) -> Result<usize, FabricError> {
        let regex = Regex::new(pattern)
            .map_err(|e| FabricError::internal(format!("invalid cache pattern: {e}")))?;
        let before = self.entries.len();
        self.entries.retain(|key, _| {
            let name = key.rsplit_once(':').map(|(n, _)| n).unwrap_or(key);
            !regex.is_match(name)
        });
        Ok(before - self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict(&self, now: u64) {
        self.entries.retain(|_, entry| entry.expires_at > now);

        while self.entries.len() > self.settings.max_size {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|e| e.value().inserted_at)
                .map(|e| e.key().clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }
}

fn cache_key(fn_name: &str, input: &Value) -> String {
    format!("{fn_name}:{}", fingerprint(fn_name, input))
}

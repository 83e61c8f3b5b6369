//! Capability name resolution and code-source caching.
//!
//! Dotted names (`User.Create`) map to path segments under a configured
//! root. Resolution order: explicit in-process registrations first, then a
//! bytecode module file on disk. The first successful resolution is memoised
//! for the life of the process; changing the root clears the memo.

use std::collections::BTreeSet;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use chainbox_types::FabricError;

use crate::context::Context;

/// Future returned by a native handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, FabricError>> + Send>>;

/// A native capability handler: an async function over the invocation
/// context.
pub type NativeHandler = Arc<dyn Fn(Context) -> HandlerFuture + Send + Sync>;

/// Admission metadata attached at registration time.
#[derive(Debug, Clone, Default)]
pub struct CapabilityMeta {
    /// Roles admitted to this capability. `None` admits everyone.
    pub allow: Option<BTreeSet<String>>,
}

impl CapabilityMeta {
    /// Restrict the capability to the given roles.
    pub fn allow_roles<I, S>(roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allow: Some(roles.into_iter().map(Into::into).collect()),
        }
    }
}

/// How a resolved capability executes.
#[derive(Clone)]
pub enum SourceKind {
    /// In-process async function.
    Native(NativeHandler),
    /// Bytecode module executed by the configured runtime.
    Bytecode(Arc<Vec<u8>>),
}

impl std::fmt::Debug for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::Native(_) => f.write_str("Native"),
            SourceKind::Bytecode(bytes) => write!(f, "Bytecode({} bytes)", bytes.len()),
        }
    }
}

/// A resolved capability: its execution form plus admission metadata.
#[derive(Debug, Clone)]
pub struct CapabilitySource {
    pub kind: SourceKind,
    pub allow: Option<BTreeSet<String>>,
}

/// Outcome of resolving one (possibly suffixed) capability name.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub source: CapabilitySource,
    /// Name after stripping the cache suffix.
    pub canonical_name: String,
    /// True when the name carried the cache suffix.
    pub cache_enabled: bool,
}

/// Name-to-source resolver with process-wide memoisation.
pub struct Registry {
    root: RwLock<Option<PathBuf>>,
    explicit: RwLock<std::collections::HashMap<String, CapabilitySource>>,
    memo: DashMap<String, CapabilitySource>,
    cache_suffix: String,
}

impl Registry {
    pub fn new(root: Option<PathBuf>, cache_suffix: impl Into<String>) -> Self {
        Self {
            root: RwLock::new(root),
            explicit: RwLock::new(std::collections::HashMap::new()),
            memo: DashMap::new(),
            cache_suffix: cache_suffix.into(),
        }
    }

    /// Register a native handler. Overrides any filesystem lookup for the
    /// same name.
    pub fn register(&self, name: impl Into<String>, handler: NativeHandler, meta: CapabilityMeta) {
        let name = name.into();
        debug!(fn_name = %name, "Registering native capability");
        self.memo.remove(&name);
        self.explicit.write().insert(
            name,
            CapabilitySource {
                kind: SourceKind::Native(handler),
                allow: meta.allow,
            },
        );
    }

    /// Point filesystem resolution at a new root, clearing the memo.
    pub fn set_root(&self, dir: impl Into<PathBuf>) {
        *self.root.write() = Some(dir.into());
        self.memo.clear();
    }

    /// Resolve a capability name to its source.
    ///
    /// A name ending in the cache suffix falls back to the bare name and
    /// marks the call cacheable.
    pub fn resolve(&self, name: &str) -> Result<Resolution, FabricError> {
        let (canonical, cache_enabled) = match name.strip_suffix(&self.cache_suffix) {
            Some(bare) if !bare.is_empty() => (bare.to_string(), true),
            _ => (name.to_string(), false),
        };

        validate_name(&canonical)?;

        if let Some(hit) = self.memo.get(&canonical) {
            return Ok(Resolution {
                source: hit.clone(),
                canonical_name: canonical,
                cache_enabled,
            });
        }

        let source = self
            .lookup(&canonical)
            .ok_or_else(|| FabricError::not_found(name))?;
        self.memo.insert(canonical.clone(), source.clone());

        Ok(Resolution {
            source,
            canonical_name: canonical,
            cache_enabled,
        })
    }

    fn lookup(&self, canonical: &str) -> Option<CapabilitySource> {
        if let Some(source) = self.explicit.read().get(canonical) {
            return Some(source.clone());
        }

        let root = self.root.read().clone()?;
        let mut path = root;
        for segment in canonical.split('.') {
            path.push(segment);
        }
        path.set_extension("wasm");

        // Resolution is rare and memoised; a blocking read here is fine.
        match std::fs::read(&path) {
            Ok(bytes) => {
                debug!(fn_name = %canonical, path = %path.display(), "Resolved bytecode capability");
                Some(CapabilitySource {
                    kind: SourceKind::Bytecode(Arc::new(bytes)),
                    allow: None,
                })
            }
            Err(_) => None,
        }
    }
}

fn validate_name(name: &str) -> Result<(), FabricError> {
    if name.is_empty() {
        return Err(FabricError::not_found(name));
    }
    for segment in name.split('.') {
        if segment.is_empty() || segment == ".." || segment.contains(['/', '\\']) {
            return Err(FabricError::not_found(name));
        }
    }
    Ok(())
}

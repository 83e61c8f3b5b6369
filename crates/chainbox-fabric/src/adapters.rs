//! External I/O adapters available to handlers, and the database contract.
//!
//! The fabric never bundles concrete client libraries. Host applications
//! register adapters at startup; handlers retrieve them by name through the
//! context. Anything not registered is unreachable from handler code.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use chainbox_types::{FabricError, Identity};

/// Named registry of host-provided I/O clients.
///
/// Entries are type-erased; retrieval downcasts back to the concrete type.
#[derive(Default)]
pub struct AdapterRegistry {
    entries: DashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under a name, replacing any previous entry.
    pub fn register<T: Send + Sync + 'static>(&self, name: impl Into<String>, adapter: Arc<T>) {
        self.entries.insert(name.into(), adapter);
    }

    /// Retrieve an adapter by name and concrete type.
    ///
    /// Fails with `ADAPTER_NOT_FOUND` when the name is unknown or registered
    /// under a different type.
    pub fn get<T: Send + Sync + 'static>(&self, name: &str) -> Result<Arc<T>, FabricError> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| FabricError::adapter_not_found(name))?;
        entry
            .clone()
            .downcast::<T>()
            .map_err(|_| FabricError::adapter_not_found(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered adapter names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

/// Contract for the database integration.
///
/// The fabric forwards the caller's identity so the underlying store can
/// apply row-level authorization; a handle obtained without an identity acts
/// as the service principal.
pub trait DatabaseAdapter: Send + Sync {
    /// Produce a handle scoped to one caller.
    fn scoped(&self, identity: Option<&Identity>) -> Arc<dyn DatabaseHandle>;
}

/// A scoped database session.
#[async_trait]
pub trait DatabaseHandle: Send + Sync {
    /// Run one statement with JSON-encoded parameters.
    async fn query(&self, statement: &str, params: Value) -> Result<Value, FabricError>;
}

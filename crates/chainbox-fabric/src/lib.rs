//! # Chainbox Execution Fabric
//!
//! Exposes backend logic as named, transport-agnostic capabilities. A call
//! enters the [`executor::Executor`], which resolves identity, applies gate
//! checks (depth, budget, rate, tenant, policy), consults the result cache,
//! asks the [`planner::Planner`] where to run, and dispatches either to an
//! in-process handler or to a peer node through the signed
//! [`mesh::MeshClient`]. Every path converges on a single outcome tag, an
//! audit entry, and a trace tree.
//!
//! The whole fabric is an injected [`fabric::Fabric`] value constructed once
//! per process; tests build fresh instances without shared state.

pub mod adapters;
pub mod ambient;
pub mod auth;
pub mod bytecode;
pub mod cache;
pub mod circuit;
pub mod config;
pub mod context;
pub mod executor;
pub mod fabric;
pub mod mesh;
pub mod planner;
pub mod policy;
pub mod rate_limit;
pub mod registry;
pub mod storage;
pub mod tenant;
pub mod trace;

pub use adapters::{AdapterRegistry, DatabaseAdapter, DatabaseHandle};
pub use auth::Authenticator;
pub use bytecode::{BytecodeHost, BytecodeRuntime};
pub use cache::ResultCache;
pub use circuit::{CircuitBreaker, CircuitState};
pub use config::{Environment, FabricConfig};
pub use context::Context;
pub use executor::{ExecuteOptions, ExecutionResult, Executor, ParallelCall};
pub use fabric::Fabric;
pub use mesh::MeshClient;
pub use planner::{Plan, Planner};
pub use policy::Policy;
pub use rate_limit::RateLimiter;
pub use registry::{CapabilityMeta, CapabilitySource, NativeHandler, Registry, SourceKind};
pub use storage::{BlobStore, KvStore};
pub use tenant::{TenantConfig, TenantManager};
pub use trace::TraceBuilder;

/// Register a native handler from an async closure without spelling out the
/// boxing.
///
/// ```ignore
/// fabric.registry.register(
///     "Math.Add",
///     chainbox_fabric::handler(|ctx| async move {
///         let a = ctx.input()["a"].as_i64().unwrap_or(0);
///         let b = ctx.input()["b"].as_i64().unwrap_or(0);
///         Ok(serde_json::json!({ "value": a + b }))
///     }),
///     Default::default(),
/// );
/// ```
pub fn handler<F, Fut>(f: F) -> NativeHandler
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<serde_json::Value, chainbox_types::FabricError>>
        + Send
        + 'static,
{
    std::sync::Arc::new(move |ctx| -> registry::HandlerFuture { Box::pin(f(ctx)) })
}

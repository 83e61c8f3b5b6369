//! The injected fabric value wiring every component together.
//!
//! One `Fabric` is constructed per process (or per test) and shared behind
//! an `Arc`. Nothing in the crate is a global singleton, so tests build
//! fresh instances without shared state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use chainbox_telemetry::AuditLog;
use chainbox_types::{FabricError, RequestSigner};

use crate::adapters::{AdapterRegistry, DatabaseAdapter};
use crate::auth::Authenticator;
use crate::bytecode::{BytecodeHost, BytecodeRuntime};
use crate::cache::ResultCache;
use crate::circuit::CircuitBreaker;
use crate::config::FabricConfig;
use crate::context::Context;
use crate::executor::Executor;
use crate::mesh::MeshClient;
use crate::planner::Planner;
use crate::rate_limit::RateLimiter;
use crate::registry::{HandlerFuture, Registry};
use crate::storage::{BlobStore, KvStore};
use crate::tenant::TenantManager;

/// Process-wide execution fabric.
pub struct Fabric {
    config: FabricConfig,
    pub registry: Registry,
    pub authenticator: Authenticator,
    pub rate_limiter: RateLimiter,
    pub tenants: TenantManager,
    pub cache: ResultCache,
    pub signer: Arc<RequestSigner>,
    pub planner: Arc<Planner>,
    pub breaker: Arc<CircuitBreaker>,
    pub mesh: MeshClient,
    pub adapters: AdapterRegistry,
    pub kv: KvStore,
    pub blob: BlobStore,
    pub audit: AuditLog,
    database: RwLock<Option<Arc<dyn DatabaseAdapter>>>,
    bytecode: RwLock<Option<Arc<dyn BytecodeRuntime>>>,
    mesh_node: AtomicBool,
}

impl Fabric {
    /// Build a fabric from validated configuration.
    pub fn new(config: FabricConfig) -> Result<Arc<Self>, FabricError> {
        config
            .validate()
            .map_err(|e| FabricError::internal(e.to_string()))?;

        let signer = Arc::new(RequestSigner::new(
            config.mesh.secret.as_ref().map(|s| s.as_bytes().to_vec()),
            config.mesh.signature_ttl_ms,
        ));
        let planner = Arc::new(Planner::new(&config.mesh));
        let breaker = Arc::new(CircuitBreaker::new(config.circuit.clone()));
        let mesh = MeshClient::new(
            &config.mesh,
            Arc::clone(&signer),
            Arc::clone(&breaker),
            Arc::clone(&planner),
        )?;

        Ok(Arc::new(Self {
            registry: Registry::new(config.registry_root.clone(), config.cache.suffix.clone()),
            authenticator: Authenticator::new(&config.auth),
            rate_limiter: RateLimiter::new(config.rate.clone()),
            tenants: TenantManager::new(config.tenants.clone()),
            cache: ResultCache::new(config.cache.clone()),
            signer,
            planner,
            breaker,
            mesh,
            adapters: AdapterRegistry::new(),
            kv: KvStore::new(&config.storage_dir),
            blob: BlobStore::new(&config.storage_dir),
            audit: AuditLog::new(config.audit.clone()),
            database: RwLock::new(None),
            bytecode: RwLock::new(None),
            mesh_node: AtomicBool::new(false),
            config,
        }))
    }

    /// Build a fabric with default configuration; for tests and demos.
    pub fn for_testing() -> Arc<Self> {
        // Defaults always validate.
        match Self::new(FabricConfig::default()) {
            Ok(fabric) => fabric,
            Err(e) => unreachable!("default config must build: {e}"),
        }
    }

    pub fn config(&self) -> &FabricConfig {
        &self.config
    }

    /// The executor bound to this fabric.
    pub fn executor(self: &Arc<Self>) -> Executor {
        Executor::new(Arc::clone(self))
    }

    /// Mark this process as a mesh node: nested invocations plan locally
    /// and never re-forward.
    pub fn mark_mesh_node(&self) {
        self.mesh_node.store(true, Ordering::SeqCst);
    }

    pub fn is_mesh_node(&self) -> bool {
        self.mesh_node.load(Ordering::SeqCst)
    }

    /// Install the database integration.
    pub fn set_database(&self, adapter: Arc<dyn DatabaseAdapter>) {
        *self.database.write() = Some(adapter);
    }

    pub fn database(&self) -> Option<Arc<dyn DatabaseAdapter>> {
        self.database.read().clone()
    }

    /// Install the bytecode engine.
    pub fn set_bytecode_runtime(&self, runtime: Arc<dyn BytecodeRuntime>) {
        *self.bytecode.write() = Some(runtime);
    }

    pub fn bytecode_runtime(&self) -> Option<Arc<dyn BytecodeRuntime>> {
        self.bytecode.read().clone()
    }

    /// Execute a bytecode module with the invocation context as its host.
    pub(crate) fn run_bytecode(&self, module: Arc<Vec<u8>>, ctx: Context) -> HandlerFuture {
        let runtime = self.bytecode_runtime();
        Box::pin(async move {
            let Some(runtime) = runtime else {
                return Err(FabricError::execution(
                    "bytecode capability resolved but no runtime is configured",
                ));
            };
            let input = serde_json::to_vec(ctx.input())
                .map_err(|e| FabricError::internal(format!("unserializable input: {e}")))?;
            let host: Arc<dyn BytecodeHost> = Arc::new(ctx);
            let output = runtime.run(&module, &input, host).await?;
            serde_json::from_slice(&output)
                .map_err(|e| FabricError::execution(format!("bytecode returned invalid JSON: {e}")))
        })
    }
}

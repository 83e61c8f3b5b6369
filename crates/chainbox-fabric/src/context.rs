//! Per-invocation capability surface handlers program against.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use chainbox_types::{ExecutionFrame, FabricError, Identity, TraceFrame};

use crate::adapters::DatabaseHandle;
use crate::bytecode::BytecodeHost;
use crate::executor::{ExecuteOptions, ParallelCall};
use crate::fabric::Fabric;
use crate::storage::{BlobStore, KvStore};
use crate::trace::TraceBuilder;

/// Everything a handler may touch during one invocation.
///
/// Recursive calls go through [`Context::call`] so depth, deadline, and the
/// trace tree stay intact; external I/O goes through [`Context::adapter`].
/// Ambient outbound HTTP is denied for the duration of the handler.
#[derive(Clone)]
pub struct Context {
    fabric: Arc<Fabric>,
    input: Value,
    identity: Option<Identity>,
    frame: ExecutionFrame,
    trace: Arc<TraceBuilder>,
    trace_id: String,
}

impl Context {
    pub(crate) fn new(
        fabric: Arc<Fabric>,
        input: Value,
        identity: Option<Identity>,
        frame: ExecutionFrame,
        trace: Arc<TraceBuilder>,
        trace_id: String,
    ) -> Self {
        Self {
            fabric,
            input,
            identity,
            frame,
            trace,
            trace_id,
        }
    }

    /// The invocation payload.
    pub fn input(&self) -> &Value {
        &self.input
    }

    /// Caller identity, if the call was authenticated.
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// The budget frame for this invocation.
    pub fn frame(&self) -> ExecutionFrame {
        self.frame
    }

    /// Snapshot of the current trace subtree, for diagnostics.
    pub fn get_trace(&self) -> TraceFrame {
        self.trace.finalize()
    }

    /// Invoke another capability as a child of this invocation.
    pub async fn call(&self, fn_name: &str, input: Value) -> Result<Value, FabricError> {
        self.call_with_retries(fn_name, input, 0).await
    }

    /// [`Context::call`] with a retry budget.
    pub async fn call_with_retries(
        &self,
        fn_name: &str,
        input: Value,
        retries: u32,
    ) -> Result<Value, FabricError> {
        let result = self
            .fabric
            .executor()
            .execute(
                fn_name,
                input,
                ExecuteOptions {
                    identity: self.identity.clone(),
                    parent_frame: Some(self.frame),
                    parent_trace: Some(Arc::clone(&self.trace)),
                    trace_id: Some(self.trace_id.clone()),
                    retries,
                    ..ExecuteOptions::default()
                },
            )
            .await?;
        Ok(result.value)
    }

    /// Fan out several calls concurrently. `results[i]` corresponds to
    /// `calls[i]` regardless of completion order.
    pub async fn parallel(
        &self,
        calls: Vec<(String, Value)>,
    ) -> Vec<Result<Value, FabricError>> {
        let calls = calls
            .into_iter()
            .map(|(fn_name, input)| ParallelCall { fn_name, input })
            .collect();
        self.fabric
            .executor()
            .execute_parallel(
                calls,
                ExecuteOptions {
                    identity: self.identity.clone(),
                    parent_frame: Some(self.frame),
                    parent_trace: Some(Arc::clone(&self.trace)),
                    trace_id: Some(self.trace_id.clone()),
                    ..ExecuteOptions::default()
                },
            )
            .await
            .into_iter()
            .map(|r| r.map(|res| res.value))
            .collect()
    }

    /// Retrieve a pre-registered external I/O client by name and type.
    pub fn adapter<T: Send + Sync + 'static>(&self, name: &str) -> Result<Arc<T>, FabricError> {
        self.fabric.adapters.get(name)
    }

    /// Database handle scoped to the caller's identity.
    pub fn db(&self) -> Result<Arc<dyn DatabaseHandle>, FabricError> {
        let adapter = self
            .fabric
            .database()
            .ok_or_else(|| FabricError::adapter_not_found("db"))?;
        Ok(adapter.scoped(self.identity.as_ref()))
    }

    /// Namespaced key-value store.
    pub fn kv(&self) -> &KvStore {
        &self.fabric.kv
    }

    /// Namespaced blob store.
    pub fn blob(&self) -> &BlobStore {
        &self.fabric.blob
    }

    /// Read-only view of the configured environment variables.
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.fabric.config().handler_env
    }
}

#[async_trait]
impl BytecodeHost for Context {
    async fn call(&self, fn_name: &str, input: Value) -> Result<Value, FabricError> {
        Context::call(self, fn_name, input).await
    }

    fn log(&self, message: &str) {
        tracing::info!(trace_id = %self.trace_id, "[bytecode] {message}");
    }
}

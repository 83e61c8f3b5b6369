//! Invocation lifecycle orchestration.
//!
//! One `execute` call runs the full pipeline: authenticate at the root,
//! derive the budget frame, enforce rate and tenant gates, check depth,
//! probe the cache, check the budget, plan local-vs-remote, dispatch, and
//! converge every path onto a single outcome tag with an audit entry and a
//! trace frame. A retry wrapper re-runs the pipeline for retryable codes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{join_all, BoxFuture};
use serde_json::Value;
use tracing::{info_span, warn, Instrument};

use chainbox_telemetry::metrics::{
    EXECUTIONS_TOTAL, EXECUTION_DURATION, EXECUTION_OUTCOMES, EXECUTION_RETRIES,
    INVARIANT_VIOLATIONS,
};
use chainbox_telemetry::AuditEntry;
use chainbox_types::{
    epoch_ms, new_trace_id, BatchCall, BatchPayload, CallStatus, CallTarget, ExecutionFrame,
    FabricError, Identity, MeshCallResult, MeshPayload, Outcome, TraceFrame,
};

use crate::ambient;
use crate::config::Environment;
use crate::context::Context;
use crate::fabric::Fabric;
use crate::planner::Plan;
use crate::policy::Policy;
use crate::registry::SourceKind;
use crate::tenant::TenantManager;
use crate::trace::TraceBuilder;

/// Options for one `execute` call.
#[derive(Clone, Default)]
pub struct ExecuteOptions {
    /// Pre-resolved identity; propagated verbatim to nested and remote calls.
    pub identity: Option<Identity>,
    /// Bearer credential, verified at the root when no identity is supplied.
    pub bearer_token: Option<String>,
    /// Parent frame for a nested call; the frame itself for a mesh re-entry.
    pub parent_frame: Option<ExecutionFrame>,
    /// Parent trace node a new child is registered under.
    pub parent_trace: Option<Arc<TraceBuilder>>,
    /// Pre-reserved trace node (parallel fan-out reserves slots in input
    /// order before any call starts).
    pub trace_slot: Option<Arc<TraceBuilder>>,
    pub trace_id: Option<String>,
    /// Skip planning and run in-process.
    pub force_local: bool,
    /// This call arrived over the mesh: adopt the wire frame with a fresh
    /// budget clock and never re-plan.
    pub mesh_entry: bool,
    /// Additional attempts after the first.
    pub retries: u32,
    /// Root budget override in milliseconds.
    pub timeout_ms: Option<u64>,
}

/// Completed invocation.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub value: Value,
    pub outcome: Outcome,
    pub cached: bool,
    /// Trace tree; attached in development and on mesh responses, stripped
    /// from production root results.
    pub trace: Option<TraceFrame>,
    pub trace_id: String,
}

/// One entry in a parallel fan-out.
#[derive(Debug, Clone)]
pub struct ParallelCall {
    pub fn_name: String,
    pub input: Value,
}

/// Executor bound to one fabric.
#[derive(Clone)]
pub struct Executor {
    fabric: Arc<Fabric>,
}

struct AttemptOutput {
    value: Value,
    cached: bool,
}

/// Per-call state threaded through the pipeline.
struct Invocation {
    fabric: Arc<Fabric>,
    fn_name: String,
    input: Value,
    identity: Option<Identity>,
    frame: ExecutionFrame,
    trace: Arc<TraceBuilder>,
    trace_id: String,
    is_root: bool,
    force_local: bool,
    mesh_entry: bool,
}

impl Executor {
    pub fn new(fabric: Arc<Fabric>) -> Self {
        Self { fabric }
    }

    /// Execute one capability. Boxed so handlers can recurse through
    /// [`Context::call`].
    pub fn execute(
        &self,
        fn_name: &str,
        input: Value,
        opts: ExecuteOptions,
    ) -> BoxFuture<'static, Result<ExecutionResult, FabricError>> {
        let fabric = Arc::clone(&self.fabric);
        let fn_name = fn_name.to_string();
        Box::pin(async move { execute_inner(fabric, fn_name, input, opts).await })
    }

    /// Fan out several calls: plan each, batch per remote node, run the
    /// local subset concurrently, and return results in input order. A
    /// failed batch fills its slots with structured errors without aborting
    /// siblings.
    pub async fn execute_parallel(
        &self,
        calls: Vec<ParallelCall>,
        opts: ExecuteOptions,
    ) -> Vec<Result<ExecutionResult, FabricError>> {
        let fabric = Arc::clone(&self.fabric);
        let count = calls.len();
        let trace_id = opts.trace_id.clone().unwrap_or_else(new_trace_id);
        let identity = opts.identity.clone();
        let force_local = opts.force_local || fabric.is_mesh_node();
        let limits = fabric.tenants.effective_limits(identity.as_ref());

        // Reserve trace slots and plan, in input order.
        let mut slots: Vec<Arc<TraceBuilder>> = Vec::with_capacity(count);
        let mut plans: Vec<Plan> = Vec::with_capacity(count);
        for call in &calls {
            let slot = Arc::new(TraceBuilder::new(
                &call.fn_name,
                identity.as_ref().map(|i| i.id.clone()),
            ));
            if let Some(parent) = &opts.parent_trace {
                parent.push_child(Arc::clone(&slot));
            }
            slots.push(slot);
            plans.push(if force_local {
                Plan::Local
            } else {
                fabric.planner.plan(&call.fn_name, limits.node_pool.as_deref())
            });
        }

        // Group remote calls per node; everything else runs in-process.
        let mut groups: HashMap<String, (String, Vec<usize>)> = HashMap::new();
        let mut local_indices: Vec<usize> = Vec::new();
        for (index, plan) in plans.iter().enumerate() {
            match plan {
                Plan::Remote { node_id, url } => {
                    groups
                        .entry(node_id.clone())
                        .or_insert_with(|| (url.clone(), Vec::new()))
                        .1
                        .push(index);
                }
                Plan::Local => local_indices.push(index),
            }
        }

        // One frame per fan-out level: remote batches carry the child frame
        // the local sub-calls would derive.
        let batch_frame = match opts.parent_frame {
            Some(parent) => parent.child(),
            None => ExecutionFrame::root(
                limits
                    .max_call_depth
                    .unwrap_or(fabric.config().max_call_depth),
                opts.timeout_ms
                    .or(limits.timeout_ms)
                    .unwrap_or(fabric.config().default_timeout_ms),
            ),
        };

        type Indexed = Vec<(usize, Result<ExecutionResult, FabricError>)>;
        let mut branches: Vec<BoxFuture<'static, Indexed>> = Vec::new();

        for (node_id, (url, indices)) in groups {
            let fabric = Arc::clone(&fabric);
            let payload = BatchPayload {
                calls: indices
                    .iter()
                    .map(|&i| BatchCall {
                        fn_name: calls[i].fn_name.clone(),
                        input: calls[i].input.clone(),
                    })
                    .collect(),
                identity: identity.clone(),
                frame: batch_frame,
                trace: Vec::new(),
                trace_id: trace_id.clone(),
            };
            let group_slots: Vec<Arc<TraceBuilder>> =
                indices.iter().map(|&i| Arc::clone(&slots[i])).collect();
            let group_fns: Vec<String> =
                indices.iter().map(|&i| calls[i].fn_name.clone()).collect();
            let trace_id = trace_id.clone();

            branches.push(Box::pin(async move {
                for slot in &group_slots {
                    slot.set_target(CallTarget::Remote, Some(node_id.clone()));
                }
                match fabric.mesh.call_batch(&node_id, &url, &payload).await {
                    Ok(results) => indices
                        .iter()
                        .enumerate()
                        .map(|(pos, &index)| {
                            let result = match results.get(pos) {
                                Some(MeshCallResult::Ok(response)) => {
                                    let slot = &group_slots[pos];
                                    if let Some(remote) = response.trace.clone() {
                                        slot.merge_remote(remote);
                                    }
                                    if response.cached {
                                        slot.set_cached();
                                    }
                                    let status = if response.outcome == Outcome::Success {
                                        CallStatus::Success
                                    } else {
                                        CallStatus::Error
                                    };
                                    slot.complete(status, response.outcome);
                                    Ok(ExecutionResult {
                                        value: response.data.clone(),
                                        outcome: response.outcome,
                                        cached: response.cached,
                                        trace: None,
                                        trace_id: trace_id.clone(),
                                    })
                                }
                                Some(MeshCallResult::Err(wire)) => {
                                    let error: FabricError = wire.clone().into();
                                    group_slots[pos]
                                        .complete(CallStatus::Error, error.outcome());
                                    Err(error
                                        .with_function(group_fns[pos].clone())
                                        .with_trace_id(trace_id.clone()))
                                }
                                None => {
                                    let error = FabricError::mesh_failed(
                                        "batch response missing a result slot",
                                    );
                                    group_slots[pos]
                                        .complete(CallStatus::Error, error.outcome());
                                    Err(error)
                                }
                            };
                            (index, result)
                        })
                        .collect(),
                    Err(error) => indices
                        .iter()
                        .enumerate()
                        .map(|(pos, &index)| {
                            group_slots[pos].complete(CallStatus::Error, error.outcome());
                            (
                                index,
                                Err(error
                                    .clone()
                                    .with_function(group_fns[pos].clone())
                                    .with_trace_id(trace_id.clone())),
                            )
                        })
                        .collect(),
                }
            }));
        }

        for index in local_indices {
            let executor = self.clone();
            let ParallelCall { fn_name, input } = calls[index].clone();
            let slot = Arc::clone(&slots[index]);
            let call_opts = ExecuteOptions {
                identity: identity.clone(),
                parent_frame: opts.parent_frame,
                trace_slot: Some(slot),
                trace_id: Some(trace_id.clone()),
                // Already planned local; a second planning pass could
                // disagree and split the grouping.
                force_local: true,
                timeout_ms: opts.timeout_ms,
                ..ExecuteOptions::default()
            };
            branches.push(Box::pin(async move {
                let result = executor.execute(&fn_name, input, call_opts).await;
                vec![(index, result)]
            }));
        }

        let mut results: Vec<Option<Result<ExecutionResult, FabricError>>> =
            (0..count).map(|_| None).collect();
        for branch in join_all(branches).await {
            for (index, result) in branch {
                results[index] = Some(result);
            }
        }

        results
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| {
                    Err(FabricError::internal("parallel slot was never filled"))
                })
            })
            .collect()
    }
}

async fn execute_inner(
    fabric: Arc<Fabric>,
    fn_name: String,
    input: Value,
    opts: ExecuteOptions,
) -> Result<ExecutionResult, FabricError> {
    // 1. Authenticate (root only) and settle the trace id.
    let is_root = opts.parent_frame.is_none();
    let mut identity = opts.identity.clone();
    if identity.is_none() && is_root {
        if let Some(token) = &opts.bearer_token {
            identity = Some(fabric.authenticator.verify(token)?);
        }
    }
    let trace_id = opts.trace_id.clone().unwrap_or_else(new_trace_id);

    // 2. Construct or derive the frame. A mesh re-entry adopts the wire
    //    frame with its budget clock restarted on this host.
    let limits = fabric.tenants.effective_limits(identity.as_ref());
    let frame = match opts.parent_frame {
        Some(wire_frame) if opts.mesh_entry => wire_frame.rehomed(),
        Some(parent) => parent.child(),
        None => ExecutionFrame::root(
            limits
                .max_call_depth
                .unwrap_or(fabric.config().max_call_depth),
            opts.timeout_ms
                .or(limits.timeout_ms)
                .unwrap_or(fabric.config().default_timeout_ms),
        ),
    };

    // 4. Depth gate. A violating invocation terminates before it
    //    contributes a frame to the trace tree, so the tree's depth never
    //    exceeds the configured limit.
    if frame.exceeds_depth() {
        let error = FabricError::depth_exceeded(frame.depth, frame.max_depth);
        if let Some(slot) = &opts.trace_slot {
            // A pre-reserved fan-out slot still needs its terminal state.
            slot.complete(CallStatus::Error, error.outcome());
        }
        return Err(error.with_function(fn_name).with_trace_id(trace_id));
    }

    let trace = match &opts.trace_slot {
        Some(slot) => Arc::clone(slot),
        None => {
            let builder = Arc::new(TraceBuilder::new(
                &fn_name,
                identity.as_ref().map(|i| i.id.clone()),
            ));
            if let Some(parent) = &opts.parent_trace {
                parent.push_child(Arc::clone(&builder));
            }
            builder
        }
    };

    let invocation = Invocation {
        fabric,
        fn_name,
        input,
        identity,
        frame,
        trace,
        trace_id,
        is_root,
        force_local: opts.force_local,
        mesh_entry: opts.mesh_entry,
    };

    // Retry wrapper. Gate rejections and circuit-open results are terminal;
    // everything else may spend the caller's retry budget.
    let attempts = opts.retries.saturating_add(1);
    let mut last_error: Option<FabricError> = None;
    for attempt in 0..attempts {
        if attempt > 0 {
            EXECUTION_RETRIES.inc();
        }
        match invocation.run_attempt().await {
            Ok(result) => return Ok(result),
            Err(error) => {
                let retryable = error.code.is_retryable();
                last_error = Some(error);
                if !retryable {
                    break;
                }
            }
        }
    }
    Err(last_error.unwrap_or_else(|| FabricError::internal("execution produced no result")))
}

impl Invocation {
    /// One pass through the pipeline plus the end/failure hooks.
    async fn run_attempt(&self) -> Result<ExecutionResult, FabricError> {
        let started = Instant::now();
        EXECUTIONS_TOTAL.inc();

        let span = info_span!(
            "execute",
            fn_name = %self.fn_name,
            trace_id = %self.trace_id,
            depth = self.frame.depth,
        );
        let result = self.pipeline().instrument(span).await;

        let duration_ms = started.elapsed().as_millis() as u64;
        self.trace.set_duration(duration_ms);
        let target_label = if self.trace.is_remote() { "remote" } else { "local" };
        EXECUTION_DURATION
            .with_label_values(&[target_label])
            .observe(started.elapsed().as_secs_f64());

        match result {
            Ok(output) => {
                // Every completed frame must carry an outcome; a missing one
                // is itself a logged violation, coerced to FAILURE.
                let outcome = match self.trace.outcome() {
                    Some(outcome) => outcome,
                    None => {
                        INVARIANT_VIOLATIONS.inc();
                        warn!(
                            fn_name = %self.fn_name,
                            trace_id = %self.trace_id,
                            "Invocation completed without an outcome; coercing to FAILURE"
                        );
                        self.trace.complete(CallStatus::Error, Outcome::Failure);
                        Outcome::Failure
                    }
                };
                let label = outcome.to_string();
                EXECUTION_OUTCOMES.with_label_values(&[label.as_str()]).inc();

                if self.is_root {
                    self.fabric.audit.record(self.audit_entry(
                        CallStatus::Success,
                        duration_ms,
                        outcome,
                        None,
                    ));
                    self.fabric
                        .tenants
                        .record_call(self.identity.as_ref(), true);
                }

                let attach_trace = self.mesh_entry
                    || (self.is_root
                        && self.fabric.config().environment == Environment::Development);
                Ok(ExecutionResult {
                    value: output.value,
                    outcome,
                    cached: output.cached,
                    trace: attach_trace.then(|| self.trace.finalize()),
                    trace_id: self.trace_id.clone(),
                })
            }
            Err(mut error) => {
                // Failure hook: normalise, map onto an outcome, re-throw.
                if error.function.is_none() {
                    error.function = Some(self.fn_name.clone());
                }
                if error.trace_id.is_none() {
                    error.trace_id = Some(self.trace_id.clone());
                }
                let outcome = error.outcome();
                self.trace.complete(CallStatus::Error, outcome);
                let label = outcome.to_string();
                EXECUTION_OUTCOMES.with_label_values(&[label.as_str()]).inc();

                if self.is_root {
                    self.fabric.audit.record(self.audit_entry(
                        CallStatus::Error,
                        duration_ms,
                        outcome,
                        Some(error.to_string()),
                    ));
                    self.fabric
                        .tenants
                        .record_call(self.identity.as_ref(), false);
                }

                Err(error)
            }
        }
    }

    /// Steps 3-9 of the lifecycle.
    async fn pipeline(&self) -> Result<AttemptOutput, FabricError> {
        // 3. Root-only admission gates.
        if self.is_root {
            self.fabric
                .rate_limiter
                .enforce(self.identity.as_ref(), &self.fn_name)?;
            self.fabric.tenants.enforce(self.identity.as_ref())?;
        }

        // 5. Cache probe.
        let cacheable = self.fabric.cache.is_cacheable(&self.fn_name);
        if cacheable {
            if let Some(value) = self.fabric.cache.get(&self.fn_name, &self.input) {
                self.trace.set_cached();
                self.trace.complete(CallStatus::Success, Outcome::Success);
                return Ok(AttemptOutput {
                    value,
                    cached: true,
                });
            }
        }

        // 6. Budget gate.
        if self.frame.is_expired() {
            return Err(FabricError::timeout(self.frame.timeout_ms));
        }

        // 7. Plan. Inside a mesh node the plan is always local.
        let plan = if self.force_local || self.fabric.is_mesh_node() {
            Plan::Local
        } else {
            let limits = self.fabric.tenants.effective_limits(self.identity.as_ref());
            self.fabric
                .planner
                .plan(&self.fn_name, limits.node_pool.as_deref())
        };

        match plan {
            // 8. Remote path.
            Plan::Remote { node_id, url } => {
                self.trace
                    .set_target(CallTarget::Remote, Some(node_id.clone()));
                let payload = MeshPayload {
                    fn_name: self.fn_name.clone(),
                    input: self.input.clone(),
                    identity: self.identity.clone(),
                    frame: self.frame,
                    trace: Vec::new(),
                    trace_id: self.trace_id.clone(),
                };
                let response = self.fabric.mesh.call(&node_id, &url, &payload).await?;

                if let Some(remote) = response.trace.clone() {
                    self.trace.merge_remote(remote);
                }
                if response.cached {
                    self.trace.set_cached();
                }
                let status = if response.outcome == Outcome::Success {
                    CallStatus::Success
                } else {
                    CallStatus::Error
                };
                self.trace.complete(status, response.outcome);
                Ok(AttemptOutput {
                    value: response.data,
                    cached: response.cached,
                })
            }
            // 9. Local path.
            Plan::Local => {
                self.trace.set_target(CallTarget::Local, None);
                let resolution = self.fabric.registry.resolve(&self.fn_name)?;
                Policy::enforce(&resolution.source, self.identity.as_ref(), &self.fn_name)?;

                let ctx = Context::new(
                    Arc::clone(&self.fabric),
                    self.input.clone(),
                    self.identity.clone(),
                    self.frame,
                    Arc::clone(&self.trace),
                    self.trace_id.clone(),
                );

                let remaining = self.frame.remaining_ms();
                if remaining == 0 {
                    return Err(FabricError::timeout(self.frame.timeout_ms));
                }

                let handler_future = match resolution.source.kind {
                    SourceKind::Native(handler) => handler(ctx),
                    SourceKind::Bytecode(bytes) => self.fabric.run_bytecode(bytes, ctx),
                };

                let value = tokio::time::timeout(
                    Duration::from_millis(remaining),
                    ambient::with_ambient_deny(handler_future),
                )
                .await
                .map_err(|_| FabricError::timeout(self.frame.timeout_ms))??;

                if cacheable {
                    self.fabric
                        .cache
                        .set(&self.fn_name, &self.input, value.clone());
                }
                self.trace.complete(CallStatus::Success, Outcome::Success);
                Ok(AttemptOutput {
                    value,
                    cached: false,
                })
            }
        }
    }

    fn audit_entry(
        &self,
        status: CallStatus,
        duration_ms: u64,
        outcome: Outcome,
        error: Option<String>,
    ) -> AuditEntry {
        AuditEntry {
            timestamp: epoch_ms(),
            fn_name: self.fn_name.clone(),
            identity: self.identity.as_ref().map(|i| i.id.clone()),
            tenant_id: Some(TenantManager::tenant_id(self.identity.as_ref())),
            status,
            duration_ms,
            error,
            outcome,
            trace_id: self.trace_id.clone(),
            trace: Some(self.trace.finalize()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FabricConfig;
    use crate::handler;
    use crate::rate_limit::RateRule;
    use crate::registry::CapabilityMeta;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn dev_fabric() -> Arc<Fabric> {
        Fabric::for_testing()
    }

    fn register_math(fabric: &Arc<Fabric>) {
        fabric.registry.register(
            "Math.Add",
            handler(|ctx| async move {
                let a = ctx.input()["a"].as_i64().unwrap_or(0);
                let b = ctx.input()["b"].as_i64().unwrap_or(0);
                Ok(json!({ "value": a + b }))
            }),
            CapabilityMeta::default(),
        );
    }

    #[tokio::test]
    async fn test_local_happy_path() {
        let fabric = dev_fabric();
        register_math(&fabric);

        let result = fabric
            .executor()
            .execute("Math.Add", json!({"a": 2, "b": 3}), ExecuteOptions::default())
            .await
            .unwrap();

        assert_eq!(result.value, json!({"value": 5}));
        assert_eq!(result.outcome, Outcome::Success);
        assert!(!result.cached);

        let trace = result.trace.expect("development attaches the trace");
        assert_eq!(trace.fn_name, "Math.Add");
        assert_eq!(trace.target, CallTarget::Local);
        assert_eq!(trace.status, CallStatus::Success);
        assert_eq!(trace.depth(), 1);
        assert!(trace.children.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_capability_maps_to_not_found() {
        let fabric = dev_fabric();
        let err = fabric
            .executor()
            .execute("No.Such", json!({}), ExecuteOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, chainbox_types::ErrorCode::FunctionNotFound);
        assert_eq!(err.outcome(), Outcome::NotFound);
        assert!(err.trace_id.is_some());
    }

    #[tokio::test]
    async fn test_depth_limit_bounds_trace() {
        let mut config = FabricConfig::default();
        config.max_call_depth = 3;
        let fabric = Fabric::new(config).unwrap();

        fabric.registry.register(
            "Recursive",
            handler(|ctx| async move {
                let value = ctx.call("Recursive", json!({})).await?;
                Ok(value)
            }),
            CapabilityMeta::default(),
        );

        let err = fabric
            .executor()
            .execute("Recursive", json!({}), ExecuteOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, chainbox_types::ErrorCode::MaxCallDepthExceeded);

        // The violating call never contributes a frame: the deepest chain is
        // exactly the configured limit.
        let entries = fabric.audit.recent(1);
        let trace = entries[0].trace.as_ref().unwrap();
        assert_eq!(trace.depth(), 3);
    }

    #[tokio::test]
    async fn test_cache_hit_returns_identical_value() {
        let fabric = dev_fabric();
        fabric.registry.register(
            "Price.Get",
            handler(|_ctx| async move { Ok(json!({ "p": epoch_ms() })) }),
            CapabilityMeta::default(),
        );

        let first = fabric
            .executor()
            .execute("Price.Get.Cached", json!({}), ExecuteOptions::default())
            .await
            .unwrap();
        assert!(!first.cached);

        let second = fabric
            .executor()
            .execute("Price.Get.Cached", json!({}), ExecuteOptions::default())
            .await
            .unwrap();
        assert!(second.cached);
        assert_eq!(second.outcome, Outcome::Success);
        assert_eq!(first.value, second.value);
        assert!(second.trace.unwrap().cached);

        // Cache hits still audit: both accepted calls are observable.
        assert_eq!(fabric.audit.len(), 2);
    }

    #[tokio::test]
    async fn test_retry_budget_spent_on_retryable_errors() {
        let fabric = dev_fabric();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        fabric.registry.register(
            "Flaky",
            handler(move |_ctx| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(FabricError::execution("transient"))
                    } else {
                        Ok(json!("ok"))
                    }
                }
            }),
            CapabilityMeta::default(),
        );

        let result = fabric
            .executor()
            .execute(
                "Flaky",
                json!({}),
                ExecuteOptions {
                    retries: 2,
                    ..ExecuteOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(result.value, json!("ok"));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_forbidden_never_consumes_retries() {
        let fabric = dev_fabric();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        fabric.registry.register(
            "Admin.Only",
            handler(move |_ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok(json!("never")) }
            }),
            CapabilityMeta::allow_roles(["admin"]),
        );

        let err = fabric
            .executor()
            .execute(
                "Admin.Only",
                json!({}),
                ExecuteOptions {
                    retries: 5,
                    identity: Some(Identity::new("u-1").with_role("user")),
                    ..ExecuteOptions::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, chainbox_types::ErrorCode::Forbidden);
        assert_eq!(err.outcome(), Outcome::Forbidden);
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_timeout_race_cancels_handler() {
        let fabric = dev_fabric();
        fabric.registry.register(
            "Slow",
            handler(|_ctx| async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(json!("late"))
            }),
            CapabilityMeta::default(),
        );

        let started = Instant::now();
        let err = fabric
            .executor()
            .execute(
                "Slow",
                json!({}),
                ExecuteOptions {
                    timeout_ms: Some(50),
                    ..ExecuteOptions::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, chainbox_types::ErrorCode::ExecutionTimeout);
        assert_eq!(err.outcome(), Outcome::Timeout);
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_nested_calls_share_the_budget() {
        let fabric = dev_fabric();
        fabric.registry.register(
            "Outer",
            handler(|ctx| async move {
                tokio::time::sleep(Duration::from_millis(60)).await;
                ctx.call("Inner", json!({})).await
            }),
            CapabilityMeta::default(),
        );
        fabric.registry.register(
            "Inner",
            handler(|_ctx| async move { Ok(json!("inner")) }),
            CapabilityMeta::default(),
        );

        let err = fabric
            .executor()
            .execute(
                "Outer",
                json!({}),
                ExecuteOptions {
                    timeout_ms: Some(40),
                    ..ExecuteOptions::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, chainbox_types::ErrorCode::ExecutionTimeout);
    }

    #[tokio::test]
    async fn test_parallel_preserves_input_order_with_failure() {
        let fabric = dev_fabric();
        register_math(&fabric);
        fabric.registry.register(
            "Echo",
            handler(|ctx| async move { Ok(ctx.input().clone()) }),
            CapabilityMeta::default(),
        );

        let results = fabric
            .executor()
            .execute_parallel(
                vec![
                    ParallelCall {
                        fn_name: "Math.Add".into(),
                        input: json!({"a": 1, "b": 1}),
                    },
                    ParallelCall {
                        fn_name: "MissingFn".into(),
                        input: json!({}),
                    },
                    ParallelCall {
                        fn_name: "Echo".into(),
                        input: json!("b"),
                    },
                ],
                ExecuteOptions::default(),
            )
            .await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap().value, json!({"value": 2}));
        assert_eq!(
            results[1].as_ref().unwrap_err().code,
            chainbox_types::ErrorCode::FunctionNotFound
        );
        assert_eq!(results[2].as_ref().unwrap().value, json!("b"));
    }

    #[tokio::test]
    async fn test_nested_parallel_from_context() {
        let fabric = dev_fabric();
        register_math(&fabric);
        fabric.registry.register(
            "FanOut",
            handler(|ctx| async move {
                let results = ctx
                    .parallel(vec![
                        ("Math.Add".to_string(), json!({"a": 1, "b": 2})),
                        ("Math.Add".to_string(), json!({"a": 3, "b": 4})),
                    ])
                    .await;
                let mut sums = Vec::new();
                for result in results {
                    sums.push(result?["value"].clone());
                }
                Ok(json!(sums))
            }),
            CapabilityMeta::default(),
        );

        let result = fabric
            .executor()
            .execute("FanOut", json!({}), ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(result.value, json!([3, 7]));

        let trace = result.trace.unwrap();
        assert_eq!(trace.children.len(), 2);
        assert_eq!(trace.children[0].fn_name, "Math.Add");
        assert_eq!(trace.depth(), 2);
    }

    #[tokio::test]
    async fn test_rate_limit_applies_to_root_only() {
        let mut config = FabricConfig::default();
        config.rate.default_rule = Some(RateRule {
            max_requests: 1,
            window_ms: 60_000,
        });
        let fabric = Fabric::new(config).unwrap();

        fabric.registry.register(
            "Chatty",
            handler(|ctx| async move {
                // Nested calls skip the limiter entirely.
                for _ in 0..5 {
                    ctx.call("Quiet", json!({})).await?;
                }
                Ok(json!("done"))
            }),
            CapabilityMeta::default(),
        );
        fabric.registry.register(
            "Quiet",
            handler(|_ctx| async move { Ok(json!(null)) }),
            CapabilityMeta::default(),
        );

        let first = fabric
            .executor()
            .execute("Chatty", json!({}), ExecuteOptions::default())
            .await;
        assert!(first.is_ok());

        let err = fabric
            .executor()
            .execute("Chatty", json!({}), ExecuteOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, chainbox_types::ErrorCode::RateLimited);
        assert!(err.reset_ms().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_production_strips_trace() {
        let mut config = FabricConfig::default();
        config.environment = Environment::Production;
        let fabric = Fabric::new(config).unwrap();
        register_math(&fabric);

        let result = fabric
            .executor()
            .execute("Math.Add", json!({"a": 1, "b": 1}), ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(result.outcome, Outcome::Success);
        assert!(result.trace.is_none());
        // The audit log still holds the full tree.
        assert!(fabric.audit.recent(1)[0].trace.is_some());
    }

    #[tokio::test]
    async fn test_audit_entry_at_root() {
        let fabric = dev_fabric();
        register_math(&fabric);

        fabric
            .executor()
            .execute("Math.Add", json!({"a": 1, "b": 2}), ExecuteOptions::default())
            .await
            .unwrap();

        let entries = fabric.audit.recent(10);
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.fn_name, "Math.Add");
        assert_eq!(entry.status, CallStatus::Success);
        assert_eq!(entry.outcome, Outcome::Success);
        assert!(!entry.trace_id.is_empty());
    }

    #[tokio::test]
    async fn test_bearer_token_resolves_identity() {
        use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};

        let mut config = FabricConfig::default();
        config.auth.secret = Some("exec-test-secret".into());
        let fabric = Fabric::new(config).unwrap();

        fabric.registry.register(
            "WhoAmI",
            handler(|ctx| async move {
                Ok(json!({ "id": ctx.identity().map(|i| i.id.clone()) }))
            }),
            CapabilityMeta::default(),
        );

        let token = encode(
            &Header::new(Algorithm::HS256),
            &json!({"sub": "u-99"}),
            &EncodingKey::from_secret(b"exec-test-secret"),
        )
        .unwrap();

        let result = fabric
            .executor()
            .execute(
                "WhoAmI",
                json!({}),
                ExecuteOptions {
                    bearer_token: Some(token),
                    ..ExecuteOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(result.value, json!({"id": "u-99"}));

        let err = fabric
            .executor()
            .execute(
                "WhoAmI",
                json!({}),
                ExecuteOptions {
                    bearer_token: Some("garbage".into()),
                    ..ExecuteOptions::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, chainbox_types::ErrorCode::Unauthorized);
    }

    #[tokio::test]
    async fn test_ambient_http_denied_inside_handler() {
        let fabric = dev_fabric();
        fabric.registry.register(
            "Sneaky",
            handler(|_ctx| async move {
                match crate::ambient::http_client() {
                    Ok(_) => Ok(json!("leaked")),
                    Err(e) => Err(e),
                }
            }),
            CapabilityMeta::default(),
        );

        let err = fabric
            .executor()
            .execute("Sneaky", json!({}), ExecuteOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, chainbox_types::ErrorCode::Forbidden);
    }

    #[tokio::test]
    async fn test_mesh_entry_adopts_frame_and_attaches_trace() {
        let mut config = FabricConfig::default();
        config.environment = Environment::Production;
        let fabric = Fabric::new(config).unwrap();
        fabric.mark_mesh_node();
        register_math(&fabric);

        // A frame whose remote clock would already be expired locally; the
        // hop reset keeps the budget usable.
        let wire_frame = ExecutionFrame {
            depth: 2,
            max_depth: 8,
            start_time: 1,
            timeout_ms: 5_000,
        };

        let result = fabric
            .executor()
            .execute(
                "Math.Add",
                json!({"a": 4, "b": 4}),
                ExecuteOptions {
                    parent_frame: Some(wire_frame),
                    mesh_entry: true,
                    force_local: true,
                    trace_id: Some("hop-1".into()),
                    ..ExecuteOptions::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(result.value, json!({"value": 8}));
        // Mesh responses always carry the subtree, even in production.
        assert!(result.trace.is_some());
        assert_eq!(result.trace_id, "hop-1");
        // Not a root: no audit entry here; the originating node audits.
        assert!(fabric.audit.is_empty());
    }
}

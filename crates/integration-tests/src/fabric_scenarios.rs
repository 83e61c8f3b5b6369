//! In-process flows across the fabric: context surface, storage, adapters,
//! bytecode seam, tenants, and audit.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use chainbox_fabric::{
    handler, BytecodeHost, BytecodeRuntime, CapabilityMeta, DatabaseAdapter, DatabaseHandle,
    ExecuteOptions, Fabric, FabricConfig,
};
use chainbox_telemetry::AuditLevel;
use chainbox_types::{ErrorCode, FabricError, Identity, Outcome};

fn fabric_with_storage() -> (Arc<Fabric>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = FabricConfig::default();
    config.storage_dir = dir.path().to_path_buf();
    (Fabric::new(config).unwrap(), dir)
}

#[tokio::test]
async fn test_handler_uses_kv_and_blob() {
    let (fabric, _dir) = fabric_with_storage();

    fabric.registry.register(
        "Counter.Bump",
        handler(|ctx| async move {
            let current = ctx
                .kv()
                .get("count")
                .await?
                .and_then(|v| v.as_i64())
                .unwrap_or(0);
            ctx.kv().set("count", &json!(current + 1)).await?;
            ctx.blob().set("last-input", ctx.input().to_string().as_bytes()).await?;
            Ok(json!({ "count": current + 1 }))
        }),
        CapabilityMeta::default(),
    );

    let executor = fabric.executor();
    for expected in 1..=3 {
        let result = executor
            .execute("Counter.Bump", json!({"tick": expected}), ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(result.value["count"], expected);
    }

    assert_eq!(fabric.kv.get("count").await.unwrap().unwrap(), json!(3));
    let last = fabric.blob.get("last-input").await.unwrap().unwrap();
    assert_eq!(
        serde_json::from_slice::<Value>(&last).unwrap(),
        json!({"tick": 3})
    );
}

struct RecordingDb;

struct RecordingHandle {
    caller: Option<String>,
    token: Option<String>,
}

impl DatabaseAdapter for RecordingDb {
    fn scoped(&self, identity: Option<&Identity>) -> Arc<dyn DatabaseHandle> {
        Arc::new(RecordingHandle {
            caller: identity.map(|i| i.id.clone()),
            token: identity.and_then(|i| i.token.clone()),
        })
    }
}

#[async_trait]
impl DatabaseHandle for RecordingHandle {
    async fn query(&self, statement: &str, _params: Value) -> Result<Value, FabricError> {
        Ok(json!({
            "statement": statement,
            "caller": self.caller,
            "token": self.token,
        }))
    }
}

#[tokio::test]
async fn test_db_handle_is_identity_scoped() {
    let fabric = Fabric::for_testing();
    fabric.set_database(Arc::new(RecordingDb));

    fabric.registry.register(
        "Rows.Mine",
        handler(|ctx| async move { ctx.db()?.query("select * from rows", json!([])).await }),
        CapabilityMeta::default(),
    );

    let identity = Identity {
        token: Some("bearer-raw".into()),
        ..Identity::new("u-7")
    };
    let result = fabric
        .executor()
        .execute(
            "Rows.Mine",
            json!({}),
            ExecuteOptions {
                identity: Some(identity),
                ..ExecuteOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(result.value["caller"], "u-7");
    assert_eq!(result.value["token"], "bearer-raw");
}

#[tokio::test]
async fn test_missing_adapter_is_structured() {
    let fabric = Fabric::for_testing();
    fabric.registry.register(
        "Mail.Send",
        handler(|ctx| async move {
            let _mailer: Arc<String> = ctx.adapter("mailer")?;
            Ok(json!("sent"))
        }),
        CapabilityMeta::default(),
    );

    let err = fabric
        .executor()
        .execute("Mail.Send", json!({}), ExecuteOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::AdapterNotFound);
}

/// Toy engine for the bytecode seam: the module bytes name a capability,
/// which the "program" invokes through `host.call` with its input.
struct ForwardingRuntime;

#[async_trait]
impl BytecodeRuntime for ForwardingRuntime {
    async fn run(
        &self,
        module: &[u8],
        input: &[u8],
        host: Arc<dyn BytecodeHost>,
    ) -> Result<Vec<u8>, FabricError> {
        let target = std::str::from_utf8(module)
            .map_err(|_| FabricError::execution("module is not UTF-8"))?
            .trim()
            .to_string();
        let input: Value = serde_json::from_slice(input)
            .map_err(|e| FabricError::execution(format!("bad input: {e}")))?;
        host.log(&format!("forwarding to {target}"));
        let result = host.call(&target, input).await?;
        serde_json::to_vec(&json!({ "forwarded": result }))
            .map_err(|e| FabricError::internal(e.to_string()))
    }
}

#[tokio::test]
async fn test_bytecode_module_resolves_and_runs() {
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(root.path().join("Proxy")).unwrap();
    std::fs::write(root.path().join("Proxy/Add.wasm"), b"Math.Add").unwrap();

    let mut config = FabricConfig::default();
    config.registry_root = Some(root.path().to_path_buf());
    let fabric = Fabric::new(config).unwrap();
    fabric.set_bytecode_runtime(Arc::new(ForwardingRuntime));

    fabric.registry.register(
        "Math.Add",
        handler(|ctx| async move {
            let a = ctx.input()["a"].as_i64().unwrap_or(0);
            let b = ctx.input()["b"].as_i64().unwrap_or(0);
            Ok(json!(a + b))
        }),
        CapabilityMeta::default(),
    );

    let result = fabric
        .executor()
        .execute("Proxy.Add", json!({"a": 20, "b": 22}), ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(result.value, json!({"forwarded": 42}));

    // The host.call shows up as a child of the bytecode invocation.
    let trace = result.trace.unwrap();
    assert_eq!(trace.fn_name, "Proxy.Add");
    assert_eq!(trace.children.len(), 1);
    assert_eq!(trace.children[0].fn_name, "Math.Add");
}

#[tokio::test]
async fn test_bytecode_without_runtime_fails_cleanly() {
    let root = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("Orphan.wasm"), b"whatever").unwrap();

    let mut config = FabricConfig::default();
    config.registry_root = Some(root.path().to_path_buf());
    let fabric = Fabric::new(config).unwrap();

    let err = fabric
        .executor()
        .execute("Orphan", json!({}), ExecuteOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::ExecutionError);
    assert_eq!(err.outcome(), Outcome::Failure);
}

#[tokio::test]
async fn test_tenant_quota_applies_through_executor() {
    let mut config = FabricConfig::default();
    config.tenants = vec![chainbox_fabric::TenantConfig {
        tenant_id: "acme".into(),
        max_calls_per_minute: Some(2),
        max_call_depth: None,
        timeout_ms: None,
        node_pool: None,
        priority: 0,
    }];
    let fabric = Fabric::new(config).unwrap();
    fabric.registry.register(
        "Ping",
        handler(|_ctx| async move { Ok(json!("pong")) }),
        CapabilityMeta::default(),
    );

    let identity = Identity::new("u-1").with_claim("tenant_id", json!("acme"));
    let executor = fabric.executor();
    for _ in 0..2 {
        executor
            .execute(
                "Ping",
                json!({}),
                ExecuteOptions {
                    identity: Some(identity.clone()),
                    ..ExecuteOptions::default()
                },
            )
            .await
            .unwrap();
    }

    let err = executor
        .execute(
            "Ping",
            json!({}),
            ExecuteOptions {
                identity: Some(identity),
                ..ExecuteOptions::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::TenantQuotaExceeded);
    // Completed calls were recorded against the tenant.
    assert_eq!(fabric.tenants.call_counts("acme"), (2, 1));
}

#[tokio::test]
async fn test_audit_errors_level_records_failures_only() {
    let mut config = FabricConfig::default();
    config.audit.level = AuditLevel::Errors;
    let fabric = Fabric::new(config).unwrap();
    fabric.registry.register(
        "Fine",
        handler(|_ctx| async move { Ok(json!("ok")) }),
        CapabilityMeta::default(),
    );

    let executor = fabric.executor();
    executor
        .execute("Fine", json!({}), ExecuteOptions::default())
        .await
        .unwrap();
    let _ = executor
        .execute("Broken.Missing", json!({}), ExecuteOptions::default())
        .await
        .unwrap_err();

    let entries = fabric.audit.recent(10);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].fn_name, "Broken.Missing");
    assert_eq!(entries[0].outcome, Outcome::NotFound);
}

#[tokio::test]
async fn test_handler_env_is_the_configured_view() {
    let mut config = FabricConfig::default();
    config
        .handler_env
        .insert("REGION".to_string(), "eu-west-1".to_string());
    let fabric = Fabric::new(config).unwrap();

    fabric.registry.register(
        "Env.Read",
        handler(|ctx| async move {
            Ok(json!({
                "region": ctx.env().get("REGION"),
                "secret": ctx.env().get("CHAINBOX_MESH_SECRET"),
            }))
        }),
        CapabilityMeta::default(),
    );

    let result = fabric
        .executor()
        .execute("Env.Read", json!({}), ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(result.value["region"], "eu-west-1");
    assert!(result.value["secret"].is_null());
}

#[tokio::test]
async fn test_cache_invalidation_forces_recompute() {
    let fabric = Fabric::for_testing();
    fabric.registry.register(
        "Now",
        handler(|_ctx| async move { Ok(json!(chainbox_types::epoch_ms())) }),
        CapabilityMeta::default(),
    );

    let executor = fabric.executor();
    let first = executor
        .execute("Now.Cached", json!({}), ExecuteOptions::default())
        .await
        .unwrap();
    let second = executor
        .execute("Now.Cached", json!({}), ExecuteOptions::default())
        .await
        .unwrap();
    assert!(second.cached);
    assert_eq!(first.value, second.value);

    fabric.cache.invalidate_capability("Now.Cached");
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let third = executor
        .execute("Now.Cached", json!({}), ExecuteOptions::default())
        .await
        .unwrap();
    assert!(!third.cached);
    assert_ne!(first.value, third.value);
}

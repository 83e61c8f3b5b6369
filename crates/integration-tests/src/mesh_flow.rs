//! Two-node mesh flows over real HTTP.

use std::sync::Arc;

use serde_json::json;

use chainbox_fabric::{CircuitState, ExecuteOptions, Fabric, FabricConfig, ParallelCall};
use chainbox_types::{CallTarget, ErrorCode, Identity, Outcome};

use crate::harness::{caller_config, node_fabric, spawn_node};

const MESH_SECRET: &str = "integration-mesh-secret";

#[tokio::test]
async fn test_remote_route_executes_on_peer() {
    let mut node_config = FabricConfig::default();
    node_config.mesh.secret = Some(MESH_SECRET.into());
    let node = spawn_node(node_fabric(node_config)).await;

    let caller = Fabric::new(caller_config(&node.url, Some(MESH_SECRET))).unwrap();
    let result = caller
        .executor()
        .execute("Heavy.Crunch", json!({"n": 10}), ExecuteOptions::default())
        .await
        .unwrap();

    assert_eq!(result.value["crunched"], 20);
    assert_eq!(result.outcome, Outcome::Success);

    // The caller's trace shows a remote frame with the peer's subtree
    // grafted underneath it.
    let trace = result.trace.expect("dev mode attaches trace");
    assert_eq!(trace.target, CallTarget::Remote);
    assert_eq!(trace.node_id.as_deref(), Some("compute"));
    assert_eq!(trace.children.len(), 1);
    assert_eq!(trace.children[0].fn_name, "Heavy.Step");
}

#[tokio::test]
async fn test_identity_propagates_across_hop() {
    let node = spawn_node(node_fabric(FabricConfig::default())).await;

    let mut config = caller_config(&node.url, None);
    config.mesh.routes =
        chainbox_fabric::config::parse_route_list("Who.*:compute").unwrap();
    let caller = Fabric::new(config).unwrap();

    let result = caller
        .executor()
        .execute(
            "Who.Is",
            json!({}),
            ExecuteOptions {
                identity: Some(Identity::new("u-42").with_role("admin")),
                ..ExecuteOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(result.value, json!({"id": "u-42", "role": "admin"}));
}

#[tokio::test]
async fn test_wrong_secret_rejected_without_retry() {
    let mut node_config = FabricConfig::default();
    node_config.mesh.secret = Some(MESH_SECRET.into());
    let node = spawn_node(node_fabric(node_config)).await;

    let caller = Fabric::new(caller_config(&node.url, Some("some-other-secret"))).unwrap();
    let err = caller
        .executor()
        .execute("Heavy.Crunch", json!({"n": 1}), ExecuteOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.code, ErrorCode::InvalidSignature);
    // The node answered; its health and circuit are untouched.
    assert_eq!(caller.breaker.state("compute"), CircuitState::Closed);
}

#[tokio::test]
async fn test_circuit_opens_and_recovers() {
    // Reserve a port, then drop the listener so connections are refused.
    let parked = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = parked.local_addr().unwrap();
    drop(parked);

    let mut config = caller_config(&format!("http://{addr}"), None);
    config.circuit.failure_threshold = 2;
    config.circuit.open_timeout_ms = 200;
    config.circuit.success_threshold = 2;
    config.mesh.request_timeout_ms = 1_000;
    let caller = Fabric::new(config).unwrap();

    // Two transport failures open the circuit.
    for _ in 0..2 {
        let err = caller
            .executor()
            .execute("Heavy.Crunch", json!({"n": 1}), ExecuteOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::MeshCallFailed);
    }
    assert_eq!(caller.breaker.state("compute"), CircuitState::Open);

    // Third call fails locally, without a network attempt.
    let started = std::time::Instant::now();
    let err = caller
        .executor()
        .execute("Heavy.Crunch", json!({"n": 1}), ExecuteOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::CircuitOpen);
    assert_eq!(err.outcome(), Outcome::CircuitOpen);
    assert!(started.elapsed() < std::time::Duration::from_millis(100));

    // Bring a real node up on the reserved port, wait out the open window,
    // and let the probes close the circuit again.
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    let node_fabric = node_fabric(FabricConfig::default());
    node_fabric.mark_mesh_node();
    let state = Arc::new(chainbox_node::NodeState::new(Arc::clone(&node_fabric)));
    let router = chainbox_node::build_router(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    tokio::time::sleep(std::time::Duration::from_millis(250)).await;

    for _ in 0..2 {
        let result = caller
            .executor()
            .execute("Heavy.Crunch", json!({"n": 3}), ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(result.value["crunched"], 6);
    }
    assert_eq!(caller.breaker.state("compute"), CircuitState::Closed);
}

#[tokio::test]
async fn test_parallel_batches_per_node_and_preserves_order() {
    let mut node_config = FabricConfig::default();
    node_config.mesh.secret = Some(MESH_SECRET.into());
    let node = spawn_node(node_fabric(node_config)).await;

    let caller = Fabric::new(caller_config(&node.url, Some(MESH_SECRET))).unwrap();
    // A local capability alongside the remote ones.
    caller.registry.register(
        "Local.Echo",
        chainbox_fabric::handler(|ctx| async move { Ok(ctx.input().clone()) }),
        chainbox_fabric::CapabilityMeta::default(),
    );

    let results = caller
        .executor()
        .execute_parallel(
            vec![
                ParallelCall {
                    fn_name: "Heavy.Step".into(),
                    input: json!({"n": 1}),
                },
                ParallelCall {
                    fn_name: "Local.Echo".into(),
                    input: json!("here"),
                },
                ParallelCall {
                    fn_name: "Heavy.Missing".into(),
                    input: json!({}),
                },
                ParallelCall {
                    fn_name: "Heavy.Step".into(),
                    input: json!({"n": 4}),
                },
            ],
            ExecuteOptions::default(),
        )
        .await;

    assert_eq!(results.len(), 4);
    assert_eq!(results[0].as_ref().unwrap().value, json!({"stepped": 1}));
    assert_eq!(results[1].as_ref().unwrap().value, json!("here"));
    let missing = results[2].as_ref().unwrap_err();
    assert_eq!(missing.code, ErrorCode::FunctionNotFound);
    assert_eq!(missing.function.as_deref(), Some("Heavy.Missing"));
    assert_eq!(results[3].as_ref().unwrap().value, json!({"stepped": 4}));
}

#[tokio::test]
async fn test_batch_transport_failure_fills_all_slots() {
    // Route to a port nobody serves.
    let parked = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = parked.local_addr().unwrap();
    drop(parked);

    let caller = Fabric::new(caller_config(&format!("http://{addr}"), None)).unwrap();
    let results = caller
        .executor()
        .execute_parallel(
            vec![
                ParallelCall {
                    fn_name: "Heavy.Step".into(),
                    input: json!({"n": 1}),
                },
                ParallelCall {
                    fn_name: "Heavy.Step".into(),
                    input: json!({"n": 2}),
                },
            ],
            ExecuteOptions::default(),
        )
        .await;

    assert_eq!(results.len(), 2);
    for result in &results {
        assert_eq!(result.as_ref().unwrap_err().code, ErrorCode::MeshCallFailed);
    }
}

#[tokio::test]
async fn test_tenant_node_pool_routes_without_explicit_route() {
    let node = spawn_node(node_fabric(FabricConfig::default())).await;

    let mut config = FabricConfig::default();
    config.mesh.nodes =
        chainbox_fabric::config::parse_node_list(&format!("compute-a={}", node.url)).unwrap();
    // No routes at all; only the tenant pool sends traffic out.
    config.tenants = vec![chainbox_fabric::TenantConfig {
        tenant_id: "acme".into(),
        max_calls_per_minute: None,
        max_call_depth: None,
        timeout_ms: None,
        node_pool: Some("compute".into()),
        priority: 0,
    }];
    let caller = Fabric::new(config).unwrap();

    let identity = Identity::new("u-1").with_claim("tenant_id", json!("acme"));
    let result = caller
        .executor()
        .execute(
            "Who.Is",
            json!({}),
            ExecuteOptions {
                identity: Some(identity),
                ..ExecuteOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(result.value["id"], "u-1");

    let trace = result.trace.unwrap();
    assert_eq!(trace.target, CallTarget::Remote);
    assert_eq!(trace.node_id.as_deref(), Some("compute-a"));
}

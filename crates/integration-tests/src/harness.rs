//! Test harness: spawn real mesh nodes on ephemeral ports.

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::json;

use chainbox_fabric::{handler, CapabilityMeta, Fabric, FabricConfig};
use chainbox_node::{build_router, NodeState};

/// A mesh node served from a background task.
pub struct TestNode {
    pub fabric: Arc<Fabric>,
    pub addr: SocketAddr,
    pub url: String,
}

/// Serve a node router for the given fabric on an ephemeral port.
pub async fn spawn_node(fabric: Arc<Fabric>) -> TestNode {
    fabric.mark_mesh_node();
    let state = Arc::new(NodeState::new(Arc::clone(&fabric)));
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test node");
    let addr = listener.local_addr().expect("local addr");

    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    TestNode {
        fabric,
        url: format!("http://{addr}"),
        addr,
    }
}

/// A node fabric with the standard test capabilities registered.
pub fn node_fabric(mut config: FabricConfig) -> Arc<Fabric> {
    config.node_id = "compute".to_string();
    let fabric = Fabric::new(config).expect("node fabric");

    fabric.registry.register(
        "Heavy.Crunch",
        handler(|ctx| async move {
            let n = ctx.input()["n"].as_i64().unwrap_or(0);
            let detail = ctx.call("Heavy.Step", json!({ "n": n })).await?;
            Ok(json!({ "crunched": n * 2, "detail": detail }))
        }),
        CapabilityMeta::default(),
    );
    fabric.registry.register(
        "Heavy.Step",
        handler(|ctx| async move {
            Ok(json!({ "stepped": ctx.input()["n"].as_i64().unwrap_or(0) }))
        }),
        CapabilityMeta::default(),
    );
    fabric.registry.register(
        "Who.Is",
        handler(|ctx| async move {
            Ok(json!({
                "id": ctx.identity().map(|i| i.id.clone()),
                "role": ctx.identity().and_then(|i| i.role.clone()),
            }))
        }),
        CapabilityMeta::default(),
    );

    fabric
}

/// Caller-side config pointing a `Heavy.*` route at one node url.
pub fn caller_config(node_url: &str, secret: Option<&str>) -> FabricConfig {
    let mut config = FabricConfig::default();
    config.mesh.nodes = chainbox_fabric::config::parse_node_list(&format!("compute={node_url}"))
        .expect("node list");
    config.mesh.routes =
        chainbox_fabric::config::parse_route_list("Heavy.*:compute").expect("route list");
    config.mesh.secret = secret.map(String::from);
    config.mesh.max_retries = 0;
    config
}

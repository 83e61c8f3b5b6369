//! Per-capability routing: dotted-glob patterns to mesh nodes with health
//! tracking.

use std::collections::HashMap;

use parking_lot::RwLock;
use rand::Rng;
use regex::Regex;
use tracing::{debug, warn};

use chainbox_types::epoch_ms;

use crate::config::{MeshSettings, NodeEntry, RouteEntry};

/// One peer node known to the planner.
#[derive(Debug, Clone)]
pub struct MeshNode {
    pub id: String,
    pub url: String,
    pub healthy: bool,
    pub last_check: u64,
}

#[derive(Debug)]
struct Route {
    pattern: String,
    regex: Regex,
    node_ids: Vec<String>,
}

/// Routing decision for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    Local,
    Remote { node_id: String, url: String },
}

/// Pattern-to-node router.
///
/// Route patterns are dotted globs: `.` is literal, `*` matches any run of
/// characters. Order matters; the first matching route wins. Node health is
/// flipped by the mesh transport, and unhealthy nodes are excluded from
/// selection until a circuit-breaker probe succeeds against them again.
pub struct Planner {
    nodes: RwLock<HashMap<String, MeshNode>>,
    routes: Vec<Route>,
}

impl Planner {
    pub fn new(settings: &MeshSettings) -> Self {
        Self::from_parts(&settings.nodes, &settings.routes)
    }

    pub fn from_parts(nodes: &[NodeEntry], routes: &[RouteEntry]) -> Self {
        let now = epoch_ms();
        let node_map = nodes
            .iter()
            .map(|n| {
                (
                    n.id.clone(),
                    MeshNode {
                        id: n.id.clone(),
                        url: n.url.clone(),
                        healthy: true,
                        last_check: now,
                    },
                )
            })
            .collect();

        let compiled = routes
            .iter()
            .filter_map(|r| match compile_glob(&r.pattern) {
                Ok(regex) => Some(Route {
                    pattern: r.pattern.clone(),
                    regex,
                    node_ids: r.node_ids.clone(),
                }),
                Err(e) => {
                    warn!(pattern = %r.pattern, error = %e, "Dropping uncompilable route");
                    None
                }
            })
            .collect();

        Self {
            nodes: RwLock::new(node_map),
            routes: compiled,
        }
    }

    /// Decide where one invocation runs.
    ///
    /// A tenant node-pool prefix, when present, restricts selection to
    /// healthy nodes whose id starts with the prefix and bypasses routes.
    pub fn plan(&self, fn_name: &str, node_pool: Option<&str>) -> Plan {
        let nodes = self.nodes.read();

        if let Some(prefix) = node_pool {
            let pool: Vec<&MeshNode> = nodes
                .values()
                .filter(|n| n.healthy && n.id.starts_with(prefix))
                .collect();
            if let Some(node) = pick(&pool) {
                debug!(fn_name = %fn_name, node_id = %node.id, pool = %prefix, "Planned via tenant pool");
                return Plan::Remote {
                    node_id: node.id.clone(),
                    url: node.url.clone(),
                };
            }
            return Plan::Local;
        }

        for route in &self.routes {
            if route.regex.is_match(fn_name) {
                let known: Vec<&MeshNode> = route
                    .node_ids
                    .iter()
                    .filter_map(|id| nodes.get(id))
                    .collect();
                let healthy: Vec<&MeshNode> =
                    known.iter().copied().filter(|n| n.healthy).collect();

                // Prefer healthy candidates. With none left, keep routing
                // into the set and let the circuit breaker gate admission;
                // its probes are what re-admit a node.
                let selected = pick(&healthy).or_else(|| pick(&known));
                if let Some(node) = selected {
                    debug!(fn_name = %fn_name, node_id = %node.id, pattern = %route.pattern, "Planned via route");
                    return Plan::Remote {
                        node_id: node.id.clone(),
                        url: node.url.clone(),
                    };
                }
                // First matching route owns the name; later routes are not
                // consulted.
                return Plan::Local;
            }
        }

        Plan::Local
    }

    /// Mark a node unhealthy after a transport failure.
    pub fn mark_unhealthy(&self, node_id: &str) {
        let mut nodes = self.nodes.write();
        if let Some(node) = nodes.get_mut(node_id) {
            if node.healthy {
                warn!(node_id = %node_id, "Marking mesh node unhealthy");
            }
            node.healthy = false;
            node.last_check = epoch_ms();
        }
    }

    /// Mark a node healthy after a successful call.
    pub fn mark_healthy(&self, node_id: &str) {
        let mut nodes = self.nodes.write();
        if let Some(node) = nodes.get_mut(node_id) {
            if !node.healthy {
                debug!(node_id = %node_id, "Mesh node healthy again");
            }
            node.healthy = true;
            node.last_check = epoch_ms();
        }
    }

    /// Snapshot of all known nodes.
    pub fn nodes(&self) -> Vec<MeshNode> {
        self.nodes.read().values().cloned().collect()
    }

    /// URL of a node, if known.
    pub fn node_url(&self, node_id: &str) -> Option<String> {
        self.nodes.read().get(node_id).map(|n| n.url.clone())
    }
}

fn pick<'a>(candidates: &[&'a MeshNode]) -> Option<&'a MeshNode> {
    match candidates.len() {
        0 => None,
        1 => Some(candidates[0]),
        n => Some(candidates[rand::thread_rng().gen_range(0..n)]),
    }
}

/// Compile a dotted glob into an anchored regex: `.` literal, `*` ↔ `.*`.
fn compile_glob(pattern: &str) -> Result<Regex, regex::Error> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for c in pattern.chars() {
        match c {
            '*' => expr.push_str(".*"),
            c => expr.push_str(&regex::escape(&c.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr)
}

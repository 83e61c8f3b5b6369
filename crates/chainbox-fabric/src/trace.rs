//! Mutable trace-tree assembly for one invocation tree.
//!
//! Each invocation owns one [`TraceBuilder`]; a nested call registers its
//! builder with the parent at start, so children appear in start order no
//! matter how they interleave. Completion fills in the terminal fields, and
//! [`TraceBuilder::finalize`] snapshots the tree into the pure-data
//! [`TraceFrame`] that travels on the wire and into the audit log.

use parking_lot::Mutex;
use std::sync::Arc;

use chainbox_types::{CallStatus, CallTarget, Outcome, TraceFrame};

#[derive(Debug)]
struct BuilderData {
    target: CallTarget,
    node_id: Option<String>,
    duration_ms: Option<u64>,
    status: CallStatus,
    outcome: Option<Outcome>,
    cached: bool,
    /// Children executed on a remote node, grafted from its response.
    remote_children: Vec<TraceFrame>,
}

/// Builder for one frame of the trace tree.
pub struct TraceBuilder {
    fn_name: String,
    identity: Option<String>,
    data: Mutex<BuilderData>,
    children: Mutex<Vec<Arc<TraceBuilder>>>,
}

impl TraceBuilder {
    pub fn new(fn_name: &str, identity: Option<String>) -> Self {
        Self {
            fn_name: fn_name.to_string(),
            identity,
            data: Mutex::new(BuilderData {
                target: CallTarget::Local,
                node_id: None,
                duration_ms: None,
                status: CallStatus::Error,
                outcome: None,
                cached: false,
                remote_children: Vec::new(),
            }),
            children: Mutex::new(Vec::new()),
        }
    }

    /// Register a child at the moment its sub-call starts.
    pub fn push_child(&self, child: Arc<TraceBuilder>) {
        self.children.lock().push(child);
    }

    /// Record where this invocation runs.
    pub fn set_target(&self, target: CallTarget, node_id: Option<String>) {
        let mut data = self.data.lock();
        data.target = target;
        data.node_id = node_id;
    }

    /// Record the terminal status and outcome.
    pub fn complete(&self, status: CallStatus, outcome: Outcome) {
        let mut data = self.data.lock();
        data.status = status;
        data.outcome = Some(outcome);
    }

    pub fn set_cached(&self) {
        self.data.lock().cached = true;
    }

    pub fn set_duration(&self, duration_ms: u64) {
        self.data.lock().duration_ms = Some(duration_ms);
    }

    /// Graft the subtree a remote node returned for this invocation.
    pub fn merge_remote(&self, remote_root: TraceFrame) {
        let mut data = self.data.lock();
        data.remote_children = remote_root.children;
        if remote_root.cached {
            data.cached = true;
        }
    }

    /// The outcome recorded so far, if any.
    pub fn outcome(&self) -> Option<Outcome> {
        self.data.lock().outcome
    }

    pub fn is_remote(&self) -> bool {
        self.data.lock().target == CallTarget::Remote
    }

    /// Snapshot this builder and every descendant into wire data.
    pub fn finalize(&self) -> TraceFrame {
        let data = self.data.lock();
        let mut children: Vec<TraceFrame> =
            self.children.lock().iter().map(|c| c.finalize()).collect();
        children.extend(data.remote_children.iter().cloned());

        TraceFrame {
            fn_name: self.fn_name.clone(),
            identity: self.identity.clone(),
            target: data.target,
            node_id: data.node_id.clone(),
            duration_ms: data.duration_ms,
            status: data.status,
            outcome: data.outcome,
            cached: data.cached,
            children,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_children_in_start_order() {
        let root = Arc::new(TraceBuilder::new("Root", None));
        let first = Arc::new(TraceBuilder::new("First", None));
        let second = Arc::new(TraceBuilder::new("Second", None));

        root.push_child(Arc::clone(&first));
        root.push_child(Arc::clone(&second));

        // Completion order is reversed; start order must win.
        second.complete(CallStatus::Success, Outcome::Success);
        first.complete(CallStatus::Success, Outcome::Success);
        root.complete(CallStatus::Success, Outcome::Success);

        let frame = root.finalize();
        let names: Vec<&str> = frame.children.iter().map(|c| c.fn_name.as_str()).collect();
        assert_eq!(names, vec!["First", "Second"]);
    }

    #[test]
    fn test_remote_merge_grafts_children() {
        let builder = TraceBuilder::new("Heavy.Crunch", Some("u-1".into()));
        builder.set_target(CallTarget::Remote, Some("compute".into()));
        builder.merge_remote(TraceFrame {
            fn_name: "Heavy.Crunch".into(),
            identity: None,
            target: CallTarget::Local,
            node_id: None,
            duration_ms: Some(9),
            status: CallStatus::Success,
            outcome: Some(Outcome::Success),
            cached: false,
            children: vec![TraceFrame {
                fn_name: "Heavy.Step".into(),
                identity: None,
                target: CallTarget::Local,
                node_id: None,
                duration_ms: Some(2),
                status: CallStatus::Success,
                outcome: Some(Outcome::Success),
                cached: false,
                children: Vec::new(),
            }],
        });
        builder.complete(CallStatus::Success, Outcome::Success);

        let frame = builder.finalize();
        assert_eq!(frame.node_id.as_deref(), Some("compute"));
        assert_eq!(frame.children.len(), 1);
        assert_eq!(frame.children[0].fn_name, "Heavy.Step");
    }

    #[test]
    fn test_outcome_visible_before_finalize() {
        let builder = TraceBuilder::new("Fn", None);
        assert!(builder.outcome().is_none());
        builder.complete(CallStatus::Error, Outcome::Timeout);
        assert_eq!(builder.outcome(), Some(Outcome::Timeout));
    }
}

//! JSON payloads exchanged between mesh nodes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::WireError;
use crate::frame::ExecutionFrame;
use crate::identity::Identity;
use crate::trace::{Outcome, TraceFrame};

/// A single capability invocation forwarded to a peer node.
///
/// `trace` is retained for wire compatibility but always empty on requests:
/// the receiving node builds its own subtree and returns it in the response,
/// where the caller grafts it into the local tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshPayload {
    #[serde(rename = "fn")]
    pub fn_name: String,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,
    pub frame: ExecutionFrame,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trace: Vec<TraceFrame>,
    pub trace_id: String,
}

/// One call inside a batch request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchCall {
    #[serde(rename = "fn")]
    pub fn_name: String,
    pub input: Value,
}

/// N capability invocations shipped in a single request. Transport-atomic;
/// executionally per-call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchPayload {
    pub calls: Vec<BatchCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,
    pub frame: ExecutionFrame,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trace: Vec<TraceFrame>,
    pub trace_id: String,
}

/// Successful response for a single mesh invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshResponse {
    /// The handler's return value.
    pub data: Value,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cached: bool,
    /// Subtree executed on the remote node, grafted by the caller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<TraceFrame>,
}

/// Per-call result slot in a batch response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MeshCallResult {
    Ok(MeshResponse),
    Err(WireError),
}

impl MeshCallResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, MeshCallResult::Ok(_))
    }
}

/// Batch response body: `results[i]` corresponds to `calls[i]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResponse {
    pub results: Vec<MeshCallResult>,
}

//! Outcome tags and the trace tree recorded for every invocation.

use serde::{Deserialize, Serialize};

/// Closed set of terminal states for an invocation.
///
/// Clients branch on this tag, never on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Success,
    Failure,
    Timeout,
    CircuitOpen,
    Forbidden,
    NotFound,
    Aborted,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Outcome::Success => "SUCCESS",
            Outcome::Failure => "FAILURE",
            Outcome::Timeout => "TIMEOUT",
            Outcome::CircuitOpen => "CIRCUIT_OPEN",
            Outcome::Forbidden => "FORBIDDEN",
            Outcome::NotFound => "NOT_FOUND",
            Outcome::Aborted => "ABORTED",
        };
        write!(f, "{s}")
    }
}

/// Where an invocation ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallTarget {
    Local,
    Remote,
}

/// Coarse success/error flag on a completed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Success,
    Error,
}

/// One node of the trace tree assembled during a root invocation.
///
/// Children appear in the order their sub-calls started, not the order they
/// completed. A completed frame always carries an outcome; the executor
/// coerces a missing one to `FAILURE` and counts the violation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceFrame {
    #[serde(rename = "fn")]
    pub fn_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    pub target: CallTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub status: CallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cached: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TraceFrame>,
}

impl TraceFrame {
    /// Height of this subtree: 1 for a leaf.
    pub fn depth(&self) -> usize {
        1 + self
            .children
            .iter()
            .map(TraceFrame::depth)
            .max()
            .unwrap_or(0)
    }

    /// Total number of frames in this subtree, including self.
    pub fn frame_count(&self) -> usize {
        1 + self
            .children
            .iter()
            .map(TraceFrame::frame_count)
            .sum::<usize>()
    }
}

//! Closed error-code set and the structured error carried across the fabric.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::trace::Outcome;

/// Wire-level error codes. The set is closed: new failure modes map onto an
/// existing code rather than growing the enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ExecutionError,
    ExecutionTimeout,
    MaxCallDepthExceeded,
    Forbidden,
    FunctionNotFound,
    CircuitOpen,
    MeshCallFailed,
    InvalidSignature,
    AdapterNotFound,
    RateLimited,
    TenantQuotaExceeded,
    Unauthorized,
    PayloadTooLarge,
    /// Reserved. Treated exactly like `Forbidden`; never constructed.
    AccessDenied,
    InternalError,
}

impl ErrorCode {
    /// Outcome tag an error with this code terminates the invocation with.
    pub fn outcome(&self) -> Outcome {
        match self {
            ErrorCode::ExecutionTimeout => Outcome::Timeout,
            ErrorCode::CircuitOpen => Outcome::CircuitOpen,
            ErrorCode::Forbidden | ErrorCode::AccessDenied => Outcome::Forbidden,
            ErrorCode::FunctionNotFound => Outcome::NotFound,
            _ => Outcome::Failure,
        }
    }

    /// Whether the executor may spend a retry on this code.
    ///
    /// Gate rejections are terminal for the whole call; a circuit-open result
    /// is terminal within the call that observed it.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ErrorCode::Forbidden
                | ErrorCode::AccessDenied
                | ErrorCode::MaxCallDepthExceeded
                | ErrorCode::RateLimited
                | ErrorCode::TenantQuotaExceeded
                | ErrorCode::Unauthorized
                | ErrorCode::CircuitOpen
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::ExecutionError => "EXECUTION_ERROR",
            ErrorCode::ExecutionTimeout => "EXECUTION_TIMEOUT",
            ErrorCode::MaxCallDepthExceeded => "MAX_CALL_DEPTH_EXCEEDED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::FunctionNotFound => "FUNCTION_NOT_FOUND",
            ErrorCode::CircuitOpen => "CIRCUIT_OPEN",
            ErrorCode::MeshCallFailed => "MESH_CALL_FAILED",
            ErrorCode::InvalidSignature => "INVALID_SIGNATURE",
            ErrorCode::AdapterNotFound => "ADAPTER_NOT_FOUND",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::TenantQuotaExceeded => "TENANT_QUOTA_EXCEEDED",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ErrorCode::AccessDenied => "ACCESS_DENIED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        };
        write!(f, "{s}")
    }
}

/// Structured error raised anywhere on the critical path.
///
/// Carries enough context (`function`, `trace_id`, `meta`) for the audit log
/// and for clients that branch on `code`.
#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct FabricError {
    pub code: ErrorCode,
    pub message: String,
    pub function: Option<String>,
    pub trace_id: Option<String>,
    pub meta: Option<Value>,
}

impl FabricError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            function: None,
            trace_id: None,
            meta: None,
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ExecutionError, message)
    }

    pub fn timeout(timeout_ms: u64) -> Self {
        Self::new(
            ErrorCode::ExecutionTimeout,
            format!("execution exceeded the {timeout_ms}ms budget"),
        )
    }

    pub fn depth_exceeded(depth: u32, max_depth: u32) -> Self {
        Self::new(
            ErrorCode::MaxCallDepthExceeded,
            format!("call depth {depth} exceeds the limit of {max_depth}"),
        )
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Forbidden, message)
    }

    pub fn not_found(fn_name: &str) -> Self {
        Self::new(
            ErrorCode::FunctionNotFound,
            format!("capability not found: {fn_name}"),
        )
        .with_function(fn_name)
    }

    pub fn circuit_open(node_id: &str) -> Self {
        Self::new(
            ErrorCode::CircuitOpen,
            format!("circuit open for node {node_id}"),
        )
    }

    pub fn mesh_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::MeshCallFailed, message)
    }

    pub fn invalid_signature(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidSignature, message)
    }

    pub fn adapter_not_found(name: &str) -> Self {
        Self::new(
            ErrorCode::AdapterNotFound,
            format!("adapter not registered: {name}"),
        )
    }

    pub fn rate_limited(reset_ms: u64) -> Self {
        Self::new(ErrorCode::RateLimited, "rate limit exceeded")
            .with_meta(serde_json::json!({ "resetMs": reset_ms }))
    }

    pub fn tenant_quota(tenant_id: &str) -> Self {
        Self::new(
            ErrorCode::TenantQuotaExceeded,
            format!("tenant {tenant_id} exhausted its per-minute quota"),
        )
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub fn payload_too_large(limit: usize) -> Self {
        Self::new(
            ErrorCode::PayloadTooLarge,
            format!("request body exceeds the {limit} byte limit"),
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn with_function(mut self, fn_name: impl Into<String>) -> Self {
        self.function = Some(fn_name.into());
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Outcome tag this error maps to.
    pub fn outcome(&self) -> Outcome {
        self.code.outcome()
    }

    /// `resetMs` meta, when the error carries one.
    pub fn reset_ms(&self) -> Option<u64> {
        self.meta
            .as_ref()
            .and_then(|m| m.get("resetMs"))
            .and_then(Value::as_u64)
    }
}

/// Error envelope as it travels over the mesh wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub error: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl From<FabricError> for WireError {
    fn from(e: FabricError) -> Self {
        Self {
            error: e.code,
            message: e.message,
            function: e.function,
            meta: e.meta,
        }
    }
}

impl From<WireError> for FabricError {
    fn from(w: WireError) -> Self {
        Self {
            code: w.error,
            message: w.message,
            function: w.function,
            trace_id: None,
            meta: w.meta,
        }
    }
}

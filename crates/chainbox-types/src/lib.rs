//! # Chainbox Shared Types
//!
//! Data model shared by every Chainbox crate: caller identity, execution
//! frames, trace trees, the closed error-code and outcome sets, the mesh wire
//! payloads, and request signing.
//!
//! These types are pure data plus small, dependency-free logic. Anything with
//! a lifecycle (registries, caches, breakers) lives in `chainbox-fabric`.

pub mod canonical;
pub mod error;
pub mod frame;
pub mod identity;
pub mod signer;
pub mod trace;
pub mod wire;

pub use canonical::{canonical_json, fingerprint};
pub use error::{ErrorCode, FabricError, WireError};
pub use frame::{epoch_ms, ExecutionFrame};
pub use identity::Identity;
pub use signer::{RequestSigner, SignatureParts, SIGNATURE_HEADER, TIMESTAMP_HEADER};
pub use trace::{CallStatus, CallTarget, Outcome, TraceFrame};
pub use wire::{BatchCall, BatchPayload, BatchResponse, MeshCallResult, MeshPayload, MeshResponse};

/// Generate a fresh trace identifier for a root invocation.
pub fn new_trace_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

//! # Chainbox Mesh Node
//!
//! HTTP server that accepts signed capability execution requests from peer
//! nodes and re-enters the executor locally:
//!
//! - `GET /health`: liveness plus uptime and request counters
//! - `POST /execute`: one [`chainbox_types::MeshPayload`]
//! - `POST /execute/batch`: N calls, executed concurrently, results in order
//! - `GET /metrics`: Prometheus text format
//!
//! Request bodies are capped; signature headers are verified against the
//! parsed payload before anything executes. The process marks itself a mesh
//! node so nested invocations plan locally instead of re-forwarding.

pub mod server;

pub use server::{build_router, serve, NodeState};

use thiserror::Error;

/// Node startup and serving errors.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("invalid bind address {addr}: {reason}")]
    InvalidAddr { addr: String, reason: String },

    #[error("server io error: {0}")]
    Io(#[from] std::io::Error),
}

//! # Integration Tests Crate
//!
//! Cross-component scenarios for the Chainbox execution fabric.
//!
//! ## Structure
//!
//! ```text
//! integration-tests/
//! └── src/
//!     ├── lib.rs              # This file, plus the test node harness
//!     ├── fabric_scenarios.rs # In-process flows: context surface, tenants,
//!     │                       # bytecode seam, storage, audit
//!     └── mesh_flow.rs        # Two-node flows over real HTTP: routing,
//!                             # signing, circuit breaker, batch fan-out
//! ```
//!
//! The mesh tests bind real listeners on `127.0.0.1:0` and serve the node
//! router in a background task, so the wire format, signature headers, and
//! breaker bookkeeping are exercised end to end without any mocking.

#![allow(dead_code)]

pub mod harness;

#[cfg(test)]
mod fabric_scenarios;
#[cfg(test)]
mod mesh_flow;

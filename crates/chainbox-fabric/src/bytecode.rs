//! Runtime seam for bytecode capabilities.
//!
//! The registry resolves `.wasm` modules to raw bytes; an engine is injected
//! at startup rather than bundled. The module ABI the runtime must uphold:
//!
//! - export `alloc(size: i32) -> ptr` for the host to place the input
//! - export `main(ptr: i32, len: i32) -> ptr` returning a UTF-8 JSON result
//!   (length-prefixed at the returned pointer)
//! - import `host.call(name, input)` to invoke other capabilities
//! - import `host.log(ptr, len)` for diagnostics
//!
//! Host imports are served by a [`BytecodeHost`], which the executor backs
//! with the invocation's context, so bytecode sees exactly the capability
//! surface a native handler sees and nothing else.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use chainbox_types::FabricError;

/// Engine that executes a bytecode module against host imports.
#[async_trait]
pub trait BytecodeRuntime: Send + Sync {
    /// Run a module: `input` is the serialised invocation payload, the
    /// return value is the module's UTF-8 JSON result.
    async fn run(
        &self,
        module: &[u8],
        input: &[u8],
        host: Arc<dyn BytecodeHost>,
    ) -> Result<Vec<u8>, FabricError>;
}

/// Host surface importable from bytecode.
#[async_trait]
pub trait BytecodeHost: Send + Sync {
    /// `host.call`: invoke another capability under the current identity
    /// and frame.
    async fn call(&self, fn_name: &str, input: Value) -> Result<Value, FabricError>;

    /// `host.log`: emit one diagnostic line.
    fn log(&self, message: &str);
}

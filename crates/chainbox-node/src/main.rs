//! Mesh node entry point.
//!
//! Loads configuration from `CHAINBOX_*` environment variables, initialises
//! telemetry, builds the fabric, and serves the mesh endpoints until a
//! termination signal.

use std::process::ExitCode;

use tracing::{error, info};

use chainbox_fabric::{Fabric, FabricConfig};
use chainbox_telemetry::{init_telemetry, TelemetryConfig};

#[tokio::main]
async fn main() -> ExitCode {
    let telemetry_config = TelemetryConfig::from_env();
    let _telemetry = match init_telemetry(&telemetry_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("failed to initialise telemetry: {e}");
            return ExitCode::FAILURE;
        }
    };

    let config = match FabricConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    info!(
        node_id = %config.node_id,
        bind_addr = %config.bind_addr,
        environment = ?config.environment,
        peers = config.mesh.nodes.len(),
        routes = config.mesh.routes.len(),
        "Starting Chainbox mesh node"
    );

    let fabric = match Fabric::new(config) {
        Ok(fabric) => fabric,
        Err(e) => {
            error!(error = %e, "Failed to build fabric");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = chainbox_node::serve(fabric).await {
        error!(error = %e, "Mesh node exited with error");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

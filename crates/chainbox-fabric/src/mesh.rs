//! Signed node-to-node RPC with pooling, retries, and breaker integration.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use chainbox_telemetry::metrics::{MESH_CALLS, MESH_RETRIES};
use chainbox_types::{
    BatchPayload, BatchResponse, FabricError, MeshCallResult, MeshPayload, MeshResponse,
    RequestSigner, WireError, SIGNATURE_HEADER, TIMESTAMP_HEADER,
};

use crate::circuit::CircuitBreaker;
use crate::config::MeshSettings;
use crate::planner::Planner;

/// What one HTTP attempt produced.
enum AttemptOutcome {
    /// 2xx with a decodable body.
    Success(Value),
    /// The node answered with a structured error envelope. The transport
    /// worked; the error belongs to the call, not the node.
    AppError(FabricError),
}

/// Pooled HTTP client for mesh dispatch.
///
/// Every dispatch consults the circuit breaker first and reports the result
/// back to both the breaker and the planner's health table. Transport faults
/// and undecodable error statuses retry with exponential backoff; remaining
/// retries are abandoned if the circuit opens mid-sequence.
pub struct MeshClient {
    http: reqwest::Client,
    signer: Arc<RequestSigner>,
    breaker: Arc<CircuitBreaker>,
    planner: Arc<Planner>,
    max_retries: u32,
    backoff_base: Duration,
}

impl MeshClient {
    pub fn new(
        settings: &MeshSettings,
        signer: Arc<RequestSigner>,
        breaker: Arc<CircuitBreaker>,
        planner: Arc<Planner>,
    ) -> Result<Self, FabricError> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(settings.connections)
            .timeout(Duration::from_millis(settings.request_timeout_ms))
            .connect_timeout(Duration::from_millis(settings.request_timeout_ms.min(5_000)))
            .build()
            .map_err(|e| FabricError::internal(format!("failed to build mesh client: {e}")))?;

        Ok(Self {
            http,
            signer,
            breaker,
            planner,
            max_retries: settings.max_retries,
            backoff_base: Duration::from_millis(settings.backoff_base_ms),
        })
    }

    /// Dispatch one invocation to a peer node's `/execute`.
    pub async fn call(
        &self,
        node_id: &str,
        node_url: &str,
        payload: &MeshPayload,
    ) -> Result<MeshResponse, FabricError> {
        let body = serde_json::to_value(payload)
            .map_err(|e| FabricError::internal(format!("unserializable mesh payload: {e}")))?;
        let raw = self
            .dispatch(node_id, &format!("{node_url}/execute"), &body)
            .await?;
        serde_json::from_value(raw)
            .map_err(|e| FabricError::mesh_failed(format!("undecodable mesh response: {e}")))
    }

    /// Dispatch a batch to a peer node's `/execute/batch`. Transport-atomic:
    /// one fault fails the whole batch.
    pub async fn call_batch(
        &self,
        node_id: &str,
        node_url: &str,
        payload: &BatchPayload,
    ) -> Result<Vec<MeshCallResult>, FabricError> {
        let body = serde_json::to_value(payload)
            .map_err(|e| FabricError::internal(format!("unserializable batch payload: {e}")))?;
        let raw = self
            .dispatch(node_id, &format!("{node_url}/execute/batch"), &body)
            .await?;
        let decoded: BatchResponse = serde_json::from_value(raw)
            .map_err(|e| FabricError::mesh_failed(format!("undecodable batch response: {e}")))?;
        Ok(decoded.results)
    }

    async fn dispatch(
        &self,
        node_id: &str,
        endpoint: &str,
        body: &Value,
    ) -> Result<Value, FabricError> {
        if let Err(e) = self.breaker.check(node_id) {
            MESH_CALLS.with_label_values(&["circuit_open"]).inc();
            return Err(e);
        }

        let mut attempt: u32 = 0;
        loop {
            match self.attempt_once(endpoint, body).await {
                Ok(AttemptOutcome::Success(value)) => {
                    self.breaker.record_success(node_id);
                    self.planner.mark_healthy(node_id);
                    MESH_CALLS.with_label_values(&["success"]).inc();
                    return Ok(value);
                }
                Ok(AttemptOutcome::AppError(error)) => {
                    // The node is alive and answered; its health is intact.
                    self.breaker.record_success(node_id);
                    self.planner.mark_healthy(node_id);
                    MESH_CALLS.with_label_values(&["app_error"]).inc();
                    return Err(error);
                }
                Err(transport) => {
                    warn!(
                        node_id = %node_id,
                        endpoint = %endpoint,
                        attempt = attempt,
                        error = %transport,
                        "Mesh attempt failed"
                    );
                    self.breaker.record_failure(node_id);
                    self.planner.mark_unhealthy(node_id);

                    if attempt >= self.max_retries {
                        MESH_CALLS.with_label_values(&["failure"]).inc();
                        return Err(FabricError::mesh_failed(format!(
                            "node {node_id} unreachable after {} attempts: {transport}",
                            attempt + 1
                        )));
                    }
                    if !self.breaker.is_allowed(node_id) {
                        MESH_CALLS.with_label_values(&["circuit_open"]).inc();
                        return Err(FabricError::circuit_open(node_id));
                    }

                    let backoff = self.backoff_base * 2u32.saturating_pow(attempt);
                    debug!(node_id = %node_id, backoff_ms = backoff.as_millis() as u64, "Backing off before retry");
                    MESH_RETRIES.inc();
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn attempt_once(&self, endpoint: &str, body: &Value) -> Result<AttemptOutcome, String> {
        let mut request = self.http.post(endpoint).json(body);
        if let Some(parts) = self.signer.sign(body) {
            request = request
                .header(SIGNATURE_HEADER, parts.signature)
                .header(TIMESTAMP_HEADER, parts.timestamp.to_string());
        }

        let response = request
            .send()
            .await
            .map_err(|e| format!("transport error: {e}"))?;
        let status = response.status();

        if status.is_success() {
            return response
                .json::<Value>()
                .await
                .map(AttemptOutcome::Success)
                .map_err(|e| format!("invalid response body: {e}"));
        }

        let text = response.text().await.unwrap_or_default();
        match serde_json::from_str::<WireError>(&text) {
            Ok(wire) => Ok(AttemptOutcome::AppError(wire.into())),
            Err(_) => {
                let snippet: String = text.chars().take(200).collect();
                Err(format!("HTTP {status}: {snippet}"))
            }
        }
    }
}

//! Router, handlers, and graceful shutdown for the mesh node server.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::future::join_all;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use chainbox_fabric::{ExecuteOptions, Fabric};
use chainbox_telemetry::encode_metrics;
use chainbox_telemetry::metrics::{NODE_ACTIVE_REQUESTS, NODE_REQUESTS};
use chainbox_types::{
    BatchPayload, BatchResponse, ErrorCode, FabricError, MeshCallResult, MeshPayload, MeshResponse,
    WireError, SIGNATURE_HEADER, TIMESTAMP_HEADER,
};

use crate::NodeError;

/// Shared state for the node's handlers.
pub struct NodeState {
    fabric: Arc<Fabric>,
    started: Instant,
    requests: AtomicU64,
}

impl NodeState {
    pub fn new(fabric: Arc<Fabric>) -> Self {
        Self {
            fabric,
            started: Instant::now(),
            requests: AtomicU64::new(0),
        }
    }

    fn count_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        NODE_REQUESTS.inc();
    }
}

/// Build the node router with body limits and the error-envelope guard.
pub fn build_router(state: Arc<NodeState>) -> Router {
    let max_body = state.fabric.config().max_body_size;

    Router::new()
        .route("/health", get(health))
        .route("/execute", post(execute))
        .route("/execute/batch", post(execute_batch))
        .route("/metrics", get(metrics))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            payload_guard,
        ))
        .layer(DefaultBodyLimit::max(max_body))
        .with_state(state)
}

/// Serve until a termination signal, then drain with a force-exit grace
/// window. Marks the process as a mesh node before accepting traffic.
pub async fn serve(fabric: Arc<Fabric>) -> Result<(), NodeError> {
    fabric.mark_mesh_node();

    let addr: SocketAddr =
        fabric
            .config()
            .bind_addr
            .parse()
            .map_err(|e: std::net::AddrParseError| NodeError::InvalidAddr {
                addr: fabric.config().bind_addr.clone(),
                reason: e.to_string(),
            })?;
    let grace_ms = fabric.config().shutdown_grace_ms;

    let state = Arc::new(NodeState::new(Arc::clone(&fabric)));
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, node_id = %fabric.config().node_id, "Mesh node listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(grace_ms))
        .await?;

    info!("Mesh node stopped");
    Ok(())
}

async fn shutdown_signal(grace_ms: u64) {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!(grace_ms = grace_ms, "Shutdown signal received, draining in-flight requests");
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(grace_ms)).await;
        error!("Drain grace window elapsed, forcing exit");
        std::process::exit(1);
    });
}

/// Replace bare body-limit rejections with the structured envelope.
async fn payload_guard(
    State(state): State<Arc<NodeState>>,
    request: Request,
    next: Next,
) -> Response {
    let response = next.run(request).await;
    if response.status() == StatusCode::PAYLOAD_TOO_LARGE {
        let limit = state.fabric.config().max_body_size;
        warn!(limit = limit, "Request body over the configured cap");
        return error_response(&FabricError::payload_too_large(limit));
    }
    response
}

async fn health(State(state): State<Arc<NodeState>>) -> impl IntoResponse {
    state.count_request();
    Json(json!({
        "status": "healthy",
        "uptimeMs": state.started.elapsed().as_millis() as u64,
        "requests": state.requests.load(Ordering::Relaxed),
    }))
}

async fn metrics(State(state): State<Arc<NodeState>>) -> Response {
    state.count_request();
    match encode_metrics() {
        Ok(text) => (StatusCode::OK, text).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, String::new()).into_response()
        }
    }
}

async fn execute(
    State(state): State<Arc<NodeState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.count_request();
    NODE_ACTIVE_REQUESTS.inc();
    let response = execute_impl(&state, &headers, &body).await;
    NODE_ACTIVE_REQUESTS.dec();
    response
}

async fn execute_impl(state: &NodeState, headers: &HeaderMap, body: &Bytes) -> Response {
    let value = match verify_and_parse(state, headers, body) {
        Ok(value) => value,
        Err(response) => return response,
    };
    let payload: MeshPayload = match serde_json::from_value(value) {
        Ok(payload) => payload,
        Err(e) => {
            return error_response(&FabricError::internal(format!(
                "malformed mesh payload: {e}"
            )))
        }
    };

    let result = state
        .fabric
        .executor()
        .execute(
            &payload.fn_name,
            payload.input,
            ExecuteOptions {
                identity: payload.identity,
                parent_frame: Some(payload.frame),
                trace_id: Some(payload.trace_id),
                force_local: true,
                mesh_entry: true,
                ..ExecuteOptions::default()
            },
        )
        .await;

    match result {
        Ok(result) => Json(MeshResponse {
            data: result.value,
            outcome: result.outcome,
            cached: result.cached,
            trace: result.trace,
        })
        .into_response(),
        Err(error) => error_response(&error),
    }
}

async fn execute_batch(
    State(state): State<Arc<NodeState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.count_request();
    NODE_ACTIVE_REQUESTS.inc();
    let response = execute_batch_impl(&state, &headers, &body).await;
    NODE_ACTIVE_REQUESTS.dec();
    response
}

async fn execute_batch_impl(state: &NodeState, headers: &HeaderMap, body: &Bytes) -> Response {
    let value = match verify_and_parse(state, headers, body) {
        Ok(value) => value,
        Err(response) => return response,
    };
    let payload: BatchPayload = match serde_json::from_value(value) {
        Ok(payload) => payload,
        Err(e) => {
            return error_response(&FabricError::internal(format!(
                "malformed batch payload: {e}"
            )))
        }
    };

    let executor = state.fabric.executor();
    let futures: Vec<_> = payload
        .calls
        .into_iter()
        .map(|call| {
            executor.execute(
                &call.fn_name,
                call.input,
                ExecuteOptions {
                    identity: payload.identity.clone(),
                    parent_frame: Some(payload.frame),
                    trace_id: Some(payload.trace_id.clone()),
                    force_local: true,
                    mesh_entry: true,
                    ..ExecuteOptions::default()
                },
            )
        })
        .collect();

    let results = join_all(futures)
        .await
        .into_iter()
        .map(|result| match result {
            Ok(result) => MeshCallResult::Ok(MeshResponse {
                data: result.value,
                outcome: result.outcome,
                cached: result.cached,
                trace: result.trace,
            }),
            Err(error) => MeshCallResult::Err(error.into()),
        })
        .collect();

    Json(BatchResponse { results }).into_response()
}

/// Verify signing headers against the parsed body and return the payload.
fn verify_and_parse(
    state: &NodeState,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<Value, Response> {
    let value: Value = serde_json::from_slice(body).map_err(|e| {
        error_response(&FabricError::internal(format!("request is not JSON: {e}")))
    })?;

    if state.fabric.signer.is_enabled() {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|h| h.to_str().ok())
            .ok_or_else(|| {
                error_response(&FabricError::invalid_signature("missing signature header"))
            })?;
        let timestamp: u64 = headers
            .get(TIMESTAMP_HEADER)
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                error_response(&FabricError::invalid_signature("missing timestamp header"))
            })?;

        if let Err(error) = state.fabric.signer.verify(&value, signature, timestamp) {
            warn!(error = %error, "Rejected unsigned or mis-signed mesh request");
            return Err(error_response(&error));
        }
    }

    Ok(value)
}

fn error_response(error: &FabricError) -> Response {
    let status = status_for(error.code);
    (status, Json(WireError::from(error.clone()))).into_response()
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Forbidden | ErrorCode::AccessDenied => StatusCode::FORBIDDEN,
        ErrorCode::Unauthorized | ErrorCode::InvalidSignature => StatusCode::UNAUTHORIZED,
        ErrorCode::FunctionNotFound => StatusCode::NOT_FOUND,
        ErrorCode::RateLimited | ErrorCode::TenantQuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        ErrorCode::ExecutionTimeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorCode::CircuitOpen => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::MeshCallFailed => StatusCode::BAD_GATEWAY,
        ErrorCode::MaxCallDepthExceeded => StatusCode::BAD_REQUEST,
        ErrorCode::AdapterNotFound | ErrorCode::ExecutionError | ErrorCode::InternalError => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

//! Per-node circuit breaker guarding mesh dispatches.
//!
//! ```text
//!                 success
//!         ┌─────────────────────┐
//!         │                     │
//!         ▼                     │
//!   ┌──────────┐          ┌──────────┐          ┌──────────┐
//!   │  CLOSED  │ ───────► │   OPEN   │ ───────► │HALF-OPEN │
//!   │ (normal) │ failures │ (reject) │  timeout │  (probe) │
//!   └──────────┘          └──────────┘          └──────────┘
//!         ▲                                           │
//!         └───────────────────────────────────────────┘
//!                        successes
//! ```

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use chainbox_telemetry::metrics::CIRCUIT_TRANSITIONS;
use chainbox_types::FabricError;

use crate::config::CircuitSettings;

/// Circuit state for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug)]
struct NodeCircuit {
    state: CircuitState,
    failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    last_transition: Instant,
}

impl NodeCircuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            half_open_successes: 0,
            opened_at: None,
            last_transition: Instant::now(),
        }
    }
}

/// Diagnostic snapshot of one node's circuit.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStats {
    pub node_id: String,
    pub state: CircuitState,
    pub failures: u32,
    pub time_in_state_ms: u64,
}

/// Per-node failure state machine.
pub struct CircuitBreaker {
    settings: CircuitSettings,
    open_timeout: Duration,
    circuits: RwLock<HashMap<String, NodeCircuit>>,
}

impl CircuitBreaker {
    pub fn new(settings: CircuitSettings) -> Self {
        Self {
            open_timeout: Duration::from_millis(settings.open_timeout_ms),
            settings,
            circuits: RwLock::new(HashMap::new()),
        }
    }

    /// Whether a request to this node may proceed. An open circuit whose
    /// timeout has elapsed transitions to half-open and admits the probe.
    pub fn is_allowed(&self, node_id: &str) -> bool {
        let mut circuits = self.circuits.write();
        let circuit = circuits
            .entry(node_id.to_string())
            .or_insert_with(NodeCircuit::new);

        match circuit.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = circuit
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.open_timeout {
                    info!(node_id = %node_id, "Circuit half-open, admitting probe");
                    CIRCUIT_TRANSITIONS.with_label_values(&["half_open"]).inc();
                    circuit.state = CircuitState::HalfOpen;
                    circuit.half_open_successes = 0;
                    circuit.last_transition = Instant::now();
                    true
                } else {
                    debug!(node_id = %node_id, "Circuit open, rejecting request");
                    false
                }
            }
        }
    }

    /// [`CircuitBreaker::is_allowed`] as a gate error.
    pub fn check(&self, node_id: &str) -> Result<(), FabricError> {
        if self.is_allowed(node_id) {
            Ok(())
        } else {
            Err(FabricError::circuit_open(node_id))
        }
    }

    /// Record a successful request against this node.
    pub fn record_success(&self, node_id: &str) {
        let mut circuits = self.circuits.write();
        let Some(circuit) = circuits.get_mut(node_id) else {
            return;
        };

        match circuit.state {
            CircuitState::Closed => {
                circuit.failures = 0;
            }
            CircuitState::HalfOpen => {
                circuit.half_open_successes += 1;
                if circuit.half_open_successes >= self.settings.success_threshold {
                    info!(
                        node_id = %node_id,
                        successes = circuit.half_open_successes,
                        "Circuit closing after successful probes"
                    );
                    CIRCUIT_TRANSITIONS.with_label_values(&["closed"]).inc();
                    circuit.state = CircuitState::Closed;
                    circuit.failures = 0;
                    circuit.opened_at = None;
                    circuit.last_transition = Instant::now();
                }
            }
            CircuitState::Open => {
                // No requests are sent while open; nothing to record.
            }
        }
    }

    /// Record a failed request against this node.
    pub fn record_failure(&self, node_id: &str) {
        let mut circuits = self.circuits.write();
        let circuit = circuits
            .entry(node_id.to_string())
            .or_insert_with(NodeCircuit::new);

        match circuit.state {
            CircuitState::Closed => {
                circuit.failures += 1;
                if circuit.failures >= self.settings.failure_threshold {
                    warn!(
                        node_id = %node_id,
                        failures = circuit.failures,
                        threshold = self.settings.failure_threshold,
                        "Circuit opening"
                    );
                    CIRCUIT_TRANSITIONS.with_label_values(&["open"]).inc();
                    circuit.state = CircuitState::Open;
                    circuit.opened_at = Some(Instant::now());
                    circuit.last_transition = Instant::now();
                }
            }
            CircuitState::HalfOpen => {
                warn!(node_id = %node_id, "Circuit reopening after failed probe");
                CIRCUIT_TRANSITIONS.with_label_values(&["open"]).inc();
                circuit.state = CircuitState::Open;
                circuit.opened_at = Some(Instant::now());
                circuit.half_open_successes = 0;
                circuit.last_transition = Instant::now();
            }
            CircuitState::Open => {
                circuit.opened_at = Some(Instant::now());
            }
        }
    }

    /// Current state of a node's circuit.
    pub fn state(&self, node_id: &str) -> CircuitState {
        self.circuits
            .read()
            .get(node_id)
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Diagnostic snapshot of all circuits.
    pub fn stats(&self) -> Vec<CircuitStats> {
        self.circuits
            .read()
            .iter()
            .map(|(node_id, circuit)| CircuitStats {
                node_id: node_id.clone(),
                state: circuit.state,
                failures: circuit.failures,
                time_in_state_ms: circuit.last_transition.elapsed().as_millis() as u64,
            })
            .collect()
    }

    /// Manually close one circuit.
    pub fn reset(&self, node_id: &str) {
        let mut circuits = self.circuits.write();
        if let Some(circuit) = circuits.get_mut(node_id) {
            info!(node_id = %node_id, "Circuit manually reset");
            *circuit = NodeCircuit::new();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(CircuitSettings {
            failure_threshold: 2,
            open_timeout_ms: 50,
            success_threshold: 2,
        })
    }

    #[test]
    fn test_starts_closed_and_allows() {
        let b = breaker();
        assert_eq!(b.state("n1"), CircuitState::Closed);
        assert!(b.is_allowed("n1"));
        assert!(b.check("n1").is_ok());
    }

    #[test]
    fn test_opens_after_threshold_failures() {
        let b = breaker();
        b.record_failure("n1");
        assert_eq!(b.state("n1"), CircuitState::Closed);
        b.record_failure("n1");
        assert_eq!(b.state("n1"), CircuitState::Open);
        assert!(!b.is_allowed("n1"));

        let err = b.check("n1").unwrap_err();
        assert_eq!(err.code, chainbox_types::ErrorCode::CircuitOpen);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let b = breaker();
        b.record_failure("n1");
        b.record_success("n1");
        b.record_failure("n1");
        assert_eq!(b.state("n1"), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_probe_then_close() {
        let b = breaker();
        b.record_failure("n1");
        b.record_failure("n1");
        assert_eq!(b.state("n1"), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(70));
        assert!(b.is_allowed("n1"));
        assert_eq!(b.state("n1"), CircuitState::HalfOpen);

        b.record_success("n1");
        assert_eq!(b.state("n1"), CircuitState::HalfOpen);
        b.record_success("n1");
        assert_eq!(b.state("n1"), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let b = breaker();
        b.record_failure("n1");
        b.record_failure("n1");
        std::thread::sleep(Duration::from_millis(70));
        assert!(b.is_allowed("n1"));

        b.record_failure("n1");
        assert_eq!(b.state("n1"), CircuitState::Open);
        assert!(!b.is_allowed("n1"));
    }

    #[test]
    fn test_nodes_are_independent() {
        let b = breaker();
        b.record_failure("n1");
        b.record_failure("n1");
        assert!(!b.is_allowed("n1"));
        assert!(b.is_allowed("n2"));
    }

    #[test]
    fn test_reset() {
        let b = breaker();
        b.record_failure("n1");
        b.record_failure("n1");
        b.reset("n1");
        assert_eq!(b.state("n1"), CircuitState::Closed);
        assert!(b.is_allowed("n1"));
    }

    #[test]
    fn test_stats() {
        let b = breaker();
        b.record_failure("n1");
        b.is_allowed("n2");
        let stats = b.stats();
        assert_eq!(stats.len(), 2);
    }
}

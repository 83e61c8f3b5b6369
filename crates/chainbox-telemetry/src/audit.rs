//! Append-only audit log of completed root invocations.
//!
//! Entries land in a bounded in-memory ring for diagnostics and, when a path
//! is configured, in a durable newline-delimited JSON tail. Audit failures
//! never fail the invocation that produced them; they are logged and dropped.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use chainbox_types::{CallStatus, Outcome, TraceFrame};

/// Which completions are recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuditLevel {
    #[default]
    All,
    Errors,
    None,
}

impl std::str::FromStr for AuditLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(AuditLevel::All),
            "errors" => Ok(AuditLevel::Errors),
            "none" => Ok(AuditLevel::None),
            other => Err(format!("unknown audit level: {other}")),
        }
    }
}

/// Audit configuration.
#[derive(Debug, Clone)]
pub struct AuditConfig {
    pub enabled: bool,
    pub level: AuditLevel,
    /// Ring capacity for the in-memory tail.
    pub capacity: usize,
    /// Durable NDJSON file, appended per entry when set.
    pub path: Option<PathBuf>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: AuditLevel::All,
            capacity: 1024,
            path: None,
        }
    }
}

/// One completed root invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// Epoch milliseconds at completion.
    pub timestamp: u64,
    #[serde(rename = "fn")]
    pub fn_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    pub status: CallStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub outcome: Outcome,
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<TraceFrame>,
}

/// Bounded in-memory ring with an optional durable tail.
pub struct AuditLog {
    config: AuditConfig,
    ring: Mutex<VecDeque<AuditEntry>>,
    file: Option<Mutex<File>>,
}

impl AuditLog {
    pub fn new(config: AuditConfig) -> Self {
        let file = if config.enabled {
            config.path.as_ref().and_then(|p| {
                match OpenOptions::new().create(true).append(true).open(p) {
                    Ok(f) => Some(Mutex::new(f)),
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Audit file unavailable, keeping in-memory ring only");
                        None
                    }
                }
            })
        } else {
            None
        };

        Self {
            ring: Mutex::new(VecDeque::with_capacity(config.capacity.min(1024))),
            config,
            file,
        }
    }

    /// Record one completed invocation, subject to the configured level.
    pub fn record(&self, entry: AuditEntry) {
        if !self.config.enabled {
            return;
        }
        match self.config.level {
            AuditLevel::None => return,
            AuditLevel::Errors if entry.status == CallStatus::Success => return,
            _ => {}
        }

        if let Some(file) = &self.file {
            match serde_json::to_string(&entry) {
                Ok(line) => {
                    let mut f = file.lock();
                    if let Err(e) = writeln!(f, "{line}") {
                        warn!(error = %e, "Failed to append audit entry");
                    }
                }
                Err(e) => warn!(error = %e, "Failed to serialize audit entry"),
            }
        }

        let mut ring = self.ring.lock();
        if ring.len() >= self.config.capacity {
            ring.pop_front();
        }
        ring.push_back(entry);
    }

    /// Most recent entries, newest last, up to `n`.
    pub fn recent(&self, n: usize) -> Vec<AuditEntry> {
        let ring = self.ring.lock();
        ring.iter().rev().take(n).rev().cloned().collect()
    }

    /// Number of entries currently held in the ring.
    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

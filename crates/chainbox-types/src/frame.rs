//! Per-invocation budget record: recursion depth and absolute deadline.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// Returns 0 if the system clock is before the epoch, which no sane host
/// reports.
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Budget record carried through an invocation tree.
///
/// The root call constructs one; every nested call derives a child with
/// `depth + 1` and the same start time, so the whole tree shares one absolute
/// deadline. A mesh hop re-homes the frame: the receiving node resets
/// `start_time` to its own clock so cross-host skew cannot poison the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionFrame {
    pub depth: u32,
    pub max_depth: u32,
    /// Epoch milliseconds at which the budget clock started.
    pub start_time: u64,
    pub timeout_ms: u64,
}

impl ExecutionFrame {
    /// Frame for a root invocation, starting the budget clock now.
    pub fn root(max_depth: u32, timeout_ms: u64) -> Self {
        Self {
            depth: 1,
            max_depth,
            start_time: epoch_ms(),
            timeout_ms,
        }
    }

    /// Derive the frame for a nested call: one level deeper, same budget.
    pub fn child(&self) -> Self {
        Self {
            depth: self.depth + 1,
            ..*self
        }
    }

    /// Re-home the frame after a mesh hop: identical limits, budget clock
    /// restarted on the local host.
    pub fn rehomed(&self) -> Self {
        Self {
            start_time: epoch_ms(),
            ..*self
        }
    }

    /// Milliseconds elapsed since the budget clock started.
    pub fn elapsed_ms(&self) -> u64 {
        epoch_ms().saturating_sub(self.start_time)
    }

    /// Milliseconds left in the budget; zero when exhausted.
    pub fn remaining_ms(&self) -> u64 {
        self.timeout_ms.saturating_sub(self.elapsed_ms())
    }

    /// True when the absolute deadline has passed.
    pub fn is_expired(&self) -> bool {
        self.elapsed_ms() >= self.timeout_ms
    }

    /// True when this frame sits beyond the permitted recursion depth.
    pub fn exceeds_depth(&self) -> bool {
        self.depth > self.max_depth
    }
}

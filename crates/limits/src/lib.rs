#![forbid(unsafe_code)]

/// Default, shareable size limits for the in-memory PDO ledger and its auditors.
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerLimits {
    /// Maximum number of PDOs the state machine will register.
    pub max_pdos: usize,
    /// Maximum transitions appended to a single PDO log.
    pub max_transitions_per_pdo: usize,
    /// Maximum byte length of a transition reason.
    pub max_reason_bytes: usize,
    /// Maximum intermediate snapshots captured by a forensic replay.
    pub max_trace_steps: usize,
    /// Independent replay runs used by the determinism self-test.
    pub determinism_runs: usize,
}

/// Default limits used throughout the ledger components.
pub const DEFAULT_LIMITS: LedgerLimits = LedgerLimits {
    max_pdos: 10_000,
    max_transitions_per_pdo: 256,
    max_reason_bytes: 1024,
    max_trace_steps: 4096,
    determinism_runs: 3,
};

impl Default for LedgerLimits {
    fn default() -> Self {
        default_limits()
    }
}

/// Convenience helper returning the default ledger limits.
pub const fn default_limits() -> LedgerLimits {
    DEFAULT_LIMITS
}

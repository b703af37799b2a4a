#![forbid(unsafe_code)]

//! Independent reconstruction of PDO state from an exported transition log.
//!
//! The engine never consults the live state machine: it walks the supplied
//! records, recomputes every hash, and checks each step against the legality
//! table. Integrity problems are collected into the returned
//! [`ReplayResult`]; nothing here aborts early.

use common::{short_hex, Digest, GENESIS};
use limits::LedgerLimits;
use log::{debug, warn};
use pdo_protocol::{PdoState, PdoTransition, ReplayMode};
use thiserror::Error;
use transition_table::{is_legal, is_override};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayConfig {
    /// Upper bound on snapshots captured by a forensic replay.
    pub max_trace_steps: usize,
    /// Runs used by the determinism self-test when the caller gives none.
    pub determinism_runs: usize,
}

impl From<LedgerLimits> for ReplayConfig {
    fn from(limits: LedgerLimits) -> Self {
        Self {
            max_trace_steps: limits.max_trace_steps,
            determinism_runs: limits.determinism_runs,
        }
    }
}

impl Default for ReplayConfig {
    fn default() -> Self {
        LedgerLimits::default().into()
    }
}

/// Internal failures. These never escape [`PdoReplayEngine::replay`]; they
/// become an "inconclusive" entry in the result.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReplayError {
    #[error("forensic trace exceeded {limit} steps")]
    TraceLimitExceeded { limit: usize },
}

/// State snapshot after one applied transition.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayStep {
    pub index: usize,
    pub transition_id: String,
    pub from_state: PdoState,
    pub to_state: PdoState,
    pub timestamp_ms: u64,
    pub is_override: bool,
    /// Whether any override has been applied up to and including this step.
    pub is_overridden: bool,
    #[cfg_attr(feature = "serde", serde(with = "hex::serde"))]
    pub hash_current: Digest,
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayResult {
    pub pdo_id: String,
    pub mode: ReplayMode,
    pub final_state: PdoState,
    pub transition_count: usize,
    pub override_count: usize,
    pub hash_chain_valid: bool,
    pub state_consistent: bool,
    /// `hash_current` of the last applied record, GENESIS when none applied.
    #[cfg_attr(feature = "serde", serde(with = "hex::serde"))]
    pub final_hash: Digest,
    pub errors: Vec<String>,
    /// Present only for forensic replays.
    pub trace: Option<Vec<ReplayStep>>,
}

impl ReplayResult {
    fn empty(pdo_id: &str, mode: ReplayMode) -> Self {
        Self {
            pdo_id: pdo_id.to_string(),
            mode,
            final_state: PdoState::Pending,
            transition_count: 0,
            override_count: 0,
            hash_chain_valid: true,
            state_consistent: true,
            final_hash: GENESIS,
            errors: Vec::new(),
            trace: matches!(mode, ReplayMode::Forensic).then(Vec::new),
        }
    }

    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }

    fn chain_error(&mut self, message: String) {
        self.hash_chain_valid = false;
        self.errors.push(message);
    }

    fn state_error(&mut self, message: String) {
        self.state_consistent = false;
        self.errors.push(message);
    }
}

/// Outcome of the determinism self-test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeterminismVerdict {
    pub deterministic: bool,
    pub runs: usize,
    pub diagnostic: Option<String>,
}

/// Stateless replay engine; safe to share and call concurrently.
#[derive(Debug, Clone, Default)]
pub struct PdoReplayEngine {
    config: ReplayConfig,
}

impl PdoReplayEngine {
    pub fn new(config: ReplayConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> ReplayConfig {
        self.config
    }

    /// Recompute state for `pdo_id` from `transitions`.
    ///
    /// `target_timestamp_ms` is required for point-in-time replays and
    /// `expected_final_state` for validating replays; a missing argument is
    /// reported as an error rather than defaulted.
    pub fn replay(
        &self,
        pdo_id: &str,
        transitions: &[PdoTransition],
        mode: ReplayMode,
        target_timestamp_ms: Option<u64>,
        expected_final_state: Option<PdoState>,
    ) -> ReplayResult {
        let mut result = ReplayResult::empty(pdo_id, mode);

        if let Err(err) = self.apply(
            &mut result,
            transitions,
            target_timestamp_ms,
            expected_final_state,
        ) {
            result.errors.push(format!("replay inconclusive: {err}"));
        }

        if result.success() {
            debug!(
                "replayed pdo {} ({}): {} transitions -> {}",
                pdo_id, mode, result.transition_count, result.final_state
            );
        } else {
            warn!(
                "replay of pdo {} ({}) found {} problem(s); first: {}",
                pdo_id,
                mode,
                result.errors.len(),
                result.errors[0]
            );
        }
        result
    }

    fn apply(
        &self,
        result: &mut ReplayResult,
        transitions: &[PdoTransition],
        target_timestamp_ms: Option<u64>,
        expected_final_state: Option<PdoState>,
    ) -> Result<(), ReplayError> {
        let cutoff = match (result.mode, target_timestamp_ms) {
            (ReplayMode::PointInTime, Some(target)) => Some(target),
            (ReplayMode::PointInTime, None) => {
                result.state_error("point-in-time replay requires a target timestamp".to_string());
                return Ok(());
            }
            _ => None,
        };

        let mut state = PdoState::Pending;
        let mut expected_previous = GENESIS;
        let mut previous_timestamp: Option<u64> = None;
        let mut overridden = false;

        for (index, transition) in transitions.iter().enumerate() {
            if cutoff.is_some_and(|target| transition.timestamp_ms > target) {
                break;
            }
            if result
                .trace
                .as_ref()
                .is_some_and(|trace| trace.len() >= self.config.max_trace_steps)
            {
                return Err(ReplayError::TraceLimitExceeded {
                    limit: self.config.max_trace_steps,
                });
            }

            let id = &transition.id;
            if transition.pdo_id != result.pdo_id {
                let message = format!(
                    "transition {id} (index {index}) belongs to pdo {}, expected {}",
                    transition.pdo_id, result.pdo_id
                );
                result.state_error(message);
            }

            if let Some(previous) = previous_timestamp {
                if transition.timestamp_ms < previous {
                    result.chain_error(format!(
                        "transition {id} (index {index}) timestamp {} precedes previous {}",
                        transition.timestamp_ms, previous
                    ));
                }
            }

            if transition.hash_previous != expected_previous {
                result.chain_error(format!(
                    "transition {id} (index {index}) hash_previous {} does not match {}",
                    short_hex(&transition.hash_previous),
                    short_hex(&expected_previous)
                ));
            }

            let recomputed = hash_chain::recompute(transition);
            if recomputed != transition.hash_current {
                result.chain_error(format!(
                    "transition {id} (index {index}) hash_current {} does not match recomputed {}",
                    short_hex(&transition.hash_current),
                    short_hex(&recomputed)
                ));
            }

            if transition.from_state != state {
                result.state_error(format!(
                    "transition {id} (index {index}) starts from {} but replayed state is {}",
                    transition.from_state, state
                ));
            }

            if !is_legal(
                transition.from_state,
                transition.to_state,
                transition.transition_kind,
            ) {
                result.state_error(format!(
                    "transition {id} (index {index}) {} -> {} via {} is not legal",
                    transition.from_state, transition.to_state, transition.transition_kind
                ));
            }

            let expected_override = is_override(
                transition.from_state,
                transition.to_state,
                transition.transition_kind,
            );
            if expected_override != transition.is_override {
                result.state_error(format!(
                    "transition {id} (index {index}) override flag {} disagrees with override rule",
                    transition.is_override
                ));
            }

            state = transition.to_state;
            overridden |= expected_override;
            expected_previous = transition.hash_current;
            previous_timestamp = Some(transition.timestamp_ms);

            result.final_state = state;
            result.final_hash = transition.hash_current;
            result.transition_count += 1;
            if expected_override {
                result.override_count += 1;
            }

            if let Some(trace) = result.trace.as_mut() {
                trace.push(ReplayStep {
                    index,
                    transition_id: id.clone(),
                    from_state: transition.from_state,
                    to_state: transition.to_state,
                    timestamp_ms: transition.timestamp_ms,
                    is_override: expected_override,
                    is_overridden: overridden,
                    hash_current: transition.hash_current,
                });
            }
        }

        if result.mode == ReplayMode::Validate {
            match expected_final_state {
                Some(expected) if expected != state => result.state_error(format!(
                    "final state {state} does not match expected {expected}"
                )),
                Some(_) => {}
                None => result
                    .state_error("validating replay requires an expected final state".to_string()),
            }
        }

        Ok(())
    }

    /// Replay `runs` times (at least once) and compare the verdicts.
    pub fn validate_replay_determinism(
        &self,
        pdo_id: &str,
        transitions: &[PdoTransition],
        runs: Option<usize>,
    ) -> DeterminismVerdict {
        let runs = runs.unwrap_or(self.config.determinism_runs).max(1);
        let baseline = self.replay(pdo_id, transitions, ReplayMode::Full, None, None);

        for run in 1..runs {
            let candidate = self.replay(pdo_id, transitions, ReplayMode::Full, None, None);
            let mut diverged = Vec::new();
            if candidate.final_state != baseline.final_state {
                diverged.push(format!(
                    "final_state {} != {}",
                    candidate.final_state, baseline.final_state
                ));
            }
            if candidate.transition_count != baseline.transition_count {
                diverged.push(format!(
                    "transition_count {} != {}",
                    candidate.transition_count, baseline.transition_count
                ));
            }
            if candidate.hash_chain_valid != baseline.hash_chain_valid {
                diverged.push(format!(
                    "hash_chain_valid {} != {}",
                    candidate.hash_chain_valid, baseline.hash_chain_valid
                ));
            }
            if candidate.final_hash != baseline.final_hash {
                diverged.push(format!(
                    "final_hash {} != {}",
                    short_hex(&candidate.final_hash),
                    short_hex(&baseline.final_hash)
                ));
            }

            if !diverged.is_empty() {
                let diagnostic = format!("run {run} diverged: {}", diverged.join(", "));
                warn!("replay of pdo {pdo_id} is not deterministic: {diagnostic}");
                return DeterminismVerdict {
                    deterministic: false,
                    runs,
                    diagnostic: Some(diagnostic),
                };
            }
        }

        DeterminismVerdict {
            deterministic: true,
            runs,
            diagnostic: None,
        }
    }

    pub fn reconstruct_state_at_time(
        &self,
        pdo_id: &str,
        transitions: &[PdoTransition],
        target_timestamp_ms: u64,
    ) -> ReplayResult {
        self.replay(
            pdo_id,
            transitions,
            ReplayMode::PointInTime,
            Some(target_timestamp_ms),
            None,
        )
    }

    pub fn forensic_analysis(&self, pdo_id: &str, transitions: &[PdoTransition]) -> ReplayResult {
        self.replay(pdo_id, transitions, ReplayMode::Forensic, None, None)
    }

    /// Field-level differences between two results; empty when identical.
    pub fn compare_replay_results(first: &ReplayResult, second: &ReplayResult) -> Vec<String> {
        let mut diffs = Vec::new();

        if first.pdo_id != second.pdo_id {
            diffs.push(format!("pdo_id: {} != {}", first.pdo_id, second.pdo_id));
        }
        if first.mode != second.mode {
            diffs.push(format!("mode: {} != {}", first.mode, second.mode));
        }
        if first.final_state != second.final_state {
            diffs.push(format!(
                "final_state: {} != {}",
                first.final_state, second.final_state
            ));
        }
        if first.transition_count != second.transition_count {
            diffs.push(format!(
                "transition_count: {} != {}",
                first.transition_count, second.transition_count
            ));
        }
        if first.override_count != second.override_count {
            diffs.push(format!(
                "override_count: {} != {}",
                first.override_count, second.override_count
            ));
        }
        if first.hash_chain_valid != second.hash_chain_valid {
            diffs.push(format!(
                "hash_chain_valid: {} != {}",
                first.hash_chain_valid, second.hash_chain_valid
            ));
        }
        if first.state_consistent != second.state_consistent {
            diffs.push(format!(
                "state_consistent: {} != {}",
                first.state_consistent, second.state_consistent
            ));
        }
        if first.final_hash != second.final_hash {
            diffs.push(format!(
                "final_hash: {} != {}",
                short_hex(&first.final_hash),
                short_hex(&second.final_hash)
            ));
        }
        if first.errors != second.errors {
            diffs.push(format!(
                "errors: {} entries != {} entries",
                first.errors.len(),
                second.errors.len()
            ));
        }
        if first.trace != second.trace {
            let len = |r: &ReplayResult| r.trace.as_ref().map(Vec::len);
            diffs.push(format!(
                "trace: {:?} steps != {:?} steps",
                len(first),
                len(second)
            ));
        }

        diffs
    }
}

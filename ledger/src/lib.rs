#![forbid(unsafe_code)]

//! Authoritative in-process PDO state machine.
//!
//! Every mutating call runs validate, hash, apply and append under a single
//! mutex, so no reader ever observes a half-applied transition.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use common::{short_hex, Digest, GENESIS};
use hash_chain::{compute_transition_hash, verify_chain};
use limits::LedgerLimits;
use log::{debug, info, warn};
use pdo_protocol::{NewPdo, Pdo, PdoState, PdoTransition, TransitionKind};
use thiserror::Error;
use transition_table::{is_override, is_terminal_state, legal_transitions, LegalMove};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Source of transition timestamps, injected so tests can pin time.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Manually advanced clock.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: u64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

pub type TransitionCallback = Box<dyn Fn(&PdoTransition) + Send + Sync>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("pdo not found: {0}")]
    PdoNotFound(String),
    #[error("invalid transition for pdo {pdo_id}: {from} -> {to} via {kind}")]
    InvalidTransition {
        pdo_id: String,
        from: PdoState,
        to: PdoState,
        kind: TransitionKind,
    },
    #[error("pdo already registered: {0}")]
    DuplicatePdo(String),
    #[error("{what} limit of {limit} reached")]
    CapacityExceeded { what: &'static str, limit: usize },
    #[error("reason is {len} bytes, limit is {limit}")]
    ReasonTooLong { len: usize, limit: usize },
}

/// Counters exposed to the surrounding system.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerMetrics {
    pub pdo_count: usize,
    pub transition_count: usize,
    pub override_count: usize,
    pub rejection_count: usize,
}

/// Outcome of recomputing one PDO's hash chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainVerdict {
    pub is_valid: bool,
    pub first_break: Option<String>,
}

#[derive(Debug)]
struct PdoEntry {
    pdo: Pdo,
    transitions: Vec<PdoTransition>,
    last_hash: Digest,
}

#[derive(Debug, Default)]
struct LedgerState {
    entries: HashMap<String, PdoEntry>,
    transition_count: usize,
    override_count: usize,
    rejection_count: usize,
}

pub struct PdoStateMachine {
    state: Mutex<LedgerState>,
    limits: LedgerLimits,
    clock: Arc<dyn Clock>,
    on_transition: Option<TransitionCallback>,
    on_override: Option<TransitionCallback>,
}

impl fmt::Debug for PdoStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PdoStateMachine")
            .field("limits", &self.limits)
            .field("metrics", &self.get_metrics())
            .finish_non_exhaustive()
    }
}

impl PdoStateMachine {
    pub fn new(limits: LedgerLimits, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            limits,
            clock,
            on_transition: None,
            on_override: None,
        }
    }

    /// Invoked with every accepted transition, after the lock is released.
    pub fn with_on_transition(mut self, callback: TransitionCallback) -> Self {
        self.on_transition = Some(callback);
        self
    }

    /// Invoked with every accepted override, after `on_transition`.
    pub fn with_on_override(mut self, callback: TransitionCallback) -> Self {
        self.on_override = Some(callback);
        self
    }

    pub fn limits(&self) -> LedgerLimits {
        self.limits
    }

    pub fn register(&self, new_pdo: NewPdo) -> Result<Pdo, LedgerError> {
        let mut state = self.lock();

        if state.entries.contains_key(new_pdo.id()) {
            warn!("rejected duplicate registration of pdo {}", new_pdo.id());
            return Err(LedgerError::DuplicatePdo(new_pdo.id().to_string()));
        }
        if state.entries.len() >= self.limits.max_pdos {
            warn!("pdo capacity {} reached", self.limits.max_pdos);
            return Err(LedgerError::CapacityExceeded {
                what: "pdo",
                limit: self.limits.max_pdos,
            });
        }

        let pdo = new_pdo.into_pending(self.clock.now_ms());
        info!("registered pdo {} in {}", pdo.id, pdo.current_state);
        state.entries.insert(
            pdo.id.clone(),
            PdoEntry {
                pdo: pdo.clone(),
                transitions: Vec::new(),
                last_hash: GENESIS,
            },
        );
        Ok(pdo)
    }

    /// Validate and apply one transition atomically.
    pub fn transition(
        &self,
        pdo_id: &str,
        to_state: PdoState,
        kind: TransitionKind,
        actor_id: &str,
        reason: &str,
        override_id: Option<&str>,
    ) -> Result<PdoTransition, LedgerError> {
        let record = {
            let mut guard = self.lock();
            let state = &mut *guard;

            let Some(entry) = state.entries.get_mut(pdo_id) else {
                warn!("transition requested for unknown pdo {pdo_id}");
                return Err(LedgerError::PdoNotFound(pdo_id.to_string()));
            };
            let from_state = entry.pdo.current_state;

            let rejection = if reason.len() > self.limits.max_reason_bytes {
                Some(LedgerError::ReasonTooLong {
                    len: reason.len(),
                    limit: self.limits.max_reason_bytes,
                })
            } else if !legal_transitions(from_state).contains(&(to_state, kind)) {
                Some(LedgerError::InvalidTransition {
                    pdo_id: pdo_id.to_string(),
                    from: from_state,
                    to: to_state,
                    kind,
                })
            } else if entry.transitions.len() >= self.limits.max_transitions_per_pdo {
                Some(LedgerError::CapacityExceeded {
                    what: "transition",
                    limit: self.limits.max_transitions_per_pdo,
                })
            } else {
                None
            };
            if let Some(err) = rejection {
                state.rejection_count += 1;
                warn!("rejected transition on pdo {pdo_id}: {err}");
                return Err(err);
            }

            let floor_ms = entry
                .transitions
                .last()
                .map(|t| t.timestamp_ms)
                .unwrap_or(entry.pdo.created_at_ms);
            let timestamp_ms = self.clock.now_ms().max(floor_ms);
            let sequence = entry.transitions.len() + 1;
            let overriding = is_override(from_state, to_state, kind);

            let override_id = match (overriding, override_id) {
                (true, Some(id)) => Some(id.to_string()),
                (true, None) => Some(format!("{pdo_id}:ovr:{sequence:06}")),
                (false, Some(id)) => {
                    debug!("ignoring override id {id} on non-override transition of {pdo_id}");
                    None
                }
                (false, None) => None,
            };

            let hash_previous = entry.last_hash;
            let hash_current = compute_transition_hash(
                pdo_id,
                from_state,
                to_state,
                actor_id,
                timestamp_ms,
                &hash_previous,
            );

            let record = PdoTransition {
                id: format!("{pdo_id}:tx:{sequence:06}"),
                pdo_id: pdo_id.to_string(),
                from_state,
                to_state,
                transition_kind: kind,
                actor_id: actor_id.to_string(),
                timestamp_ms,
                reason: reason.to_string(),
                is_override: overriding,
                override_id: override_id.clone(),
                hash_previous,
                hash_current,
            };

            entry.pdo.current_state = to_state;
            entry.pdo.updated_at_ms = timestamp_ms;
            if overriding {
                entry.pdo.is_overridden = true;
                entry.pdo.override_id = override_id;
                entry.pdo.override_timestamp_ms = Some(timestamp_ms);
                entry.pdo.original_decision = Some(from_state);
                entry.pdo.original_operator_id = Some(actor_id.to_string());
            }
            entry.transitions.push(record.clone());
            entry.last_hash = hash_current;

            state.transition_count += 1;
            if overriding {
                state.override_count += 1;
            }
            record
        };

        if record.is_override {
            warn!(
                "operator {} overrode {} on pdo {} -> {}",
                record.actor_id, record.from_state, record.pdo_id, record.to_state
            );
        } else {
            info!(
                "pdo {} {} -> {} via {} ({})",
                record.pdo_id,
                record.from_state,
                record.to_state,
                record.transition_kind,
                short_hex(&record.hash_current)
            );
        }

        if let Some(callback) = &self.on_transition {
            callback(&record);
        }
        if record.is_override {
            if let Some(callback) = &self.on_override {
                callback(&record);
            }
        }

        Ok(record)
    }

    pub fn get_pdo(&self, pdo_id: &str) -> Option<Pdo> {
        self.lock().entries.get(pdo_id).map(|entry| entry.pdo.clone())
    }

    pub fn pdo_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Ordered copy of the transition log, suitable for independent replay.
    pub fn get_transitions(&self, pdo_id: &str) -> Result<Vec<PdoTransition>, LedgerError> {
        self.lock()
            .entries
            .get(pdo_id)
            .map(|entry| entry.transitions.clone())
            .ok_or_else(|| LedgerError::PdoNotFound(pdo_id.to_string()))
    }

    pub fn get_valid_transitions(&self, pdo_id: &str) -> Result<Vec<LegalMove>, LedgerError> {
        let current = self
            .lock()
            .entries
            .get(pdo_id)
            .map(|entry| entry.pdo.current_state)
            .ok_or_else(|| LedgerError::PdoNotFound(pdo_id.to_string()))?;
        Ok(legal_transitions(current).to_vec())
    }

    /// Recompute every stored hash and report the first break, if any.
    pub fn verify_hash_chain(&self, pdo_id: &str) -> Result<ChainVerdict, LedgerError> {
        let transitions = self.get_transitions(pdo_id)?;
        Ok(verdict_for(pdo_id, &transitions))
    }

    pub fn verify_all_hash_chains(&self) -> BTreeMap<String, ChainVerdict> {
        let snapshot: Vec<(String, Vec<PdoTransition>)> = self
            .lock()
            .entries
            .iter()
            .map(|(id, entry)| (id.clone(), entry.transitions.clone()))
            .collect();

        snapshot
            .into_iter()
            .map(|(id, transitions)| {
                let verdict = verdict_for(&id, &transitions);
                (id, verdict)
            })
            .collect()
    }

    /// Best-effort state lookup by linear scan; `None` before the PDO existed.
    ///
    /// Skips hash verification. Audited reconstruction goes through the
    /// replay engine instead.
    pub fn get_state_at_time(
        &self,
        pdo_id: &str,
        timestamp_ms: u64,
    ) -> Result<Option<PdoState>, LedgerError> {
        let guard = self.lock();
        let entry = guard
            .entries
            .get(pdo_id)
            .ok_or_else(|| LedgerError::PdoNotFound(pdo_id.to_string()))?;

        if timestamp_ms < entry.pdo.created_at_ms {
            return Ok(None);
        }

        let state = entry
            .transitions
            .iter()
            .take_while(|t| t.timestamp_ms <= timestamp_ms)
            .last()
            .map(|t| t.to_state)
            .unwrap_or(PdoState::Pending);
        Ok(Some(state))
    }

    pub fn is_terminal_state(state: PdoState) -> bool {
        is_terminal_state(state)
    }

    pub fn get_metrics(&self) -> LedgerMetrics {
        let state = self.lock();
        LedgerMetrics {
            pdo_count: state.entries.len(),
            transition_count: state.transition_count,
            override_count: state.override_count,
            rejection_count: state.rejection_count,
        }
    }

    // State is only written after every check succeeded, so a poisoned lock
    // never guards a half-applied transition.
    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn verdict_for(pdo_id: &str, transitions: &[PdoTransition]) -> ChainVerdict {
    match verify_chain(transitions) {
        Ok(()) => ChainVerdict {
            is_valid: true,
            first_break: None,
        },
        Err(chain_break) => {
            let description = chain_break.describe();
            warn!("hash chain broken for pdo {pdo_id}: {description}");
            ChainVerdict {
                is_valid: false,
                first_break: Some(description),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn machine() -> (PdoStateMachine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        (
            PdoStateMachine::new(LedgerLimits::default(), clock.clone()),
            clock,
        )
    }

    fn register(machine: &PdoStateMachine, id: &str) -> Pdo {
        machine
            .register(NewPdo::new(id, 125_000, "USD").unwrap())
            .unwrap()
    }

    fn step(
        machine: &PdoStateMachine,
        clock: &ManualClock,
        id: &str,
        to: PdoState,
        kind: TransitionKind,
        actor: &str,
    ) -> PdoTransition {
        clock.advance(10);
        machine.transition(id, to, kind, actor, "test", None).unwrap()
    }

    fn drive_to_agent_approved(machine: &PdoStateMachine, clock: &ManualClock, id: &str) {
        step(machine, clock, id, PdoState::Submitted, TransitionKind::System, "intake");
        step(machine, clock, id, PdoState::AgentApproved, TransitionKind::Agent, "agent-7");
    }

    #[test]
    fn happy_path_settles_with_valid_chain() {
        let (machine, clock) = machine();
        register(&machine, "P1");
        drive_to_agent_approved(&machine, &clock, "P1");
        step(&machine, &clock, "P1", PdoState::PolicyApproved, TransitionKind::Policy, "policy");
        step(&machine, &clock, "P1", PdoState::Settled, TransitionKind::System, "settlement");

        let transitions = machine.get_transitions("P1").unwrap();
        assert_eq!(transitions.len(), 4);
        assert_eq!(transitions[0].hash_previous, GENESIS);
        for pair in transitions.windows(2) {
            assert_eq!(pair[1].hash_previous, pair[0].hash_current);
        }

        let pdo = machine.get_pdo("P1").unwrap();
        assert_eq!(pdo.current_state, PdoState::Settled);
        assert!(!pdo.is_overridden);
        assert!(machine.verify_hash_chain("P1").unwrap().is_valid);
        assert!(machine.get_valid_transitions("P1").unwrap().is_empty());

        let err = machine
            .transition("P1", PdoState::Cancelled, TransitionKind::Operator, "op", "late", None)
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));
    }

    #[test]
    fn operator_override_is_flagged_permanently() {
        let (machine, clock) = machine();
        register(&machine, "P1");
        drive_to_agent_approved(&machine, &clock, "P1");

        clock.advance(10);
        let record = machine
            .transition(
                "P1",
                PdoState::OperatorBlocked,
                TransitionKind::Operator,
                "operator-1",
                "manual block",
                Some("OVR-1"),
            )
            .unwrap();
        assert!(record.is_override);
        assert_eq!(record.override_id.as_deref(), Some("OVR-1"));

        let pdo = machine.get_pdo("P1").unwrap();
        assert!(pdo.is_overridden);
        assert_eq!(pdo.original_decision, Some(PdoState::AgentApproved));
        assert_eq!(pdo.original_operator_id.as_deref(), Some("operator-1"));
        assert_eq!(pdo.override_id.as_deref(), Some("OVR-1"));
        assert_eq!(pdo.override_timestamp_ms, Some(record.timestamp_ms));

        step(&machine, &clock, "P1", PdoState::Rejected, TransitionKind::System, "system");
        let pdo = machine.get_pdo("P1").unwrap();
        assert!(pdo.is_overridden);
        assert_eq!(pdo.override_id.as_deref(), Some("OVR-1"));
        assert_eq!(machine.get_metrics().override_count, 1);
    }

    #[test]
    fn override_without_id_gets_generated_one() {
        let (machine, clock) = machine();
        register(&machine, "P9");
        step(&machine, &clock, "P9", PdoState::Submitted, TransitionKind::System, "intake");
        step(&machine, &clock, "P9", PdoState::AgentBlocked, TransitionKind::Agent, "agent");
        let record = step(
            &machine,
            &clock,
            "P9",
            PdoState::OperatorApproved,
            TransitionKind::Operator,
            "op",
        );
        assert_eq!(record.override_id.as_deref(), Some("P9:ovr:000003"));
    }

    #[test]
    fn override_id_ignored_on_regular_transition() {
        let (machine, _clock) = machine();
        register(&machine, "P1");
        let record = machine
            .transition("P1", PdoState::Submitted, TransitionKind::System, "intake", "", Some("X"))
            .unwrap();
        assert!(!record.is_override);
        assert_eq!(record.override_id, None);
        assert_eq!(machine.get_pdo("P1").unwrap().override_id, None);
    }

    #[test]
    fn invalid_transition_is_rejected_without_mutation() {
        let (machine, _clock) = machine();
        register(&machine, "P1");
        let before = machine.get_pdo("P1").unwrap();

        let err = machine
            .transition("P1", PdoState::Settled, TransitionKind::System, "sys", "skip", None)
            .unwrap_err();
        assert_eq!(
            err,
            LedgerError::InvalidTransition {
                pdo_id: "P1".to_string(),
                from: PdoState::Pending,
                to: PdoState::Settled,
                kind: TransitionKind::System,
            }
        );
        // legal target, wrong authority
        assert!(machine
            .transition("P1", PdoState::Submitted, TransitionKind::Agent, "a", "", None)
            .is_err());

        assert_eq!(machine.get_pdo("P1").unwrap(), before);
        assert!(machine.get_transitions("P1").unwrap().is_empty());
        let metrics = machine.get_metrics();
        assert_eq!(metrics.rejection_count, 2);
        assert_eq!(metrics.transition_count, 0);
    }

    #[test]
    fn unknown_pdo_is_reported() {
        let (machine, _clock) = machine();
        assert_eq!(
            machine
                .transition("nope", PdoState::Submitted, TransitionKind::System, "s", "", None)
                .unwrap_err(),
            LedgerError::PdoNotFound("nope".to_string())
        );
        assert!(machine.get_transitions("nope").is_err());
        assert!(machine.get_valid_transitions("nope").is_err());
        assert!(machine.verify_hash_chain("nope").is_err());
        assert!(machine.get_state_at_time("nope", 0).is_err());
        assert_eq!(machine.get_pdo("nope"), None);
    }

    #[test]
    fn duplicate_registration_fails() {
        let (machine, _clock) = machine();
        register(&machine, "P1");
        let err = machine
            .register(NewPdo::new("P1", 1, "EUR").unwrap())
            .unwrap_err();
        assert_eq!(err, LedgerError::DuplicatePdo("P1".to_string()));
        assert_eq!(machine.get_metrics().pdo_count, 1);
        assert_eq!(machine.get_pdo("P1").unwrap().currency, "USD");
    }

    #[test]
    fn limits_are_enforced_fail_closed() {
        let clock = Arc::new(ManualClock::new(0));
        let machine = PdoStateMachine::new(
            LedgerLimits {
                max_pdos: 1,
                max_transitions_per_pdo: 1,
                max_reason_bytes: 4,
                ..Default::default()
            },
            clock,
        );
        register(&machine, "P1");
        assert_eq!(
            machine
                .register(NewPdo::new("P2", 1, "USD").unwrap())
                .unwrap_err(),
            LedgerError::CapacityExceeded {
                what: "pdo",
                limit: 1
            }
        );

        assert_eq!(
            machine
                .transition(
                    "P1",
                    PdoState::Submitted,
                    TransitionKind::System,
                    "s",
                    "too long",
                    None,
                )
                .unwrap_err(),
            LedgerError::ReasonTooLong { len: 8, limit: 4 }
        );
        machine
            .transition("P1", PdoState::Submitted, TransitionKind::System, "s", "ok", None)
            .unwrap();
        assert!(matches!(
            machine
                .transition("P1", PdoState::AgentApproved, TransitionKind::Agent, "a", "", None)
                .unwrap_err(),
            LedgerError::CapacityExceeded {
                what: "transition",
                ..
            }
        ));
        assert_eq!(machine.get_pdo("P1").unwrap().current_state, PdoState::Submitted);
        assert_eq!(machine.get_metrics().rejection_count, 2);
    }

    #[test]
    fn tampered_log_breaks_verification() {
        let (machine, clock) = machine();
        register(&machine, "P1");
        drive_to_agent_approved(&machine, &clock, "P1");

        {
            let mut state = machine.lock();
            let entry = state.entries.get_mut("P1").unwrap();
            entry.transitions[0].to_state = PdoState::Cancelled;
        }

        let verdict = machine.verify_hash_chain("P1").unwrap();
        assert!(!verdict.is_valid);
        assert!(verdict.first_break.unwrap().contains("P1:tx:000001"));
        assert!(!machine.verify_all_hash_chains()["P1"].is_valid);
    }

    #[test]
    fn reads_are_idempotent() {
        let (machine, clock) = machine();
        register(&machine, "P1");
        drive_to_agent_approved(&machine, &clock, "P1");

        assert_eq!(
            machine.get_transitions("P1").unwrap(),
            machine.get_transitions("P1").unwrap()
        );
        assert_eq!(
            machine.verify_hash_chain("P1").unwrap(),
            machine.verify_hash_chain("P1").unwrap()
        );
        assert_eq!(machine.get_metrics(), machine.get_metrics());
    }

    #[test]
    fn state_at_time_scans_log() {
        let (machine, clock) = machine();
        register(&machine, "P1");
        let submitted = step(
            &machine,
            &clock,
            "P1",
            PdoState::Submitted,
            TransitionKind::System,
            "s",
        );
        let approved = step(
            &machine,
            &clock,
            "P1",
            PdoState::AgentApproved,
            TransitionKind::Agent,
            "a",
        );

        assert_eq!(machine.get_state_at_time("P1", 999).unwrap(), None);
        assert_eq!(
            machine.get_state_at_time("P1", 1_000).unwrap(),
            Some(PdoState::Pending)
        );
        assert_eq!(
            machine.get_state_at_time("P1", submitted.timestamp_ms).unwrap(),
            Some(PdoState::Submitted)
        );
        assert_eq!(
            machine.get_state_at_time("P1", approved.timestamp_ms + 500).unwrap(),
            Some(PdoState::AgentApproved)
        );
    }

    #[test]
    fn backwards_clock_keeps_timestamps_ordered() {
        let (machine, clock) = machine();
        register(&machine, "P1");
        clock.set(5_000);
        let first = machine
            .transition("P1", PdoState::Submitted, TransitionKind::System, "s", "", None)
            .unwrap();
        clock.set(2_000);
        let second = machine
            .transition("P1", PdoState::AgentApproved, TransitionKind::Agent, "a", "", None)
            .unwrap();
        assert_eq!(first.timestamp_ms, 5_000);
        assert_eq!(second.timestamp_ms, 5_000);
    }

    #[test]
    fn callbacks_fire_after_commit() {
        let transitions_seen = Arc::new(AtomicUsize::new(0));
        let overrides_seen = Arc::new(AtomicUsize::new(0));
        let clock = Arc::new(ManualClock::new(0));

        let t = transitions_seen.clone();
        let o = overrides_seen.clone();
        let machine = PdoStateMachine::new(LedgerLimits::default(), clock.clone())
            .with_on_transition(Box::new(move |_: &PdoTransition| {
                t.fetch_add(1, Ordering::SeqCst);
            }))
            .with_on_override(Box::new(move |record: &PdoTransition| {
                assert!(record.is_override);
                o.fetch_add(1, Ordering::SeqCst);
            }));

        register(&machine, "P1");
        drive_to_agent_approved(&machine, &clock, "P1");
        step(&machine, &clock, "P1", PdoState::OperatorBlocked, TransitionKind::Operator, "op");
        let _ = machine.transition("P1", PdoState::Settled, TransitionKind::System, "s", "", None);

        assert_eq!(transitions_seen.load(Ordering::SeqCst), 3);
        assert_eq!(overrides_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_transitions_are_serialized() {
        let clock = Arc::new(ManualClock::new(0));
        let machine = Arc::new(PdoStateMachine::new(LedgerLimits::default(), clock));
        register(&machine, "shared");

        let accepted = AtomicUsize::new(0);
        thread::scope(|scope| {
            for worker in 0..16 {
                let machine = machine.clone();
                let accepted = &accepted;
                scope.spawn(move || {
                    let actor = format!("worker-{worker}");
                    let outcome = machine.transition(
                        "shared",
                        PdoState::Submitted,
                        TransitionKind::System,
                        &actor,
                        "",
                        None,
                    );
                    if outcome.is_ok() {
                        accepted.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        let metrics = machine.get_metrics();
        assert_eq!(metrics.transition_count, 1);
        assert_eq!(metrics.rejection_count, 15);
        assert_eq!(machine.get_transitions("shared").unwrap().len(), 1);
    }

    #[test]
    fn independent_pdos_progress_in_parallel() {
        let clock = Arc::new(ManualClock::new(0));
        let machine = Arc::new(PdoStateMachine::new(LedgerLimits::default(), clock));

        thread::scope(|scope| {
            for worker in 0..8 {
                let machine = machine.clone();
                scope.spawn(move || {
                    let id = format!("P{worker}");
                    register(&machine, &id);
                    for (to, kind) in [
                        (PdoState::Submitted, TransitionKind::System),
                        (PdoState::AgentApproved, TransitionKind::Agent),
                        (PdoState::PolicyApproved, TransitionKind::Policy),
                        (PdoState::Settled, TransitionKind::System),
                    ] {
                        machine.transition(&id, to, kind, "worker", "", None).unwrap();
                    }
                });
            }
        });

        let metrics = machine.get_metrics();
        assert_eq!(metrics.pdo_count, 8);
        assert_eq!(metrics.transition_count, 32);
        assert_eq!(machine.pdo_ids().len(), 8);
        assert!(machine.verify_all_hash_chains().values().all(|v| v.is_valid));
    }
}

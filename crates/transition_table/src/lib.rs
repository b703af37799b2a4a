#![forbid(unsafe_code)]

//! Static legality table for PDO transitions, indexed by the state enum.

use pdo_protocol::{PdoState, TransitionKind};

/// A legal `(target_state, transition_kind)` pair.
pub type LegalMove = (PdoState, TransitionKind);

const PENDING_MOVES: &[LegalMove] = &[
    (PdoState::Submitted, TransitionKind::System),
    (PdoState::Cancelled, TransitionKind::Operator),
    (PdoState::Cancelled, TransitionKind::System),
    (PdoState::Expired, TransitionKind::System),
];

const SUBMITTED_MOVES: &[LegalMove] = &[
    (PdoState::AgentApproved, TransitionKind::Agent),
    (PdoState::AgentBlocked, TransitionKind::Agent),
    (PdoState::Cancelled, TransitionKind::Operator),
    (PdoState::Expired, TransitionKind::System),
];

const AGENT_APPROVED_MOVES: &[LegalMove] = &[
    (PdoState::PolicyApproved, TransitionKind::Policy),
    (PdoState::PolicyBlocked, TransitionKind::Policy),
    (PdoState::OperatorBlocked, TransitionKind::Operator),
    (PdoState::Expired, TransitionKind::System),
];

const AGENT_BLOCKED_MOVES: &[LegalMove] = &[
    (PdoState::OperatorApproved, TransitionKind::Operator),
    (PdoState::OperatorBlocked, TransitionKind::Operator),
    (PdoState::Rejected, TransitionKind::System),
];

const POLICY_APPROVED_MOVES: &[LegalMove] = &[
    (PdoState::Settled, TransitionKind::System),
    (PdoState::OperatorBlocked, TransitionKind::Operator),
    (PdoState::Expired, TransitionKind::System),
];

const POLICY_BLOCKED_MOVES: &[LegalMove] = &[
    (PdoState::OperatorApproved, TransitionKind::Operator),
    (PdoState::Rejected, TransitionKind::System),
];

const OPERATOR_APPROVED_MOVES: &[LegalMove] = &[
    (PdoState::Settled, TransitionKind::System),
    (PdoState::Cancelled, TransitionKind::Operator),
];

const OPERATOR_BLOCKED_MOVES: &[LegalMove] = &[
    (PdoState::Rejected, TransitionKind::System),
    (PdoState::Cancelled, TransitionKind::Operator),
];

const NO_MOVES: &[LegalMove] = &[];

pub const TERMINAL_STATES: [PdoState; 4] = [
    PdoState::Settled,
    PdoState::Rejected,
    PdoState::Cancelled,
    PdoState::Expired,
];

/// Verdicts produced by automated authorities (agents and policy).
pub const AUTOMATED_DECISION_STATES: [PdoState; 4] = [
    PdoState::AgentApproved,
    PdoState::AgentBlocked,
    PdoState::PolicyApproved,
    PdoState::PolicyBlocked,
];

pub const OPERATOR_STATES: [PdoState; 2] = [PdoState::OperatorApproved, PdoState::OperatorBlocked];

/// Legal moves out of `state`. Terminal states return an empty slice.
pub const fn legal_transitions(state: PdoState) -> &'static [LegalMove] {
    match state {
        PdoState::Pending => PENDING_MOVES,
        PdoState::Submitted => SUBMITTED_MOVES,
        PdoState::AgentApproved => AGENT_APPROVED_MOVES,
        PdoState::AgentBlocked => AGENT_BLOCKED_MOVES,
        PdoState::PolicyApproved => POLICY_APPROVED_MOVES,
        PdoState::PolicyBlocked => POLICY_BLOCKED_MOVES,
        PdoState::OperatorApproved => OPERATOR_APPROVED_MOVES,
        PdoState::OperatorBlocked => OPERATOR_BLOCKED_MOVES,
        PdoState::Settled | PdoState::Rejected | PdoState::Cancelled | PdoState::Expired => {
            NO_MOVES
        }
    }
}

pub fn is_legal(from: PdoState, to: PdoState, kind: TransitionKind) -> bool {
    legal_transitions(from)
        .iter()
        .any(|(target, allowed_kind)| *target == to && *allowed_kind == kind)
}

pub const fn is_terminal_state(state: PdoState) -> bool {
    matches!(
        state,
        PdoState::Settled | PdoState::Rejected | PdoState::Cancelled | PdoState::Expired
    )
}

pub const fn is_automated_decision(state: PdoState) -> bool {
    matches!(
        state,
        PdoState::AgentApproved
            | PdoState::AgentBlocked
            | PdoState::PolicyApproved
            | PdoState::PolicyBlocked
    )
}

pub const fn is_operator_state(state: PdoState) -> bool {
    matches!(state, PdoState::OperatorApproved | PdoState::OperatorBlocked)
}

/// A human operator overturning an automated verdict.
///
/// This is a fixed rule over state pairs rather than a property of the table,
/// so new decision or operator states must be added here as well.
pub const fn is_override(from: PdoState, to: PdoState, kind: TransitionKind) -> bool {
    matches!(kind, TransitionKind::Operator)
        && is_automated_decision(from)
        && is_operator_state(to)
}

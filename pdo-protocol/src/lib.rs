#![forbid(unsafe_code)]

//! Data model shared by the PDO ledger, its replay engine, and the proof
//! lineage validator. Every enum carries a stable upper snake case identifier
//! because records cross process boundaries for independent audit.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use common::Digest;
use thiserror::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Lifecycle states of a Proof Decision Outcome.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PdoState {
    Pending,
    Submitted,
    AgentApproved,
    AgentBlocked,
    PolicyApproved,
    PolicyBlocked,
    OperatorApproved,
    OperatorBlocked,
    Settled,
    Rejected,
    Cancelled,
    Expired,
}

impl PdoState {
    pub const ALL: [PdoState; 12] = [
        PdoState::Pending,
        PdoState::Submitted,
        PdoState::AgentApproved,
        PdoState::AgentBlocked,
        PdoState::PolicyApproved,
        PdoState::PolicyBlocked,
        PdoState::OperatorApproved,
        PdoState::OperatorBlocked,
        PdoState::Settled,
        PdoState::Rejected,
        PdoState::Cancelled,
        PdoState::Expired,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            PdoState::Pending => "PENDING",
            PdoState::Submitted => "SUBMITTED",
            PdoState::AgentApproved => "AGENT_APPROVED",
            PdoState::AgentBlocked => "AGENT_BLOCKED",
            PdoState::PolicyApproved => "POLICY_APPROVED",
            PdoState::PolicyBlocked => "POLICY_BLOCKED",
            PdoState::OperatorApproved => "OPERATOR_APPROVED",
            PdoState::OperatorBlocked => "OPERATOR_BLOCKED",
            PdoState::Settled => "SETTLED",
            PdoState::Rejected => "REJECTED",
            PdoState::Cancelled => "CANCELLED",
            PdoState::Expired => "EXPIRED",
        }
    }
}

/// Originating authority of a state change.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransitionKind {
    Agent,
    Policy,
    Operator,
    System,
}

impl TransitionKind {
    pub const ALL: [TransitionKind; 4] = [
        TransitionKind::Agent,
        TransitionKind::Policy,
        TransitionKind::Operator,
        TransitionKind::System,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            TransitionKind::Agent => "AGENT",
            TransitionKind::Policy => "POLICY",
            TransitionKind::Operator => "OPERATOR",
            TransitionKind::System => "SYSTEM",
        }
    }
}

/// How much of a transition log a replay applies and what it reports.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplayMode {
    Full,
    PointInTime,
    Validate,
    Forensic,
}

impl ReplayMode {
    pub const ALL: [ReplayMode; 4] = [
        ReplayMode::Full,
        ReplayMode::PointInTime,
        ReplayMode::Validate,
        ReplayMode::Forensic,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            ReplayMode::Full => "FULL",
            ReplayMode::PointInTime => "POINT_IN_TIME",
            ReplayMode::Validate => "VALIDATE",
            ReplayMode::Forensic => "FORENSIC",
        }
    }
}

/// Findings reported by the proof lineage validator.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LineageViolationType {
    DuplicateProofId,
    HashMismatch,
    TimestampRegression,
    OrphanProof,
    ForwardOnlyViolated,
    MutationDetected,
    SequenceGap,
}

impl LineageViolationType {
    pub const ALL: [LineageViolationType; 7] = [
        LineageViolationType::DuplicateProofId,
        LineageViolationType::HashMismatch,
        LineageViolationType::TimestampRegression,
        LineageViolationType::OrphanProof,
        LineageViolationType::ForwardOnlyViolated,
        LineageViolationType::MutationDetected,
        LineageViolationType::SequenceGap,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            LineageViolationType::DuplicateProofId => "DUPLICATE_PROOF_ID",
            LineageViolationType::HashMismatch => "HASH_MISMATCH",
            LineageViolationType::TimestampRegression => "TIMESTAMP_REGRESSION",
            LineageViolationType::OrphanProof => "ORPHAN_PROOF",
            LineageViolationType::ForwardOnlyViolated => "FORWARD_ONLY_VIOLATED",
            LineageViolationType::MutationDetected => "MUTATION_DETECTED",
            LineageViolationType::SequenceGap => "SEQUENCE_GAP",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown {kind} identifier: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! impl_string_id {
    ($ty:ty, $label:literal) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                <$ty>::ALL
                    .iter()
                    .copied()
                    .find(|candidate| candidate.as_str() == s)
                    .ok_or_else(|| ParseEnumError {
                        kind: $label,
                        value: s.to_string(),
                    })
            }
        }
    };
}

impl_string_id!(PdoState, "pdo state");
impl_string_id!(TransitionKind, "transition kind");
impl_string_id!(ReplayMode, "replay mode");
impl_string_id!(LineageViolationType, "lineage violation");

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PdoValidationError {
    #[error("pdo id must not be empty")]
    MissingId,
    #[error("pdo value must be positive")]
    NonPositiveValue,
    #[error("invalid currency code: {0}")]
    InvalidCurrency(String),
    #[error("proof id must not be empty")]
    MissingProofId,
    #[error("proof sequence numbers start at 1")]
    ZeroSequence,
}

/// Validated registration request. The ledger assigns state and timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPdo {
    id: String,
    value: u64,
    currency: String,
    metadata: BTreeMap<String, String>,
}

impl NewPdo {
    /// `value` is expressed in minor units of `currency` (an ISO-4217 style code).
    pub fn new(
        id: impl Into<String>,
        value: u64,
        currency: impl Into<String>,
    ) -> Result<Self, PdoValidationError> {
        let id = id.into();
        let currency = currency.into();

        if id.trim().is_empty() {
            return Err(PdoValidationError::MissingId);
        }
        if value == 0 {
            return Err(PdoValidationError::NonPositiveValue);
        }
        if currency.len() != 3 || !currency.bytes().all(|b| b.is_ascii_uppercase()) {
            return Err(PdoValidationError::InvalidCurrency(currency));
        }

        Ok(Self {
            id,
            value,
            currency,
            metadata: BTreeMap::new(),
        })
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Materialize the record in its initial state.
    pub fn into_pending(self, now_ms: u64) -> Pdo {
        Pdo {
            id: self.id,
            value: self.value,
            currency: self.currency,
            current_state: PdoState::Pending,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            is_overridden: false,
            override_id: None,
            override_timestamp_ms: None,
            original_decision: None,
            original_operator_id: None,
            metadata: self.metadata,
        }
    }
}

/// A decision record owned by the ledger.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdo {
    pub id: String,
    pub value: u64,
    pub currency: String,
    pub current_state: PdoState,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    pub is_overridden: bool,
    pub override_id: Option<String>,
    pub override_timestamp_ms: Option<u64>,
    /// Automated verdict overturned by the latest override.
    pub original_decision: Option<PdoState>,
    /// Operator who issued the latest override.
    pub original_operator_id: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

/// Immutable, hash-chained record of one accepted state change.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdoTransition {
    pub id: String,
    pub pdo_id: String,
    pub from_state: PdoState,
    pub to_state: PdoState,
    pub transition_kind: TransitionKind,
    pub actor_id: String,
    pub timestamp_ms: u64,
    pub reason: String,
    pub is_override: bool,
    pub override_id: Option<String>,
    #[cfg_attr(feature = "serde", serde(with = "hex::serde"))]
    pub hash_previous: Digest,
    #[cfg_attr(feature = "serde", serde(with = "hex::serde"))]
    pub hash_current: Digest,
}

/// One link of a proof-artifact chain, produced outside the ledger.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofRecord {
    pub proof_id: String,
    #[cfg_attr(feature = "serde", serde(with = "hex::serde"))]
    pub chain_hash: Digest,
    #[cfg_attr(feature = "serde", serde(with = "hex::serde"))]
    pub previous_chain_hash: Digest,
    pub timestamp_ms: u64,
    #[cfg_attr(feature = "serde", serde(with = "hex::serde"))]
    pub content_hash: Digest,
    pub sequence_number: Option<u64>,
    pub attributes: BTreeMap<String, String>,
}

/// Field names understood by [`ProofRecord::field_value`].
pub const PROOF_FIELDS: &[&str] = &[
    "proof_id",
    "chain_hash",
    "previous_chain_hash",
    "timestamp_ms",
    "content_hash",
    "sequence_number",
    "attributes",
];

impl ProofRecord {
    pub fn new(
        proof_id: impl Into<String>,
        previous_chain_hash: Digest,
        chain_hash: Digest,
        timestamp_ms: u64,
        content_hash: Digest,
    ) -> Result<Self, PdoValidationError> {
        let proof_id = proof_id.into();
        if proof_id.trim().is_empty() {
            return Err(PdoValidationError::MissingProofId);
        }

        Ok(Self {
            proof_id,
            chain_hash,
            previous_chain_hash,
            timestamp_ms,
            content_hash,
            sequence_number: None,
            attributes: BTreeMap::new(),
        })
    }

    pub fn with_sequence(mut self, sequence_number: u64) -> Result<Self, PdoValidationError> {
        if sequence_number == 0 {
            return Err(PdoValidationError::ZeroSequence);
        }
        self.sequence_number = Some(sequence_number);
        Ok(self)
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Canonical string rendering of a named field, `None` for unknown names.
    pub fn field_value(&self, field: &str) -> Option<String> {
        let value = match field {
            "proof_id" => self.proof_id.clone(),
            "chain_hash" => hex::encode(self.chain_hash),
            "previous_chain_hash" => hex::encode(self.previous_chain_hash),
            "timestamp_ms" => self.timestamp_ms.to_string(),
            "content_hash" => hex::encode(self.content_hash),
            "sequence_number" => self
                .sequence_number
                .map(|seq| seq.to_string())
                .unwrap_or_default(),
            // netstring-style so no key or value can forge a separator
            "attributes" => self
                .attributes
                .iter()
                .map(|(k, v)| format!("{}:{k}{}:{v}", k.len(), v.len()))
                .collect(),
            _ => return None,
        };
        Some(value)
    }
}

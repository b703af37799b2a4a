#![forbid(unsafe_code)]

//! Continuity checks over proof-artifact chains.
//!
//! Every check collects all findings in a single pass and returns them as a
//! [`LineageValidationResult`]. Blocking a dependent action on a violation is
//! the caller's job; [`LineageValidationResult::ensure_valid`] is the strict
//! form for callers that want a `Result`.

use std::collections::{BTreeMap, HashSet};

use common::{domain_hasher, finalize, short_hex, to_hex, update_str, Digest, GENESIS};
use log::{debug, warn};
use pdo_protocol::{LineageViolationType, ProofRecord, PROOF_FIELDS};
use thiserror::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

const DOMAIN: &str = "PDO";
const SCHEMA: &str = "PROOF_LINEAGE";
const VERSION: &str = "v1";

/// Scalar fields that take part in the chain hash, followed by the
/// attribute map. The chain hashes themselves are excluded: the previous hash
/// is fed separately and the current one is the output.
const HASHED_FIELDS: [&str; 4] = ["proof_id", "timestamp_ms", "content_hash", "sequence_number"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineageConfig {
    /// Expected `previous_chain_hash` of the first proof.
    pub genesis_hash: Digest,
    /// Fields compared by [`ProofLineageValidator::detect_mutation`].
    pub immutable_fields: Vec<String>,
}

impl Default for LineageConfig {
    fn default() -> Self {
        Self {
            genesis_hash: GENESIS,
            immutable_fields: [
                "proof_id",
                "chain_hash",
                "previous_chain_hash",
                "timestamp_ms",
                "content_hash",
            ]
            .iter()
            .map(|field| field.to_string())
            .collect(),
        }
    }
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineageViolation {
    pub kind: LineageViolationType,
    pub index: usize,
    pub proof_id: String,
    pub detail: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LineageError {
    #[error("proof lineage broken at index {index} ({kind}): {detail}; {total} violation(s)")]
    Broken {
        index: usize,
        kind: LineageViolationType,
        detail: String,
        total: usize,
    },
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineageValidationResult {
    pub valid: bool,
    pub violations: Vec<LineageViolation>,
    pub chain_length: usize,
    pub first_break_at: Option<usize>,
    pub details: BTreeMap<String, String>,
}

impl LineageValidationResult {
    fn from_violations(
        violations: Vec<LineageViolation>,
        chain_length: usize,
        final_chain_hash: &Digest,
    ) -> Self {
        let first_break_at = violations.iter().map(|v| v.index).min();
        let details = BTreeMap::from([
            ("proof_count".to_string(), chain_length.to_string()),
            ("violation_count".to_string(), violations.len().to_string()),
            ("final_chain_hash".to_string(), to_hex(final_chain_hash)),
        ]);
        Self {
            valid: violations.is_empty(),
            violations,
            chain_length,
            first_break_at,
            details,
        }
    }

    pub fn has(&self, kind: LineageViolationType) -> bool {
        self.violations.iter().any(|v| v.kind == kind)
    }

    pub fn ensure_valid(&self) -> Result<(), LineageError> {
        match self.violations.iter().min_by_key(|v| v.index) {
            None => Ok(()),
            Some(first) => Err(LineageError::Broken {
                index: first.index,
                kind: first.kind,
                detail: first.detail.clone(),
                total: self.violations.len(),
            }),
        }
    }
}

/// Stateless validator; holds configuration only.
#[derive(Debug, Clone, Default)]
pub struct ProofLineageValidator {
    config: LineageConfig,
}

impl ProofLineageValidator {
    pub fn new(mut config: LineageConfig) -> Self {
        config.immutable_fields.retain(|field| {
            let known = PROOF_FIELDS.contains(&field.as_str());
            if !known {
                warn!("ignoring unknown immutable proof field {field}");
            }
            known
        });
        Self { config }
    }

    pub fn config(&self) -> &LineageConfig {
        &self.config
    }

    pub fn validate_chain(&self, chain: &[ProofRecord]) -> LineageValidationResult {
        let mut violations = Vec::new();
        let mut seen: HashSet<&str> = HashSet::with_capacity(chain.len());

        for (index, proof) in chain.iter().enumerate() {
            let previous = index.checked_sub(1).map(|i| &chain[i]);
            let push = |violations: &mut Vec<LineageViolation>, kind, detail| {
                violations.push(LineageViolation {
                    kind,
                    index,
                    proof_id: proof.proof_id.clone(),
                    detail,
                });
            };

            if !seen.insert(proof.proof_id.as_str()) {
                push(
                    &mut violations,
                    LineageViolationType::DuplicateProofId,
                    format!("proof id {} already appears earlier", proof.proof_id),
                );
            }

            let expected = previous.map_or(self.config.genesis_hash, |p| p.chain_hash);
            if proof.previous_chain_hash != expected {
                push(
                    &mut violations,
                    LineageViolationType::HashMismatch,
                    format!(
                        "previous_chain_hash {} does not match {}",
                        short_hex(&proof.previous_chain_hash),
                        short_hex(&expected)
                    ),
                );
            }

            if let Some(previous) = previous {
                if proof.timestamp_ms < previous.timestamp_ms {
                    push(
                        &mut violations,
                        LineageViolationType::TimestampRegression,
                        format!(
                            "timestamp {} precedes previous {}",
                            proof.timestamp_ms, previous.timestamp_ms
                        ),
                    );
                }
            }

            if let Some(detail) = sequence_gap(previous, proof) {
                push(&mut violations, LineageViolationType::SequenceGap, detail);
            }
        }

        let final_hash = chain.last().map_or(self.config.genesis_hash, |p| p.chain_hash);
        let result = LineageValidationResult::from_violations(violations, chain.len(), &final_hash);
        report("chain", &result);
        result
    }

    /// Check a single proof against the tail of an already validated chain.
    pub fn validate_append(
        &self,
        new_proof: &ProofRecord,
        existing_chain: &[ProofRecord],
    ) -> LineageValidationResult {
        let index = existing_chain.len();
        let tail = existing_chain.last();
        let mut violations = Vec::new();
        let mut push = |kind, detail| {
            violations.push(LineageViolation {
                kind,
                index,
                proof_id: new_proof.proof_id.clone(),
                detail,
            });
        };

        let tail_hash = tail.map_or(self.config.genesis_hash, |p| p.chain_hash);
        if new_proof.previous_chain_hash != tail_hash {
            push(
                LineageViolationType::OrphanProof,
                format!(
                    "previous_chain_hash {} does not reference chain tail {}",
                    short_hex(&new_proof.previous_chain_hash),
                    short_hex(&tail_hash)
                ),
            );
        }

        if let Some(tail) = tail {
            if new_proof.timestamp_ms < tail.timestamp_ms {
                push(
                    LineageViolationType::ForwardOnlyViolated,
                    format!(
                        "timestamp {} precedes chain tail {}",
                        new_proof.timestamp_ms, tail.timestamp_ms
                    ),
                );
            }
        }

        if existing_chain
            .iter()
            .any(|p| p.proof_id == new_proof.proof_id)
        {
            push(
                LineageViolationType::DuplicateProofId,
                format!("proof id {} already in chain", new_proof.proof_id),
            );
        }

        if let Some(detail) = sequence_gap(tail, new_proof) {
            push(LineageViolationType::SequenceGap, detail);
        }

        let result =
            LineageValidationResult::from_violations(violations, index + 1, &new_proof.chain_hash);
        report("append", &result);
        result
    }

    /// Compare `proof` with the stored copy over the configured immutable
    /// fields; one MUTATION_DETECTED per differing field.
    pub fn detect_mutation(
        &self,
        proof: &ProofRecord,
        stored_proof: &ProofRecord,
    ) -> LineageValidationResult {
        let violations: Vec<_> = self
            .config
            .immutable_fields
            .iter()
            .filter_map(|field| {
                let current = proof.field_value(field)?;
                let stored = stored_proof.field_value(field)?;
                let changed = match field.as_str() {
                    "attributes" => proof.attributes != stored_proof.attributes,
                    _ => current != stored,
                };
                changed.then(|| LineageViolation {
                    kind: LineageViolationType::MutationDetected,
                    index: 0,
                    proof_id: stored_proof.proof_id.clone(),
                    detail: format!("field {field} changed from {stored:?} to {current:?}"),
                })
            })
            .collect();

        let result =
            LineageValidationResult::from_violations(violations, 1, &stored_proof.chain_hash);
        report("mutation check", &result);
        result
    }

    /// Chain hash a producer should assign to `proof` when linking it after
    /// `previous_hash`.
    pub fn compute_chain_hash(proof: &ProofRecord, previous_hash: &Digest) -> Digest {
        let mut hasher = domain_hasher(DOMAIN, SCHEMA, VERSION);
        hasher.update(previous_hash);
        for field in HASHED_FIELDS {
            update_str(&mut hasher, field);
            update_str(&mut hasher, &proof.field_value(field).unwrap_or_default());
        }
        update_str(&mut hasher, "attributes");
        hasher.update(&(proof.attributes.len() as u64).to_le_bytes());
        for (key, value) in &proof.attributes {
            update_str(&mut hasher, key);
            update_str(&mut hasher, value);
        }
        finalize(hasher)
    }

    /// Recompute every `chain_hash` from the proof's own fields.
    pub fn verify_chain_hashes(&self, chain: &[ProofRecord]) -> LineageValidationResult {
        let violations = chain
            .iter()
            .enumerate()
            .filter_map(|(index, proof)| {
                let computed = Self::compute_chain_hash(proof, &proof.previous_chain_hash);
                (computed != proof.chain_hash).then(|| LineageViolation {
                    kind: LineageViolationType::HashMismatch,
                    index,
                    proof_id: proof.proof_id.clone(),
                    detail: format!(
                        "chain_hash {} does not match recomputed {}",
                        short_hex(&proof.chain_hash),
                        short_hex(&computed)
                    ),
                })
            })
            .collect();

        let final_hash = chain.last().map_or(self.config.genesis_hash, |p| p.chain_hash);
        let result = LineageValidationResult::from_violations(violations, chain.len(), &final_hash);
        report("hash recomputation", &result);
        result
    }
}

fn sequence_gap(previous: Option<&ProofRecord>, proof: &ProofRecord) -> Option<String> {
    let current = proof.sequence_number?;
    let expected = match previous {
        None => 1,
        Some(previous) => previous.sequence_number? + 1,
    };
    (current != expected).then(|| format!("sequence number {current}, expected {expected}"))
}

fn report(check: &str, result: &LineageValidationResult) {
    match result.first_break_at {
        None => debug!("proof lineage {check} passed over {} proof(s)", result.chain_length),
        Some(index) => warn!(
            "proof lineage {check} found {} violation(s), first at index {index}",
            result.violations.len()
        ),
    }
}

#![forbid(unsafe_code)]

//! Hash-chain codec binding each PDO transition to its predecessor.

use common::{domain_hasher, finalize, short_hex, update_str, Digest};
use pdo_protocol::{PdoState, PdoTransition};

pub use common::GENESIS;

const DOMAIN: &str = "PDO";
const SCHEMA: &str = "TRANSITION";
const VERSION: &str = "v1";

/// Digest over the chained fields of a transition.
///
/// Kind, reason and override flags are deliberately outside the digest; the
/// replay engine cross-checks them against the legality table instead.
pub fn compute_transition_hash(
    pdo_id: &str,
    from_state: PdoState,
    to_state: PdoState,
    actor_id: &str,
    timestamp_ms: u64,
    hash_previous: &Digest,
) -> Digest {
    let mut hasher = domain_hasher(DOMAIN, SCHEMA, VERSION);
    update_str(&mut hasher, pdo_id);
    update_str(&mut hasher, from_state.as_str());
    update_str(&mut hasher, to_state.as_str());
    update_str(&mut hasher, actor_id);
    hasher.update(&timestamp_ms.to_le_bytes());
    hasher.update(hash_previous);
    finalize(hasher)
}

/// Recompute `hash_current` for a stored record from its own fields.
pub fn recompute(transition: &PdoTransition) -> Digest {
    compute_transition_hash(
        &transition.pdo_id,
        transition.from_state,
        transition.to_state,
        &transition.actor_id,
        transition.timestamp_ms,
        &transition.hash_previous,
    )
}

/// First detected break in a transition chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainBreak {
    /// `hash_previous` does not point at the predecessor (or GENESIS).
    Link {
        index: usize,
        transition_id: String,
        expected: Digest,
        found: Digest,
    },
    /// Stored `hash_current` disagrees with the recomputed digest.
    Digest {
        index: usize,
        transition_id: String,
        stored: Digest,
        computed: Digest,
    },
}

impl ChainBreak {
    pub fn index(&self) -> usize {
        match self {
            ChainBreak::Link { index, .. } | ChainBreak::Digest { index, .. } => *index,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ChainBreak::Link {
                index,
                transition_id,
                expected,
                found,
            } => format!(
                "transition {transition_id} (index {index}) hash_previous {} \
                 does not match expected {}",
                short_hex(found),
                short_hex(expected)
            ),
            ChainBreak::Digest {
                index,
                transition_id,
                stored,
                computed,
            } => format!(
                "transition {transition_id} (index {index}) hash_current {} \
                 does not match recomputed {}",
                short_hex(stored),
                short_hex(computed)
            ),
        }
    }
}

/// Walk the chain once and return the first break, if any.
pub fn verify_chain(transitions: &[PdoTransition]) -> Result<(), ChainBreak> {
    let mut expected_previous = GENESIS;
    for (index, transition) in transitions.iter().enumerate() {
        if transition.hash_previous != expected_previous {
            return Err(ChainBreak::Link {
                index,
                transition_id: transition.id.clone(),
                expected: expected_previous,
                found: transition.hash_previous,
            });
        }

        let computed = recompute(transition);
        if computed != transition.hash_current {
            return Err(ChainBreak::Digest {
                index,
                transition_id: transition.id.clone(),
                stored: transition.hash_current,
                computed,
            });
        }

        expected_previous = transition.hash_current;
    }
    Ok(())
}

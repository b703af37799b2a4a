#![forbid(unsafe_code)]

use std::env;
use std::sync::Arc;

use anyhow::{ensure, Context, Result};
use ledger::{Clock, PdoStateMachine, SystemClock};
use limits::LedgerLimits;
use lineage::ProofLineageValidator;
use log::{error, info};
use pdo_protocol::{NewPdo, PdoState, PdoTransition, ProofRecord, ReplayMode, TransitionKind};
use replay::{PdoReplayEngine, ReplayConfig};

/// Apply `PDO_*` overrides on top of the defaults. Unparseable values are
/// ignored.
fn limits_from(lookup: impl Fn(&str) -> Option<String>) -> LedgerLimits {
    let read = |key: &str, default: usize| {
        lookup(key)
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(default)
    };
    let defaults = LedgerLimits::default();

    LedgerLimits {
        max_pdos: read("PDO_MAX_PDOS", defaults.max_pdos),
        max_transitions_per_pdo: read("PDO_MAX_TRANSITIONS", defaults.max_transitions_per_pdo),
        max_reason_bytes: read("PDO_MAX_REASON_BYTES", defaults.max_reason_bytes),
        max_trace_steps: read("PDO_MAX_TRACE_STEPS", defaults.max_trace_steps),
        determinism_runs: read("PDO_DETERMINISM_RUNS", defaults.determinism_runs),
    }
}

/// The three core services, built once at startup and passed by reference.
struct Services {
    machine: PdoStateMachine,
    replay: PdoReplayEngine,
    lineage: ProofLineageValidator,
}

impl Services {
    fn new(limits: LedgerLimits, clock: Arc<dyn Clock>) -> Self {
        let machine = PdoStateMachine::new(limits, clock).with_on_override(Box::new(
            |record: &PdoTransition| {
                info!(
                    "override {} recorded on {}",
                    record.override_id.as_deref().unwrap_or("-"),
                    record.pdo_id
                );
            },
        ));
        Self {
            machine,
            replay: PdoReplayEngine::new(ReplayConfig::from(limits)),
            lineage: ProofLineageValidator::default(),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
struct AuditSummary {
    pdos: usize,
    transitions: usize,
    overrides: usize,
    proofs: usize,
}

const DEMO_RUNS: [(&str, &[(PdoState, TransitionKind)]); 2] = [
    (
        "DEMO-SETTLE",
        &[
            (PdoState::Submitted, TransitionKind::System),
            (PdoState::AgentApproved, TransitionKind::Agent),
            (PdoState::PolicyApproved, TransitionKind::Policy),
            (PdoState::Settled, TransitionKind::System),
        ],
    ),
    (
        "DEMO-OVERRIDE",
        &[
            (PdoState::Submitted, TransitionKind::System),
            (PdoState::AgentBlocked, TransitionKind::Agent),
            (PdoState::OperatorApproved, TransitionKind::Operator),
            (PdoState::Settled, TransitionKind::System),
        ],
    ),
];

/// Drive the demo lifecycles, export each log as JSON, and audit the
/// re-imported copy with the replay engine and the lineage validator.
fn run_demo(services: &Services) -> Result<AuditSummary> {
    let mut proofs: Vec<ProofRecord> = Vec::new();

    for (pdo_id, path) in DEMO_RUNS {
        services
            .machine
            .register(NewPdo::new(pdo_id, 250_000, "USD")?.with_metadata("source", "demo"))?;
        for (to_state, kind) in path {
            services
                .machine
                .transition(pdo_id, *to_state, *kind, "demo-actor", "demo lifecycle", None)?;
        }

        let exported = serde_json::to_string(&services.machine.get_transitions(pdo_id)?)
            .context("exporting transition log")?;
        let imported: Vec<PdoTransition> =
            serde_json::from_str(&exported).context("importing transition log")?;

        let live = services
            .machine
            .get_pdo(pdo_id)
            .with_context(|| format!("pdo {pdo_id} vanished"))?;
        let result = services.replay.replay(
            pdo_id,
            &imported,
            ReplayMode::Validate,
            None,
            Some(live.current_state),
        );
        ensure!(result.success(), "replay of {pdo_id} failed: {:?}", result.errors);

        let verdict = services
            .replay
            .validate_replay_determinism(pdo_id, &imported, None);
        ensure!(
            verdict.deterministic,
            "replay of {pdo_id} is not deterministic: {:?}",
            verdict.diagnostic
        );

        // one proof per decision, citing the final transition hash
        let previous = proofs.last().map_or(common::GENESIS, |p| p.chain_hash);
        let mut proof = ProofRecord::new(
            format!("{pdo_id}:proof"),
            previous,
            common::GENESIS,
            live.updated_at_ms,
            result.final_hash,
        )?
        .with_sequence(proofs.len() as u64 + 1)?
        .with_attribute("pdo_id", pdo_id)
        .with_attribute("final_state", live.current_state.as_str());
        proof.chain_hash = ProofLineageValidator::compute_chain_hash(&proof, &previous);
        services.lineage.validate_append(&proof, &proofs).ensure_valid()?;
        proofs.push(proof);
    }

    services.lineage.validate_chain(&proofs).ensure_valid()?;
    services.lineage.verify_chain_hashes(&proofs).ensure_valid()?;

    let broken: Vec<_> = services
        .machine
        .verify_all_hash_chains()
        .into_iter()
        .filter(|(_, verdict)| !verdict.is_valid)
        .map(|(pdo_id, _)| pdo_id)
        .collect();
    ensure!(broken.is_empty(), "live hash chains broken: {broken:?}");

    let metrics = services.machine.get_metrics();
    info!(
        "ledger metrics: {}",
        serde_json::to_string(&metrics).context("serializing metrics")?
    );

    Ok(AuditSummary {
        pdos: metrics.pdo_count,
        transitions: metrics.transition_count,
        overrides: metrics.override_count,
        proofs: proofs.len(),
    })
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let limits = limits_from(|key| env::var(key).ok());
    info!("pdo ledger v{} starting with {:?}", env!("CARGO_PKG_VERSION"), limits);

    let services = Services::new(limits, Arc::new(SystemClock));
    match run_demo(&services) {
        Ok(summary) => info!(
            "audit passed: {} pdos, {} transitions, {} overrides, {} proofs",
            summary.pdos, summary.transitions, summary.overrides, summary.proofs
        ),
        Err(err) => {
            error!("audit failed: {err:#}");
            std::process::exit(1);
        }
    }
}

//! Structured lifecycle events for swarm runs.
//!
//! `run_span` scopes everything logged during a run to its `run_id`; the
//! `emit_*` functions log one event each with stable `event` names.

use tracing::{info, warn};

/// Span scoping everything logged during one run. Attach it to the run
/// future with `tracing::Instrument`.
pub fn run_span(run_id: &str, project: &str) -> tracing::Span {
    tracing::info_span!("aiswarm.run", run_id = %run_id, project = %project)
}

pub fn emit_run_started(run_id: &str, project: &str, provider: &str, agents: usize) {
    info!(
        event = "run.started",
        run_id = %run_id,
        project = %project,
        provider = %provider,
        agents = agents,
    );
}

pub fn emit_run_finished(run_id: &str, duration_ms: u64, healthy: usize, failed: usize, success: bool) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        healthy = healthy,
        failed = failed,
        success = success,
    );
}

/// An agent moved to a new stage of its pipeline.
pub fn emit_stage(agent: &str, stage: &str, detail: Option<&str>) {
    match detail {
        Some(detail) => info!(event = "agent.stage", agent = %agent, stage = %stage, detail = %detail),
        None => info!(event = "agent.stage", agent = %agent, stage = %stage),
    }
}

pub fn emit_build_finished(agent: &str, image: &str, cached: bool, duration_ms: u64) {
    info!(
        event = "build.finished",
        agent = %agent,
        image = %image,
        cached = cached,
        duration_ms = duration_ms,
    );
}

pub fn emit_retry(agent: &str, stage: &str, attempt: u32, error: &dyn std::fmt::Display) {
    warn!(event = "agent.retry", agent = %agent, stage = %stage, attempt = attempt, error = %error);
}

/// State could not be persisted; the run continues.
pub fn emit_state_persist_error(agent: &str, error: &dyn std::fmt::Display) {
    warn!(event = "state.persist_error", agent = %agent, error = %error);
}

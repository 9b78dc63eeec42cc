//! Text and JSON rendering of command results.

use std::collections::BTreeMap;

use anyhow::Result;
use clap::ValueEnum;
use serde_json::{json, Value};
use swarm_core::orchestrator::AgentBuild;
use swarm_core::{
    AgentOutcome, BuildReport, DriftReport, Project, ProviderError, RegistryEntry, RunPlan,
    RunReport, SmokeReport, StageEvent, TeardownReport,
};
use swarm_state::{DeploymentRecord, SwarmRunState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

/// One progress line per phase transition, on stderr.
pub fn stage_event(event: &StageEvent) {
    match &event.detail {
        Some(detail) => eprintln!("  {:<24} {:<9} {}", event.agent, event.phase.as_str(), detail),
        None => eprintln!("  {:<24} {}", event.agent, event.phase),
    }
}

fn outcome_json(outcome: &AgentOutcome) -> Value {
    json!({
        "agent": outcome.agent,
        "phase": outcome.phase,
        "image": outcome.image.as_ref().map(|i| i.tagged()),
        "cached": outcome.cached,
        "pushed": outcome.pushed.is_some(),
        "record": outcome.record,
        "apply_attempts": outcome.apply_attempts,
        "error": outcome.error.as_ref().map(|e| e.to_string()),
    })
}

pub fn run_report(format: OutputFormat, report: &RunReport) -> Result<()> {
    if format == OutputFormat::Json {
        return print_json(&json!({
            "run_id": report.run_id,
            "project": report.project,
            "provider": report.provider,
            "success": report.success(),
            "cancelled": report.cancelled,
            "duration_ms": report.duration.as_millis() as u64,
            "outcomes": report.outcomes.iter().map(outcome_json).collect::<Vec<_>>(),
            "persist_errors": report.persist_errors,
        }));
    }

    println!(
        "Deployment of '{}' to {} ({})",
        report.project, report.provider, report.run_id
    );
    println!();
    println!("{:<24} {:<9} {:<10} IMAGE", "AGENT", "PHASE", "REPLICAS");
    for outcome in &report.outcomes {
        let replicas = outcome
            .record
            .as_ref()
            .map(|r| format!("{}/{}", r.observed_replicas, r.desired_replicas))
            .unwrap_or_else(|| "-".to_string());
        let image = match &outcome.image {
            Some(image) if outcome.cached => format!("{} (cached)", image.tag),
            Some(image) => image.tag.clone(),
            None => "-".to_string(),
        };
        println!(
            "{:<24} {:<9} {:<10} {}",
            truncate(&outcome.agent, 24),
            outcome.phase.as_str(),
            replicas,
            image
        );
    }
    println!();

    let errors = report.errors();
    if !errors.is_empty() {
        println!("Errors:");
        for error in &errors {
            println!("  - {error}");
        }
        println!();
    }

    let verdict = if report.success() {
        "succeeded"
    } else if report.cancelled {
        "cancelled"
    } else if report.healthy() > 0 {
        "partially succeeded"
    } else {
        "failed"
    };
    println!(
        "Deployment {verdict}: {} healthy, {} failed in {:.1}s",
        report.healthy(),
        report.failed(),
        report.duration.as_secs_f64()
    );
    Ok(())
}

fn build_json(build: &AgentBuild) -> Value {
    json!({
        "agent": build.agent,
        "image": build.image.as_ref().map(|i| i.tagged()),
        "digest": build.image.as_ref().map(|i| i.digest.clone()),
        "cached": build.cached,
        "duration_ms": build.duration.as_millis() as u64,
        "pushed": build.pushed.is_some(),
        "error": build.error.as_ref().map(|e| e.to_string()),
    })
}

pub fn build_report(format: OutputFormat, report: &BuildReport) -> Result<()> {
    if format == OutputFormat::Json {
        return print_json(&json!({
            "success": report.success(),
            "cancelled": report.cancelled,
            "builds": report.builds.iter().map(build_json).collect::<Vec<_>>(),
            "persist_errors": report.persist_errors,
        }));
    }

    for build in &report.builds {
        match (&build.image, &build.error) {
            (_, Some(error)) => println!("✗ {}: {}", build.agent, error),
            (Some(image), None) => {
                let mut notes = Vec::new();
                if build.cached {
                    notes.push("cached");
                }
                if build.pushed.is_some() {
                    notes.push("pushed");
                }
                let notes = if notes.is_empty() {
                    String::new()
                } else {
                    format!(" ({})", notes.join(", "))
                };
                println!("✓ {}: {}{}", build.agent, image.tagged(), notes);
            }
            (None, None) => println!("? {}: no result", build.agent),
        }
    }
    for error in &report.persist_errors {
        println!("warning: state not saved: {error}");
    }
    Ok(())
}

pub fn plan(format: OutputFormat, plan: &RunPlan) -> Result<()> {
    if format == OutputFormat::Json {
        let steps: Vec<Value> = plan
            .steps
            .iter()
            .map(|s| {
                json!({
                    "agent": s.agent,
                    "replicas": s.replicas,
                    "depends_on": s.depends_on,
                    "recorded": s.recorded,
                })
            })
            .collect();
        return print_json(&json!({
            "project": plan.project,
            "provider": plan.provider,
            "steps": steps,
            "drift": drift_json(&plan.drift),
        }));
    }

    println!("Plan for '{}' on {} (dry run)", plan.project, plan.provider);
    println!();
    for (i, step) in plan.steps.iter().enumerate() {
        let recorded = step
            .recorded
            .map(|s| s.to_string())
            .unwrap_or_else(|| "new".to_string());
        let deps = if step.depends_on.is_empty() {
            String::new()
        } else {
            format!(" after {}", step.depends_on.join(", "))
        };
        println!(
            "  {}. {} x{} [{}]{}",
            i + 1,
            step.agent,
            step.replicas,
            recorded,
            deps
        );
    }
    print_drift(&plan.drift);
    Ok(())
}

fn drift_json(drift: &DriftReport) -> Value {
    json!({
        "undeclared": drift.undeclared,
        "unrecorded": drift.unrecorded,
    })
}

fn print_drift(drift: &DriftReport) {
    if drift.undeclared.is_empty() {
        return;
    }
    println!();
    println!(
        "Recorded but no longer declared: {} (remove with `aiswarm teardown --agent <name>`)",
        drift.undeclared.join(", ")
    );
}

pub fn teardown(format: OutputFormat, report: &TeardownReport) -> Result<()> {
    if format == OutputFormat::Json {
        let failed: Vec<Value> = report
            .failed
            .iter()
            .map(|(agent, e)| json!({ "agent": agent, "error": e.to_string() }))
            .collect();
        return print_json(&json!({
            "success": report.success(),
            "removed": report.removed,
            "already_absent": report.already_absent,
            "failed": failed,
            "persist_errors": report.persist_errors,
        }));
    }

    for agent in &report.removed {
        println!("Removed {agent}");
    }
    for agent in &report.already_absent {
        println!("{agent} was not deployed");
    }
    for (agent, error) in &report.failed {
        println!("Failed to remove {agent}: {error}");
    }
    for error in &report.persist_errors {
        println!("warning: state not saved: {error}");
    }
    Ok(())
}

pub fn agent_list(
    format: OutputFormat,
    project: &Project,
    state: &SwarmRunState,
    active: Option<&str>,
) -> Result<()> {
    if format == OutputFormat::Json {
        let agents: Vec<Value> = project
            .agents
            .iter()
            .map(|a| {
                json!({
                    "name": a.name,
                    "replicas": a.replicas,
                    "depends_on": a.depends_on,
                    "active": active == Some(a.name.as_str()),
                    "status": state.record(&a.name).map(|r| r.status),
                })
            })
            .collect();
        return print_json(&json!({ "project": project.name, "agents": agents }));
    }

    if project.agents.is_empty() {
        println!("No agents declared (create one with `aiswarm agent create <name>`)");
        return Ok(());
    }
    println!("{:<2}{:<24} {:<9} {:<10} DEPENDS ON", "", "AGENT", "REPLICAS", "STATUS");
    for agent in &project.agents {
        let marker = if active == Some(agent.name.as_str()) { "*" } else { "" };
        let status = state
            .record(&agent.name)
            .map(|r| r.status.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<2}{:<24} {:<9} {:<10} {}",
            marker,
            truncate(&agent.name, 24),
            agent.replicas,
            status,
            agent.depends_on.join(", ")
        );
    }
    Ok(())
}

pub fn smoke(format: OutputFormat, report: &SmokeReport) -> Result<()> {
    if format == OutputFormat::Json {
        return print_json(&json!({
            "agent": report.agent,
            "image": report.image.tagged(),
            "cached": report.cached,
            "status": report.record.status,
            "last_error": report.record.last_error,
            "cleaned_up": report.cleaned_up,
            "passed": report.passed(),
        }));
    }

    println!("Agent:  {}", report.agent);
    println!("Image:  {}", report.image.tagged());
    println!("Status: {}", report.record.status);
    if let Some(error) = &report.record.last_error {
        println!("Error:  {error}");
    }
    if !report.cleaned_up {
        println!("warning: the test replica could not be removed");
    }
    println!("{}", if report.passed() { "PASSED" } else { "FAILED" });
    Ok(())
}

pub fn registry_entries(format: OutputFormat, entries: &[RegistryEntry]) -> Result<()> {
    if format == OutputFormat::Json {
        return print_json(&serde_json::to_value(entries)?);
    }

    if entries.is_empty() {
        println!("No images found");
        return Ok(());
    }
    for entry in entries {
        let tag = entry
            .semantic_tag
            .as_deref()
            .map(|t| format!(" ({t})"))
            .unwrap_or_default();
        println!(
            "{}{}  {}  {}  {}",
            entry.image.tagged(),
            tag,
            entry.visibility,
            entry.pushed_at.format("%Y-%m-%d %H:%M:%S UTC"),
            entry.image.digest
        );
    }
    Ok(())
}

pub fn status(
    format: OutputFormat,
    project: &Project,
    state: &SwarmRunState,
    drift: &DriftReport,
    live: Option<&BTreeMap<String, std::result::Result<DeploymentRecord, ProviderError>>>,
) -> Result<()> {
    if format == OutputFormat::Json {
        let live = live.map(|live| {
            live.iter()
                .map(|(agent, result)| {
                    let value = match result {
                        Ok(record) => json!(record),
                        Err(e) => json!({ "error": e.to_string() }),
                    };
                    (agent.clone(), value)
                })
                .collect::<serde_json::Map<_, _>>()
        });
        return print_json(&json!({
            "project": project.name,
            "updated_at": state.updated_at,
            "records": state.records,
            "drift": drift_json(drift),
            "live": live,
        }));
    }

    println!("Project: {}", project.name);
    match state.updated_at {
        Some(at) => println!("Updated: {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
        None => println!("Updated: never deployed"),
    }
    println!();
    println!(
        "{:<24} {:<8} {:<10} {:<10} IMAGE",
        "AGENT", "PROVIDER", "STATUS", "REPLICAS"
    );
    for agent in project.agent_names() {
        match state.record(agent) {
            Some(record) => print_record(agent, record),
            None => println!("{:<24} {:<8} {:<10}", truncate(agent, 24), "-", "-"),
        }
    }

    if let Some(live) = live {
        println!();
        println!("Live:");
        for (agent, result) in live {
            match result {
                Ok(record) => print_record(agent, record),
                Err(e) => println!("{:<24} {}", truncate(agent, 24), e),
            }
        }
    }
    print_drift(drift);
    Ok(())
}

fn print_record(agent: &str, record: &DeploymentRecord) {
    println!(
        "{:<24} {:<8} {:<10} {:<10} {}",
        truncate(agent, 24),
        record.provider.as_str(),
        record.status.to_string(),
        format!("{}/{}", record.observed_replicas, record.desired_replicas),
        record.image.as_ref().map(|i| i.tag.as_str()).unwrap_or("-")
    );
    if let Some(error) = &record.last_error {
        println!("{:<24} └ {}", "", error);
    }
}

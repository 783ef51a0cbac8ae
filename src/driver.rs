//! Session driver: the public entry that wires config, state, adapters,
//! the orchestrator, learning, and git together for one task.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::adapter::{Adapter, CostTier, Role, default_adapters};
use crate::config::OrchestraConfig;
use crate::learning::{
    ActionRecord, Experience, ExperienceBuffer, RewardContext, RewardOutcome, TaskContext,
    compute_reward,
};
use crate::orchestrator::{Outcome, OutcomeStatus, PhaseOrchestrator, PlanReviewer, RoleChains};
use crate::rate::RateLedger;
use crate::state::StateManager;
use crate::state::session::Session;
use crate::tracker::GitTracker;

/// Run a new session for `task`. Fails (setup error) when a resumable
/// session already exists; the user must `resume` or `clean` first.
pub async fn run(task: &str, config: OrchestraConfig) -> Result<Outcome> {
    let adapters = default_adapters(&config);
    run_with_adapters(task, config, adapters, PlanReviewer::AutoApprove, false).await
}

/// Resume the most recent resumable session from its last checkpoint.
pub async fn resume(config: OrchestraConfig) -> Result<Outcome> {
    let manager = StateManager::load(config.orchestra_dir())
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    if !manager.can_resume() {
        bail!("no resumable session found");
    }
    let task = manager.session().task.clone();
    info!(
        session_id = %manager.session().session_id,
        phase = %manager.session().phase,
        "resuming session"
    );
    let adapters = default_adapters(&config);
    drive(
        task,
        config,
        adapters,
        PlanReviewer::AutoApprove,
        false,
        Some(manager),
    )
    .await
}

/// Architect only: print the plan, write no checkpoints.
pub async fn dry_run(task: &str, config: OrchestraConfig) -> Result<Outcome> {
    let adapters = default_adapters(&config);
    run_with_adapters(task, config, adapters, PlanReviewer::AutoApprove, true).await
}

/// Injectable variant used by tests and the `watch` command.
pub async fn run_with_adapters(
    task: &str,
    config: OrchestraConfig,
    adapters: Vec<Adapter>,
    reviewer: PlanReviewer,
    dry: bool,
) -> Result<Outcome> {
    if StateManager::exists(&config.orchestra_dir())
        && let Ok(existing) = StateManager::load(config.orchestra_dir())
        && existing.can_resume()
    {
        bail!(
            "A resumable session exists (phase {}, started {}). Run `orchestra resume` to continue it or `orchestra clean` to discard it.",
            existing.session().phase,
            existing.session().started_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }

    drive(task.to_string(), config, adapters, reviewer, dry, None).await
}

async fn drive(
    task: String,
    config: OrchestraConfig,
    adapters: Vec<Adapter>,
    reviewer: PlanReviewer,
    dry: bool,
    existing: Option<StateManager>,
) -> Result<Outcome> {
    let resume = existing.is_some();
    let manager = match existing {
        Some(manager) => manager,
        None => StateManager::init(&task, config.clone())?,
    };
    let state = Arc::new(Mutex::new(manager));
    let ledger = Arc::new(Mutex::new(RateLedger::load_or_default(
        config.rate_limits_path(),
    )?));

    let cancelled = Arc::new(AtomicBool::new(false));
    let cancel_flag = cancelled.clone();
    let signal_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("cancellation requested, finishing the current attempt...");
            cancel_flag.store(true, Ordering::SeqCst);
        }
    });

    let chains = RoleChains::from_registry(&adapters);
    let mut orchestrator = PhaseOrchestrator::new(
        config.clone(),
        chains,
        state.clone(),
        ledger,
        reviewer,
        cancelled,
    );
    if dry {
        orchestrator = orchestrator.dry_run();
    }

    let run_result = orchestrator.run(resume).await;
    signal_task.abort();

    // Only ExhaustedProviders, PlanMissing, and StateCorrupted surface
    // here; they are task failures, not setup errors, so the driver
    // returns an outcome instead of raising.
    let outcome = match run_result {
        Ok(outcome) => outcome,
        Err(err) => {
            let scratch = {
                let state = state.lock().await;
                state.scratch().root().display().to_string()
            };
            eprintln!("{err}. Session scratch preserved at {scratch} for post-mortem.");
            Outcome::with_reason(
                OutcomeStatus::Failed,
                crate::state::session::Phase::Failed,
                err.to_string(),
            )
        }
    };

    // Learning: one experience per session, regardless of outcome.
    if !dry && config.learning.mode.collects() {
        let state_guard = state.lock().await;
        if let Err(e) = collect_experience(&config, state_guard.session(), &adapters) {
            warn!("failed to record experience: {e}");
        }
    }

    // Archive the session for the history index.
    if !dry {
        let state_guard = state.lock().await;
        if let Err(e) = state_guard.archive() {
            warn!("failed to archive session: {e}");
        }
    }

    // Git integration: commit on success only, never push.
    if !dry && config.git.auto_commit && outcome.status == OutcomeStatus::Completed {
        match GitTracker::new(&config.workspace_dir) {
            Ok(tracker) => {
                if tracker.has_changes().unwrap_or(false) {
                    let message =
                        GitTracker::render_message(&config.git.commit_message_template, &task);
                    match tracker.commit_all(&message) {
                        Ok(sha) => info!(sha = %sha, "auto-committed session changes"),
                        Err(e) => warn!("auto-commit failed: {e}"),
                    }
                }
            }
            Err(_) => warn!("git.autoCommit is set but the workspace is not a git repository"),
        }
    }

    Ok(outcome)
}

/// Compute the reward from the finished session and append one experience.
fn collect_experience(
    config: &OrchestraConfig,
    session: &Session,
    adapters: &[Adapter],
) -> Result<()> {
    let tier_of = |model_id: &str| -> Option<CostTier> {
        adapters
            .iter()
            .find(|a| a.info.id == model_id)
            .map(|a| a.info.tier)
    };

    let all_attempts = session.workflow.iter().flat_map(|s| s.attempts.iter());
    let cheap_adapter_successes = all_attempts
        .clone()
        .filter(|a| a.success && tier_of(&a.model_id) == Some(CostTier::Cheap))
        .count() as u64;
    let expensive_adapter_usages = all_attempts
        .clone()
        .filter(|a| tier_of(&a.model_id) == Some(CostTier::Expensive))
        .count() as u64;

    let task_context = TaskContext::from_task(&session.task);
    let minimum_resources = session.files.len().max(1) as u64 + 2;
    let reward_context = RewardContext {
        estimated_minutes: task_context.estimated_minutes,
        minimum_resources,
    };
    let actual_minutes = (Utc::now() - session.started_at).num_seconds().max(0) as f64 / 60.0;
    let tests_passed = if config.test.run_after_generation
        && session.phase == crate::state::session::Phase::Completed
    {
        Some(true)
    } else {
        None
    };

    let reward_outcome = RewardOutcome {
        final_phase: session.phase,
        actual_minutes,
        resources_used: session.global_metrics.total_attempts,
        error_count: session.global_metrics.failed_attempts,
        post_generation_modifications: 0,
        safety_violations: 0,
        tests_passed,
        total_cost_usd: session.global_metrics.total_cost_estimate,
        cheap_adapter_successes,
        expensive_adapter_usages,
        fallback_rotations: session.global_metrics.fallback_rotations,
    };
    let reward = compute_reward(&reward_context, &reward_outcome);

    // First successful adapter per role, in workflow order.
    let mut chosen: Vec<(Role, String)> = Vec::new();
    for step in &session.workflow {
        if chosen.iter().any(|(role, _)| *role == step.agent_role) {
            continue;
        }
        if let Some(attempt) = step.attempts.iter().find(|a| a.success) {
            chosen.push((step.agent_role, attempt.model_id.clone()));
        }
    }
    let strategy = if config.execution.pipeline {
        "pipeline"
    } else if config.execution.parallel {
        "parallel"
    } else {
        "sequential"
    };

    let experience = Experience::new(
        task_context.feature_vector(),
        ActionRecord {
            adapters: chosen,
            strategy: strategy.to_string(),
        },
        &reward,
        task_context.task_type,
        task_context.domain,
    );

    let mut buffer = ExperienceBuffer::open(config.experience_path())
        .context("Failed to open experience buffer")?;
    buffer.append(experience)?;
    Ok(())
}

//! Concurrency-bounded file-generation scheduler.
//!
//! Files in the plan carry no inter-dependencies, so the pool is a plain
//! semaphore: permits are acquired in plan order before each worker is
//! spawned, which both bounds concurrency and fixes dispatch order. All
//! status updates funnel through the state-manager mutex; cross-file
//! ordering is otherwise undefined.
//!
//! In pipeline mode each validated file immediately gets its own auditor
//! call under the same permit pool, so file N+1 can start generating while
//! file N is still being audited.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use futures::future::join_all;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info, warn};

use crate::adapter::{FallbackChain, InvokeRequest};
use crate::events;
use crate::plan::FilePlanEntry;
use crate::prompts;
use crate::rate::RateLedger;
use crate::state::session::{
    AuditVerdict, FileStatus, StepStatus, WorkflowStep, content_hash,
};
use crate::state::StateManager;
use crate::validator;

/// Outcome for one file after the scheduler pass.
#[derive(Debug, Clone)]
pub struct FileOutcome {
    pub status: FileStatus,
    pub errors: Vec<String>,
    /// Worth retrying next iteration (validation reject or backpressure)
    pub recoverable: bool,
    /// The executor chain ran dry for this file
    pub exhausted: bool,
}

/// Everything a worker needs besides its file entry.
pub struct SchedulerContext {
    pub executor_chain: FallbackChain,
    /// Present only in pipeline mode
    pub auditor_chain: Option<FallbackChain>,
    pub ledger: Arc<Mutex<RateLedger>>,
    pub state: Arc<Mutex<StateManager>>,
    pub workspace_dir: PathBuf,
    pub scratch_dir: PathBuf,
    pub plan: String,
    pub feedback: Option<String>,
    pub solution: Option<String>,
    pub deadline: Duration,
    pub cancelled: Arc<AtomicBool>,
}

pub struct FileScheduler {
    concurrency: usize,
}

impl FileScheduler {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    /// Run the pool over the plan entries. Returns per-path outcomes keyed
    /// by path; files skipped due to cancellation are absent.
    pub async fn execute(
        &self,
        entries: &[FilePlanEntry],
        ctx: Arc<SchedulerContext>,
    ) -> Result<BTreeMap<PathBuf, FileOutcome>> {
        let workers = self.concurrency.min(entries.len().max(1));
        let semaphore = Arc::new(Semaphore::new(workers));
        let mut handles = Vec::with_capacity(entries.len());

        for entry in entries.iter().cloned() {
            if ctx.cancelled.load(Ordering::SeqCst) {
                break;
            }
            // Acquiring before spawning fixes dispatch order to plan order.
            let permit = semaphore.clone().acquire_owned().await?;
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let path = entry.path.clone();
                let outcome = run_worker(&entry, &ctx).await;
                (path, outcome)
            }));
        }

        let mut results = BTreeMap::new();
        for joined in join_all(handles).await {
            match joined {
                Ok((path, outcome)) => {
                    results.insert(path, outcome);
                }
                Err(e) => warn!("scheduler worker panicked: {e}"),
            }
        }
        Ok(results)
    }
}

/// One worker: generate, validate, optionally audit. Invariant
/// violations in the status chain surface as failed outcomes.
async fn run_worker(entry: &FilePlanEntry, ctx: &SchedulerContext) -> FileOutcome {
    match try_run_worker(entry, ctx).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(file = %entry.path.display(), "worker aborted: {e}");
            FileOutcome {
                status: FileStatus::Failed,
                errors: vec![e.to_string()],
                recoverable: false,
                exhausted: false,
            }
        }
    }
}

async fn try_run_worker(entry: &FilePlanEntry, ctx: &SchedulerContext) -> Result<FileOutcome> {
    let target = ctx.workspace_dir.join(&entry.path);
    let resume_partial = {
        let mut state = ctx.state.lock().await;
        let mut resume = false;
        state.try_update(|s| {
            if let Some(file) = s.file_mut(&entry.path) {
                resume = file.resume_partial;
                if file.status == FileStatus::Pending {
                    file.transition(FileStatus::Generating)?;
                } else {
                    file.begin_retry()?;
                }
            }
            Ok(())
        })?;
        resume
    };

    let prompt = prompts::executor_prompt(
        &ctx.plan,
        entry,
        &ctx.scratch_dir.join(crate::scratch::HELP_NEEDED_FILE),
        ctx.feedback.as_deref(),
        ctx.solution.as_deref(),
        resume_partial,
    );
    let request = InvokeRequest {
        prompt,
        working_dir: ctx.workspace_dir.clone(),
        deadline: ctx.deadline,
        expected_outputs: vec![target.clone()],
    };

    let step = WorkflowStep::start(ctx.executor_chain.role(), Some(entry.path.clone()));
    let step_id = {
        let mut state = ctx.state.lock().await;
        state.append_workflow_step(step)?
    };

    let chain_outcome = ctx.executor_chain.invoke(&request, &ctx.ledger).await;
    let generated = chain_outcome.winner.is_some();
    let context_exceeded = chain_outcome
        .attempts
        .iter()
        .any(|a| a.error_code == crate::state::session::AttemptErrorCode::ContextExceeded);

    record_chain(ctx, &step_id, &entry.path, &chain_outcome, generated).await;

    if !generated {
        // CONTEXT_EXCEEDED is backpressure: retry next iteration with an
        // explicit resume-from-partial flag.
        let recoverable = context_exceeded;
        {
            let mut state = ctx.state.lock().await;
            state.try_update(|s| {
                if let Some(file) = s.file_mut(&entry.path) {
                    file.transition(FileStatus::Failed)?;
                    file.recoverable = recoverable;
                    file.resume_partial = recoverable;
                }
                Ok(())
            })?;
        }
        if recoverable {
            info!(
                code = events::FILE_BACKPRESSURE,
                file = %entry.path.display(),
                "context exceeded, queued for partial resume"
            );
        }
        return Ok(FileOutcome {
            status: FileStatus::Failed,
            errors: vec!["executor chain exhausted".into()],
            recoverable,
            exhausted: !recoverable,
        });
    }

    // Validate
    {
        let mut state = ctx.state.lock().await;
        state.try_update(|s| {
            if let Some(file) = s.file_mut(&entry.path) {
                file.transition(FileStatus::Validating)?;
            }
            Ok(())
        })?;
    }
    let validation = validator::validate_file(&target, None).await;
    let hash = std::fs::read(&target).ok().map(|b| content_hash(&b));

    if !validation.valid {
        let errors = validation.errors.clone();
        {
            let mut state = ctx.state.lock().await;
            state.try_update(|s| {
                if let Some(file) = s.file_mut(&entry.path) {
                    file.transition(FileStatus::Rejected)?;
                    file.validation_result = Some(validation.clone());
                    file.content_hash = hash.clone();
                }
                Ok(())
            })?;
        }
        info!(
            code = events::VALIDATION_REJECTED,
            file = %entry.path.display(),
            errors = errors.len(),
            "validation rejected generated file"
        );
        return Ok(FileOutcome {
            status: FileStatus::Rejected,
            errors,
            recoverable: true,
            exhausted: false,
        });
    }

    {
        let mut state = ctx.state.lock().await;
        state.try_update(|s| {
            if let Some(file) = s.file_mut(&entry.path) {
                file.transition(FileStatus::Generated)?;
                file.validation_result = Some(validation.clone());
                file.content_hash = hash.clone();
                file.resume_partial = false;
                file.recoverable = false;
            }
            Ok(())
        })?;
    }

    // Pipeline mode: audit this file now, while other workers generate.
    if let Some(auditor_chain) = &ctx.auditor_chain {
        return audit_file(entry, ctx, auditor_chain).await;
    }

    Ok(FileOutcome {
        status: FileStatus::Generated,
        errors: vec![],
        recoverable: false,
        exhausted: false,
    })
}

/// Per-file audit for pipeline mode. Each file gets its own verdict file
/// next to the iteration-level `audit` scratch file.
async fn audit_file(
    entry: &FilePlanEntry,
    ctx: &SchedulerContext,
    auditor_chain: &FallbackChain,
) -> Result<FileOutcome> {
    {
        let mut state = ctx.state.lock().await;
        state.try_update(|s| {
            if let Some(file) = s.file_mut(&entry.path) {
                file.transition(FileStatus::Auditing)?;
            }
            Ok(())
        })?;
    }

    let sanitized = entry
        .path
        .to_string_lossy()
        .replace(['/', '\\'], "_");
    let audit_path = ctx.scratch_dir.join(format!("audit-{sanitized}"));
    let target = ctx.workspace_dir.join(&entry.path);
    let prompt = prompts::auditor_prompt(&ctx.plan, &[target.as_path()], &audit_path);
    let request = InvokeRequest {
        prompt,
        working_dir: ctx.workspace_dir.clone(),
        deadline: ctx.deadline,
        expected_outputs: vec![audit_path.clone()],
    };

    let step = WorkflowStep::start(auditor_chain.role(), Some(entry.path.clone()));
    let step_id = {
        let mut state = ctx.state.lock().await;
        state.append_workflow_step(step)?
    };

    let chain_outcome = auditor_chain.invoke(&request, &ctx.ledger).await;
    let audited = chain_outcome.winner.is_some();
    record_chain(ctx, &step_id, &entry.path, &chain_outcome, audited).await;

    let verdict = std::fs::read_to_string(&audit_path)
        .ok()
        .map(|content| crate::orchestrator::parse_audit_verdict(&content));
    let _ = std::fs::remove_file(&audit_path);

    let (status, verdict_value, errors) = match verdict {
        Some((AuditVerdict::Approved, _)) => (FileStatus::Approved, AuditVerdict::Approved, vec![]),
        Some((AuditVerdict::NeedsWork, feedback)) => {
            (FileStatus::Rejected, AuditVerdict::NeedsWork, vec![feedback])
        }
        None => (
            FileStatus::Rejected,
            AuditVerdict::NeedsWork,
            vec!["auditor produced no verdict".to_string()],
        ),
    };

    {
        let mut state = ctx.state.lock().await;
        state.try_update(|s| {
            if let Some(file) = s.file_mut(&entry.path) {
                file.transition(status)?;
                file.audit_verdict = Some(verdict_value);
            }
            Ok(())
        })?;
    }

    Ok(FileOutcome {
        status,
        errors,
        recoverable: status == FileStatus::Rejected,
        exhausted: false,
    })
}

/// Merge a chain outcome into the step, metrics, and file attempts.
async fn record_chain(
    ctx: &SchedulerContext,
    step_id: &str,
    path: &std::path::Path,
    outcome: &crate::adapter::chain::ChainOutcome,
    success: bool,
) {
    let mut state = ctx.state.lock().await;
    let _ = state.update(|s| {
        for attempt in &outcome.attempts {
            s.global_metrics.record_attempt(attempt);
        }
        for _ in 0..outcome.rotations {
            s.global_metrics.record_rotation();
        }
        if let Some(file) = s.file_mut(path) {
            file.attempts.extend(outcome.attempts.iter().cloned());
        }
        if let Some(step) = s.step_mut(step_id) {
            step.attempts.extend(outcome.attempts.iter().cloned());
            step.finish(if success {
                StepStatus::Completed
            } else {
                StepStatus::Failed
            });
        }
    });
}

//! The phase state machine.
//!
//! ```text
//! INIT → PLANNING → PLAN_REVIEW → EXECUTING →
//!   VALIDATING → AUDITING →
//!     APPROVED    → COMPLETED
//!     NEEDS_WORK  → (CONSULTING?) → EXECUTING (iteration+1)
//!     exhausted   → RECOVERY → EXECUTING | REVERTED | MAX_ITERATIONS
//! ```
//!
//! The orchestrator is single-threaded cooperative: it awaits one phase
//! before starting the next. Concurrency exists only inside EXECUTING via
//! the file scheduler. Cancellation is checked at phase boundaries; the
//! attempt in flight always runs to completion.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::adapter::{Adapter, FallbackChain, InvokeRequest, Role};
use crate::config::OrchestraConfig;
use crate::errors::EngineError;
use crate::events;
use crate::plan::{FilePlanEntry, parse_file_plan};
use crate::prompts;
use crate::rate::RateLedger;
use crate::scheduler::{FileScheduler, SchedulerContext};
use crate::scratch::ScratchArea;
use crate::state::StateManager;
use crate::state::session::{
    AuditVerdict, FileArtifact, FileStatus, Phase, StepStatus, WorkflowStep,
};
use crate::validator;

/// Parse the audit file contract: the first non-empty line is the verdict
/// token, everything after it is feedback. Unknown tokens are treated as
/// NEEDS_WORK with a generic feedback line.
pub fn parse_audit_verdict(content: &str) -> (AuditVerdict, String) {
    let mut lines = content.lines().skip_while(|l| l.trim().is_empty());
    let verdict_line = lines.next().map(|l| l.trim()).unwrap_or("");
    let feedback: String = lines.collect::<Vec<_>>().join("\n").trim().to_string();

    match verdict_line {
        "APPROVED" => (AuditVerdict::Approved, feedback),
        "NEEDS_WORK" => (AuditVerdict::NeedsWork, feedback),
        other => {
            warn!(
                code = events::AUDIT_VERDICT_UNPARSEABLE,
                verdict = other,
                "audit verdict unparseable, treating as NEEDS_WORK"
            );
            (
                AuditVerdict::NeedsWork,
                "auditor output did not start with a recognized verdict; regenerate and address the plan".to_string(),
            )
        }
    }
}

/// How the plan-review gate decides. Interactive review needs an attached
/// collaborator (a TTY); headless runs auto-approve.
pub enum PlanReviewer {
    AutoApprove,
    Interactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanDecision {
    Approved,
    Rejected,
}

impl PlanReviewer {
    pub fn review(&self, plan: &str) -> Result<PlanDecision> {
        match self {
            PlanReviewer::AutoApprove => Ok(PlanDecision::Approved),
            PlanReviewer::Interactive => {
                use dialoguer::{Select, theme::ColorfulTheme};
                println!("\n{}\n", plan);
                let choice = Select::with_theme(&ColorfulTheme::default())
                    .with_prompt("Plan review")
                    .items(&["Approve", "Reject"])
                    .default(0)
                    .interact()?;
                Ok(if choice == 0 {
                    PlanDecision::Approved
                } else {
                    PlanDecision::Rejected
                })
            }
        }
    }
}

/// The chains for the four roles.
pub struct RoleChains {
    pub architect: FallbackChain,
    pub executor: FallbackChain,
    pub auditor: FallbackChain,
    pub consultant: FallbackChain,
}

impl RoleChains {
    pub fn from_registry(registry: &[Adapter]) -> Self {
        Self {
            architect: FallbackChain::for_role(Role::Architect, registry),
            executor: FallbackChain::for_role(Role::Executor, registry),
            auditor: FallbackChain::for_role(Role::Auditor, registry),
            consultant: FallbackChain::for_role(Role::Consultant, registry),
        }
    }
}

/// Final status the driver maps to an exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    Completed,
    Failed,
    MaxIterations,
    Reverted,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct Outcome {
    pub status: OutcomeStatus,
    pub reason: Option<String>,
    pub final_phase: Phase,
}

impl Outcome {
    pub fn new(status: OutcomeStatus, final_phase: Phase) -> Self {
        Self {
            status,
            reason: None,
            final_phase,
        }
    }

    pub fn with_reason(status: OutcomeStatus, final_phase: Phase, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: Some(reason.into()),
            final_phase,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self.status {
            OutcomeStatus::Completed => 0,
            OutcomeStatus::Cancelled => 3,
            _ => 1,
        }
    }
}

pub struct PhaseOrchestrator {
    config: OrchestraConfig,
    chains: RoleChains,
    state: Arc<Mutex<StateManager>>,
    ledger: Arc<Mutex<RateLedger>>,
    scratch: ScratchArea,
    reviewer: PlanReviewer,
    cancelled: Arc<AtomicBool>,
    started: Instant,
    /// Architect only; print the plan, no checkpoints, no execution
    dry_run: bool,
    consecutive_needs_work: u32,
    last_approved_checkpoint: Option<String>,
    solution: Option<String>,
    feedback: Option<String>,
}

impl PhaseOrchestrator {
    pub fn new(
        config: OrchestraConfig,
        chains: RoleChains,
        state: Arc<Mutex<StateManager>>,
        ledger: Arc<Mutex<RateLedger>>,
        reviewer: PlanReviewer,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        let scratch = ScratchArea::new(config.orchestra_dir());
        Self {
            config,
            chains,
            state,
            ledger,
            scratch,
            reviewer,
            cancelled,
            started: Instant::now(),
            dry_run: false,
            consecutive_needs_work: 0,
            last_approved_checkpoint: None,
            solution: None,
            feedback: None,
        }
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    fn deadline(&self) -> Duration {
        Duration::from_millis(self.config.execution.timeout)
    }

    fn wall_clock_expired(&self) -> bool {
        self.started.elapsed()
            > Duration::from_secs(self.config.session_wall_clock_minutes * 60)
    }

    async fn set_phase(&self, phase: Phase) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        state.set_phase(phase).map_err(EngineError::Other)
    }

    /// Cancellation wins over everything at a phase boundary.
    async fn check_cancelled(&self) -> Result<(), EngineError> {
        if self.cancelled.load(Ordering::SeqCst) {
            let mut state = self.state.lock().await;
            state.set_phase(Phase::Cancelled).map_err(EngineError::Other)?;
            state
                .update(|s| s.can_resume = true)
                .map_err(EngineError::Other)?;
            info!(code = events::SESSION_CANCELLED, "session cancelled, state persisted");
            return Err(EngineError::UserCancelled);
        }
        Ok(())
    }

    /// Drive the machine to a terminal phase. `resume` skips phases that
    /// already concluded in the loaded session.
    pub async fn run(&mut self, resume: bool) -> Result<Outcome, EngineError> {
        match self.run_inner(resume).await {
            Ok(outcome) => Ok(outcome),
            Err(EngineError::UserCancelled) => Ok(Outcome::new(
                OutcomeStatus::Cancelled,
                Phase::Cancelled,
            )),
            Err(err) => {
                let fatal = err.is_fatal();
                let mut state = self.state.lock().await;
                let _ = state.record_error(err.to_string(), fatal);
                let _ = state.set_phase(Phase::Failed);
                Err(err)
            }
        }
    }

    async fn run_inner(&mut self, resume: bool) -> Result<Outcome, EngineError> {
        let has_plan = {
            let state = self.state.lock().await;
            state.session().plan.is_some()
        };

        if !(resume && has_plan) {
            self.check_cancelled().await?;
            self.planning().await?;

            if self.dry_run {
                // A dry run leaves no session to resume or block on.
                let mut state = self.state.lock().await;
                state
                    .update(|s| s.can_resume = false)
                    .map_err(EngineError::Other)?;
                return Ok(Outcome::new(OutcomeStatus::Completed, Phase::Planning));
            }

            self.check_cancelled().await?;
            if self.plan_review().await? == PlanDecision::Rejected {
                let mut state = self.state.lock().await;
                state
                    .update(|s| {
                        s.phase = Phase::Failed;
                        s.can_resume = false;
                    })
                    .map_err(EngineError::Other)?;
                return Ok(Outcome::with_reason(
                    OutcomeStatus::Failed,
                    Phase::Failed,
                    "plan rejected by collaborator",
                ));
            }
        }

        let start_iteration = if resume {
            let state = self.state.lock().await;
            state.session().iteration.max(1)
        } else {
            1
        };

        let max_iterations = self.config.execution.max_iterations;
        let mut iteration = start_iteration;

        loop {
            self.check_cancelled().await?;
            if self.wall_clock_expired() {
                info!(code = events::WALL_CLOCK_EXPIRED, "session wall clock expired");
                let mut state = self.state.lock().await;
                state.record_error("session wall clock exceeded".into(), false)
                    .map_err(EngineError::Other)?;
                state.set_phase(Phase::Failed).map_err(EngineError::Other)?;
                return Ok(Outcome::with_reason(
                    OutcomeStatus::Failed,
                    Phase::Failed,
                    "session wall clock exceeded",
                ));
            }

            {
                let mut state = self.state.lock().await;
                state.set_iteration(iteration).map_err(EngineError::Other)?;
            }

            self.executing(iteration).await?;
            self.check_cancelled().await?;

            match self.auditing(iteration).await? {
                AuditVerdict::Approved => {
                    if let Some(outcome) = self.finish_approved().await? {
                        return Ok(outcome);
                    }
                    // test gate failed: treated as NEEDS_WORK below
                }
                AuditVerdict::NeedsWork => {}
            }

            self.consecutive_needs_work += 1;
            if iteration < max_iterations {
                iteration += 1;
                continue;
            }

            // Iteration budget spent.
            return self.recovery_or_max(iteration).await;
        }
    }

    /// PLANNING: architect writes the plan file; success requires it to
    /// exist and be non-empty.
    async fn planning(&mut self) -> Result<(), EngineError> {
        self.set_phase(Phase::Planning).await?;
        let (task, plan_path) = {
            let state = self.state.lock().await;
            (state.session().task.clone(), self.scratch.plan_path())
        };

        let prompt = prompts::architect_prompt(&task, &plan_path);
        self.invoke_role(Role::Architect, prompt, vec![plan_path.clone()], self.deadline())
            .await?;

        let plan = self
            .scratch
            .read_plan()
            .ok_or(EngineError::PlanMissing { path: plan_path })?;

        let mut state = self.state.lock().await;
        state.set_plan(plan).map_err(EngineError::Other)?;
        if !self.dry_run {
            let checkpoint = state.create_checkpoint("plan").map_err(EngineError::Other)?;
            self.last_approved_checkpoint = Some(checkpoint.id);
        }
        Ok(())
    }

    /// PLAN_REVIEW: collaborator gate, auto-approve when headless.
    async fn plan_review(&mut self) -> Result<PlanDecision, EngineError> {
        self.set_phase(Phase::PlanReview).await?;
        let plan = {
            let state = self.state.lock().await;
            state.session().plan.clone().unwrap_or_default()
        };
        self.reviewer.review(&plan).map_err(EngineError::Other)
    }

    /// EXECUTING: scheduler pass over the files needing work, then the
    /// optional CONSULTING detour.
    async fn executing(&mut self, iteration: u32) -> Result<(), EngineError> {
        self.set_phase(Phase::Executing).await?;

        let plan = {
            let state = self.state.lock().await;
            state.session().plan.clone().unwrap_or_default()
        };
        let entries = self.sync_artifacts(&plan).await?;

        if entries.is_empty() {
            // Empty file plan: fall straight through to AUDITING.
            let mut state = self.state.lock().await;
            state
                .create_checkpoint(&format!("exec-{iteration}"))
                .map_err(EngineError::Other)?;
            return Ok(());
        }

        self.run_scheduler(&plan, &entries).await?;

        // One consult per iteration at most.
        if self.scratch.read_help_needed().is_some() {
            self.consulting().await?;
            let retry = self.pending_entries().await;
            if !retry.is_empty() {
                self.set_phase(Phase::Executing).await?;
                self.run_scheduler(&plan, &retry).await?;
            }
        }

        let mut state = self.state.lock().await;
        state
            .create_checkpoint(&format!("exec-{iteration}"))
            .map_err(EngineError::Other)?;
        Ok(())
    }

    /// Reconcile session artifacts with the plan and return the entries
    /// that need generation this iteration.
    async fn sync_artifacts(&self, plan: &str) -> Result<Vec<FilePlanEntry>, EngineError> {
        let planned = parse_file_plan(plan);
        let mut state = self.state.lock().await;
        let mut todo = Vec::new();
        state
            .update(|s| {
                for entry in &planned {
                    if s.file_mut(&entry.path).is_none() {
                        s.files
                            .push(FileArtifact::new(entry.path.clone(), entry.action));
                    }
                }
                for entry in &planned {
                    if let Some(file) = s.file_mut(&entry.path) {
                        let needs_work = matches!(
                            file.status,
                            FileStatus::Pending | FileStatus::Rejected
                        ) || (file.status == FileStatus::Failed && file.recoverable);
                        if needs_work {
                            todo.push(entry.clone());
                        }
                    }
                }
            })
            .map_err(EngineError::Other)?;
        Ok(todo)
    }

    /// Entries still unfinished after a consult.
    async fn pending_entries(&self) -> Vec<FilePlanEntry> {
        let state = self.state.lock().await;
        state
            .session()
            .files
            .iter()
            .filter(|f| {
                matches!(f.status, FileStatus::Pending | FileStatus::Rejected)
                    || (f.status == FileStatus::Failed && f.recoverable)
            })
            .map(|f| FilePlanEntry {
                path: f.path.clone(),
                action: f.action,
            })
            .collect()
    }

    async fn run_scheduler(
        &self,
        plan: &str,
        entries: &[FilePlanEntry],
    ) -> Result<(), EngineError> {
        let auditor_chain = if self.config.execution.pipeline && self.config.audit_enabled {
            Some(self.chains.auditor.clone())
        } else {
            None
        };
        let ctx = Arc::new(SchedulerContext {
            executor_chain: self.chains.executor.clone(),
            auditor_chain,
            ledger: self.ledger.clone(),
            state: self.state.clone(),
            workspace_dir: self.config.workspace_dir.clone(),
            scratch_dir: self.scratch.root().to_path_buf(),
            plan: plan.to_string(),
            feedback: self.feedback.clone(),
            solution: self.solution.clone(),
            deadline: self.deadline(),
            cancelled: self.cancelled.clone(),
        });

        let scheduler = FileScheduler::new(self.config.concurrency());
        let results = scheduler
            .execute(entries, ctx)
            .await
            .map_err(EngineError::Other)?;

        if results.values().any(|r| r.exhausted) {
            return Err(EngineError::ExhaustedProviders {
                role: Role::Executor,
            });
        }
        Ok(())
    }

    /// CONSULTING: feed the help-needed file to the consultant, collect the
    /// solution, delete the request.
    async fn consulting(&mut self) -> Result<(), EngineError> {
        self.set_phase(Phase::Consulting).await?;
        let help = self.scratch.read_help_needed().unwrap_or_default();
        info!(code = events::CONSULTANT_INVOKED, "executor raised a blocker");

        let solution_path = self.scratch.solution_path();
        let prompt = prompts::consultant_prompt(&help, &solution_path);
        let deadline = Duration::from_millis(self.config.consultant_timeout);
        self.invoke_role(Role::Consultant, prompt, vec![solution_path], deadline)
            .await?;

        self.solution = self.scratch.read_solution();
        self.scratch
            .consume_help_needed()
            .map_err(EngineError::Other)?;
        Ok(())
    }

    /// VALIDATING marker then AUDITING: verdict for this iteration.
    async fn auditing(&mut self, iteration: u32) -> Result<AuditVerdict, EngineError> {
        self.set_phase(Phase::Validating).await?;
        self.set_phase(Phase::Auditing).await?;

        let verdict = if !self.config.audit_enabled {
            std::fs::write(self.scratch.audit_path(), "APPROVED\n")
                .map_err(|e| EngineError::Other(e.into()))?;
            (AuditVerdict::Approved, String::new())
        } else if self.config.execution.pipeline && self.files_have_verdicts().await {
            self.aggregate_pipeline_verdicts().await?
        } else {
            self.invoke_auditor().await?
        };

        {
            let mut state = self.state.lock().await;
            let checkpoint = state
                .create_checkpoint(&format!("audit-{iteration}"))
                .map_err(EngineError::Other)?;
            if verdict.0 == AuditVerdict::Approved {
                self.last_approved_checkpoint = Some(checkpoint.id);
            }
        }

        match verdict.0 {
            AuditVerdict::Approved => {
                self.feedback = None;
                Ok(AuditVerdict::Approved)
            }
            AuditVerdict::NeedsWork => {
                info!(
                    code = events::AUDIT_NEEDS_WORK,
                    iteration,
                    "audit requested another iteration"
                );
                // Rejected files must re-enter generation next iteration.
                let mut state = self.state.lock().await;
                state
                    .try_update(|s| {
                        for file in &mut s.files {
                            if matches!(file.status, FileStatus::Generated | FileStatus::Auditing) {
                                file.transition(FileStatus::Rejected)?;
                                file.audit_verdict = Some(AuditVerdict::NeedsWork);
                            }
                        }
                        Ok(())
                    })
                    .map_err(EngineError::Other)?;
                self.feedback = Some(verdict.1);
                Ok(AuditVerdict::NeedsWork)
            }
        }
    }

    async fn files_have_verdicts(&self) -> bool {
        let state = self.state.lock().await;
        let files = &state.session().files;
        !files.is_empty() && files.iter().all(|f| f.audit_verdict.is_some())
    }

    /// Pipeline mode already audited per file; synthesize the iteration
    /// verdict from those results and record it in the audit scratch file.
    async fn aggregate_pipeline_verdicts(&self) -> Result<(AuditVerdict, String), EngineError> {
        let state = self.state.lock().await;
        let files = &state.session().files;
        let rejected: Vec<String> = files
            .iter()
            .filter(|f| f.audit_verdict == Some(AuditVerdict::NeedsWork))
            .map(|f| format!("{}: rejected by per-file audit", f.path.display()))
            .collect();
        drop(state);

        let (verdict, body) = if rejected.is_empty() {
            (AuditVerdict::Approved, "APPROVED\n".to_string())
        } else {
            (
                AuditVerdict::NeedsWork,
                format!("NEEDS_WORK\n{}\n", rejected.join("\n")),
            )
        };
        std::fs::write(self.scratch.audit_path(), &body)
            .map_err(|e| EngineError::Other(e.into()))?;
        let feedback = body.lines().skip(1).collect::<Vec<_>>().join("\n");
        Ok((verdict, feedback))
    }

    async fn invoke_auditor(&mut self) -> Result<(AuditVerdict, String), EngineError> {
        let (plan, changed): (String, Vec<PathBuf>) = {
            let state = self.state.lock().await;
            let session = state.session();
            let changed = session
                .files
                .iter()
                .filter(|f| {
                    matches!(
                        f.status,
                        FileStatus::Generated | FileStatus::Auditing | FileStatus::Approved
                    )
                })
                .map(|f| self.config.workspace_dir.join(&f.path))
                .collect();
            (session.plan.clone().unwrap_or_default(), changed)
        };

        {
            let mut state = self.state.lock().await;
            state
                .try_update(|s| {
                    for file in &mut s.files {
                        if file.status == FileStatus::Generated {
                            file.transition(FileStatus::Auditing)?;
                        }
                    }
                    Ok(())
                })
                .map_err(EngineError::Other)?;
        }

        let audit_path = self.scratch.audit_path();
        let changed_refs: Vec<&std::path::Path> = changed.iter().map(|p| p.as_path()).collect();
        let prompt = prompts::auditor_prompt(&plan, &changed_refs, &audit_path);
        self.invoke_role(Role::Auditor, prompt, vec![audit_path.clone()], self.deadline())
            .await?;

        let content = self.scratch.read_audit().unwrap_or_default();
        Ok(parse_audit_verdict(&content))
    }

    /// APPROVED path: optional test gate, then COMPLETED.
    async fn finish_approved(&mut self) -> Result<Option<Outcome>, EngineError> {
        if self.config.test.run_after_generation {
            let command = match &self.config.test.command {
                Some(cmd) => Some(cmd.clone()),
                None => validator::detect_test_framework(&self.config.workspace_dir)
                    .map(|f| f.command().to_string()),
            };
            if let Some(command) = command {
                let result = validator::run_tests(
                    &command,
                    &self.config.workspace_dir,
                    Duration::from_millis(self.config.execution.timeout),
                )
                .await;
                if !result.success {
                    // A failing test gate is audit feedback like any other.
                    self.feedback = Some(format!("tests failed:\n{}", result.output));
                    let mut state = self.state.lock().await;
                    state
                        .try_update(|s| {
                            for file in &mut s.files {
                                if matches!(
                                    file.status,
                                    FileStatus::Generated | FileStatus::Auditing
                                ) {
                                    file.transition(FileStatus::Rejected)?;
                                }
                            }
                            Ok(())
                        })
                        .map_err(EngineError::Other)?;
                    return Ok(None);
                }
            }
        }

        let mut state = self.state.lock().await;
        state
            .try_update(|s| {
                for file in &mut s.files {
                    // Pipeline-audited files arrive already approved.
                    if file.status.can_transition_to(FileStatus::Approved) {
                        file.transition(FileStatus::Approved)?;
                    }
                    if file.status == FileStatus::Approved {
                        file.audit_verdict = Some(AuditVerdict::Approved);
                    }
                }
                s.phase = Phase::Completed;
                s.can_resume = false;
                Ok(())
            })
            .map_err(EngineError::Other)?;
        Ok(Some(Outcome::new(OutcomeStatus::Completed, Phase::Completed)))
    }

    /// Budget spent: escalate into recovery when audits failed repeatedly,
    /// otherwise conclude MAX_ITERATIONS.
    async fn recovery_or_max(&mut self, iteration: u32) -> Result<Outcome, EngineError> {
        if self.consecutive_needs_work < 2 {
            return self.conclude_max_iterations(iteration).await;
        }

        let recovery_deadline =
            Duration::from_secs(self.config.tui.recovery_timeout_minutes * 60);
        let recovery_started = Instant::now();
        let mut recovery_attempts: u32 = 0;

        loop {
            recovery_attempts += 1;
            let out_of_budget = recovery_attempts > self.config.tui.max_recovery_attempts
                || recovery_started.elapsed() > recovery_deadline;
            if out_of_budget {
                return if self.config.tui.auto_revert_on_failure {
                    self.revert().await
                } else {
                    self.conclude_max_iterations(iteration).await
                };
            }

            self.check_cancelled().await?;
            self.set_phase(Phase::Recovery).await?;
            info!(
                code = events::RECOVERY_STARTED,
                attempt = recovery_attempts,
                "recovery pass"
            );
            self.force_regeneration_of_incomplete().await?;

            self.executing(iteration).await?;
            if self.auditing(iteration).await? == AuditVerdict::Approved
                && let Some(outcome) = self.finish_approved().await?
            {
                return Ok(outcome);
            }
            self.consecutive_needs_work += 1;
        }
    }

    /// Recovery sweep: any generated file flagged incomplete is reset for a
    /// full regeneration.
    async fn force_regeneration_of_incomplete(&self) -> Result<(), EngineError> {
        let paths: Vec<PathBuf> = {
            let state = self.state.lock().await;
            state
                .session()
                .files
                .iter()
                .filter(|f| !matches!(f.status, FileStatus::Pending))
                .map(|f| f.path.clone())
                .collect()
        };

        let mut incomplete = Vec::new();
        for path in paths {
            let absolute = self.config.workspace_dir.join(&path);
            if let Ok(content) = std::fs::read_to_string(&absolute) {
                let language = validator::detect_language(&absolute);
                if !validator::check_completeness(&content, language).is_empty() {
                    incomplete.push(path);
                }
            }
        }

        if incomplete.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        state
            .update(|s| {
                for path in &incomplete {
                    if let Some(file) = s.file_mut(path) {
                        file.force_regenerate();
                    }
                }
            })
            .map_err(EngineError::Other)
    }

    /// REVERTED: restore the latest approved checkpoint byte-for-byte.
    async fn revert(&mut self) -> Result<Outcome, EngineError> {
        let mut state = self.state.lock().await;
        if let Some(id) = &self.last_approved_checkpoint
            && let Some(checkpoint) = state.checkpoint_by_id(id).cloned()
        {
            state
                .restore_checkpoint(&checkpoint)
                .map_err(EngineError::Other)?;
            info!(
                code = events::SESSION_REVERTED,
                checkpoint = %checkpoint.id,
                "workspace scratch restored from checkpoint"
            );
        }
        state
            .update(|s| {
                s.phase = Phase::Reverted;
                s.can_resume = false;
            })
            .map_err(EngineError::Other)?;
        Ok(Outcome::with_reason(
            OutcomeStatus::Reverted,
            Phase::Reverted,
            "recovery budget exhausted, reverted to last approved checkpoint",
        ))
    }

    async fn conclude_max_iterations(&self, iteration: u32) -> Result<Outcome, EngineError> {
        let mut state = self.state.lock().await;
        state
            .update(|s| s.phase = Phase::MaxIterations)
            .map_err(EngineError::Other)?;
        Ok(Outcome::with_reason(
            OutcomeStatus::MaxIterations,
            Phase::MaxIterations,
            format!("no approval after {iteration} iterations"),
        ))
    }

    /// Invoke one role chain, recording the step, attempts, and metrics.
    async fn invoke_role(
        &self,
        role: Role,
        prompt: String,
        expected_outputs: Vec<PathBuf>,
        deadline: Duration,
    ) -> Result<(), EngineError> {
        let chain = match role {
            Role::Architect => &self.chains.architect,
            Role::Executor => &self.chains.executor,
            Role::Auditor => &self.chains.auditor,
            Role::Consultant => &self.chains.consultant,
        };

        let step = WorkflowStep::start(role, None);
        let step_id = {
            let mut state = self.state.lock().await;
            state
                .append_workflow_step(step)
                .map_err(EngineError::Other)?
        };

        let request = InvokeRequest {
            prompt,
            working_dir: self.config.workspace_dir.clone(),
            deadline,
            expected_outputs: expected_outputs.clone(),
        };
        let outcome = chain.invoke(&request, &self.ledger).await;
        let success = outcome.winner.is_some();
        let output_hash = expected_outputs
            .first()
            .and_then(|p| std::fs::read(p).ok())
            .map(|b| crate::state::session::content_hash(&b));

        {
            let mut state = self.state.lock().await;
            state
                .update(|s| {
                    for attempt in &outcome.attempts {
                        s.global_metrics.record_attempt(attempt);
                    }
                    for _ in 0..outcome.rotations {
                        s.global_metrics.record_rotation();
                    }
                    if let Some(step) = s.step_mut(&step_id) {
                        step.attempts.extend(outcome.attempts.iter().cloned());
                        step.output_hash = output_hash.clone();
                        step.finish(if success {
                            StepStatus::Completed
                        } else {
                            StepStatus::Failed
                        });
                    }
                })
                .map_err(EngineError::Other)?;
        }

        if !success {
            return Err(EngineError::ExhaustedProviders { role });
        }
        Ok(())
    }
}

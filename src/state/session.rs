//! Session document model.
//!
//! One [`Session`] owns everything produced by one user task: the file
//! artifacts, the append-only workflow ledger, running metrics, and
//! checkpoint references. Entities refer to each other by id, never by
//! pointer; lookups resolve through the session document.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::adapter::{Provider, Role};
use crate::config::OrchestraConfig;
use crate::errors::ProviderErrorKind;

/// The orchestrator state machine's current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    Planning,
    PlanReview,
    Executing,
    Consulting,
    Validating,
    Auditing,
    Recovery,
    Completed,
    MaxIterations,
    Reverted,
    Cancelled,
    Failed,
}

impl Phase {
    /// Terminal phases admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Phase::Completed
                | Phase::MaxIterations
                | Phase::Reverted
                | Phase::Cancelled
                | Phase::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::Planning => "planning",
            Phase::PlanReview => "plan_review",
            Phase::Executing => "executing",
            Phase::Consulting => "consulting",
            Phase::Validating => "validating",
            Phase::Auditing => "auditing",
            Phase::Recovery => "recovery",
            Phase::Completed => "completed",
            Phase::MaxIterations => "max_iterations",
            Phase::Reverted => "reverted",
            Phase::Cancelled => "cancelled",
            Phase::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileAction {
    Create,
    Modify,
}

/// Lifecycle of one file artifact.
///
/// Statuses are monotone along
/// pending→generating→generated→validating→auditing→approved, with the
/// single retry exception rejected→generating and the terminal escape
/// hatch to failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Generating,
    Generated,
    Validating,
    Auditing,
    Approved,
    Rejected,
    Failed,
}

impl FileStatus {
    fn rank(&self) -> u8 {
        match self {
            FileStatus::Pending => 0,
            FileStatus::Generating => 1,
            FileStatus::Validating => 2,
            FileStatus::Generated => 3,
            FileStatus::Auditing => 4,
            FileStatus::Approved => 5,
            FileStatus::Rejected => 5,
            FileStatus::Failed => 6,
        }
    }

    /// Whether moving to `next` respects the lifecycle chain.
    pub fn can_transition_to(&self, next: FileStatus) -> bool {
        match (self, next) {
            (FileStatus::Rejected, FileStatus::Generating) => true,
            (FileStatus::Failed, _) => false,
            (_, FileStatus::Failed) => true,
            (a, b) => b.rank() > a.rank(),
        }
    }
}

/// Error code recorded on an attempt; `None` marks success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptErrorCode {
    RateLimit,
    ContextExceeded,
    Timeout,
    ApiError,
    None,
}

impl From<Option<ProviderErrorKind>> for AttemptErrorCode {
    fn from(kind: Option<ProviderErrorKind>) -> Self {
        match kind {
            Some(ProviderErrorKind::RateLimit) => AttemptErrorCode::RateLimit,
            Some(ProviderErrorKind::ContextExceeded) => AttemptErrorCode::ContextExceeded,
            Some(ProviderErrorKind::Timeout) => AttemptErrorCode::Timeout,
            Some(ProviderErrorKind::ApiError) => AttemptErrorCode::ApiError,
            None => AttemptErrorCode::None,
        }
    }
}

/// One adapter invocation for one step. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attempt {
    pub model_id: String,
    pub provider: Provider,
    pub role: Role,
    pub tokens_used: u64,
    pub latency_ms: u64,
    pub success: bool,
    pub error_code: AttemptErrorCode,
    pub estimated_cost_usd: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed)
    }
}

/// One logical phase execution, appended to the session and never edited
/// after reaching a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    pub id: String,
    pub agent_role: Role,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
    pub attempts: Vec<Attempt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_hash: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: u64,
}

impl WorkflowStep {
    pub fn start(agent_role: Role, file_path: Option<PathBuf>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            agent_role,
            status: StepStatus::Running,
            file_path,
            attempts: Vec::new(),
            output_hash: None,
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: 0,
        }
    }

    pub fn finish(&mut self, status: StepStatus) {
        debug_assert!(!self.status.is_terminal(), "workflow step finished twice");
        let now = Utc::now();
        self.status = status;
        self.duration_ms = (now - self.started_at).num_milliseconds().max(0) as u64;
        self.ended_at = Some(now);
    }
}

/// Result of the syntax probe, stored on the artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationOutcome {
    pub valid: bool,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditVerdict {
    Approved,
    NeedsWork,
}

/// An artifact the executor must write.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileArtifact {
    pub path: PathBuf,
    pub action: FileAction,
    pub status: FileStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_result: Option<ValidationOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_verdict: Option<AuditVerdict>,
    pub attempts: Vec<Attempt>,
    /// Set by the scheduler when a failure is worth retrying next iteration
    #[serde(default)]
    pub recoverable: bool,
    /// Next generation prompt should ask to resume from partial content
    #[serde(default)]
    pub resume_partial: bool,
}

impl FileArtifact {
    pub fn new(path: PathBuf, action: FileAction) -> Self {
        Self {
            path,
            action,
            status: FileStatus::Pending,
            content_hash: None,
            validation_result: None,
            audit_verdict: None,
            attempts: Vec::new(),
            recoverable: false,
            resume_partial: false,
        }
    }

    /// Move to `next`, enforcing the lifecycle chain. Every status write
    /// outside the named retry/recovery paths goes through here.
    pub fn transition(&mut self, next: FileStatus) -> anyhow::Result<()> {
        if !self.status.can_transition_to(next) {
            anyhow::bail!(
                "illegal file status transition {:?} -> {:?} for {}",
                self.status,
                next,
                self.path.display()
            );
        }
        self.status = next;
        Ok(())
    }

    /// Re-enter generation for a new attempt cycle. Legal only from
    /// `Rejected` or from a `Failed` artifact carrying the recoverable
    /// backpressure flag.
    pub fn begin_retry(&mut self) -> anyhow::Result<()> {
        match self.status {
            FileStatus::Rejected => {}
            FileStatus::Failed if self.recoverable => {}
            other => anyhow::bail!(
                "cannot retry {} from status {:?}",
                self.path.display(),
                other
            ),
        }
        self.status = FileStatus::Generating;
        Ok(())
    }

    /// Recovery sweep: queue the artifact for a full regeneration.
    /// Non-recoverable `Failed` artifacts are terminal and left alone.
    pub fn force_regenerate(&mut self) {
        if self.status == FileStatus::Failed && !self.recoverable {
            return;
        }
        self.status = FileStatus::Rejected;
        self.resume_partial = false;
        self.recoverable = false;
    }
}

/// Running aggregate over all attempts in the session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalMetrics {
    pub total_cost_estimate: f64,
    pub total_tokens: u64,
    pub total_attempts: u64,
    pub successful_attempts: u64,
    pub failed_attempts: u64,
    pub fallback_rotations: u64,
    pub avg_latency_ms: f64,
}

impl GlobalMetrics {
    pub fn record_attempt(&mut self, attempt: &Attempt) {
        let prev_total = self.total_attempts as f64;
        self.total_attempts += 1;
        if attempt.success {
            self.successful_attempts += 1;
        } else {
            self.failed_attempts += 1;
        }
        self.total_tokens += attempt.tokens_used;
        self.total_cost_estimate += attempt.estimated_cost_usd;
        self.avg_latency_ms = (self.avg_latency_ms * prev_total + attempt.latency_ms as f64)
            / self.total_attempts as f64;
    }

    pub fn record_rotation(&mut self) {
        self.fallback_rotations += 1;
    }
}

/// Reference to a durable checkpoint directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointRef {
    /// Three-digit zero-padded monotone id
    pub id: String,
    pub label: String,
    pub phase: Phase,
    pub dir: PathBuf,
    pub copied_paths: Vec<PathBuf>,
}

/// Last error recorded on the session, with fatality for `canResume`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionError {
    pub message: String,
    pub fatal: bool,
}

/// One user task, owned end to end.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub task: String,
    pub phase: Phase,
    pub iteration: u32,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub config: OrchestraConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    pub files: Vec<FileArtifact>,
    pub workflow: Vec<WorkflowStep>,
    pub global_metrics: GlobalMetrics,
    pub can_resume: bool,
    #[serde(default)]
    pub last_error: Option<SessionError>,
    pub checkpoints: Vec<CheckpointRef>,
}

impl Session {
    /// New session for a task. Ids are UUIDv7 so history sorts by time.
    pub fn new(task: impl Into<String>, config: OrchestraConfig) -> Self {
        let now = Utc::now();
        Self {
            session_id: uuid::Uuid::now_v7().to_string(),
            task: task.into(),
            phase: Phase::Init,
            iteration: 1,
            started_at: now,
            last_activity: now,
            config,
            plan: None,
            files: Vec::new(),
            workflow: Vec::new(),
            global_metrics: GlobalMetrics::default(),
            can_resume: true,
            last_error: None,
            checkpoints: Vec::new(),
        }
    }

    pub fn file_mut(&mut self, path: &std::path::Path) -> Option<&mut FileArtifact> {
        self.files.iter_mut().find(|f| f.path == path)
    }

    pub fn step_mut(&mut self, id: &str) -> Option<&mut WorkflowStep> {
        self.workflow.iter_mut().find(|s| s.id == id)
    }

    /// Next checkpoint id, zero-padded to three digits.
    pub fn next_checkpoint_id(&self) -> String {
        format!("{:03}", self.checkpoints.len() + 1)
    }
}

/// Hex SHA-256 of a byte slice, used for content and output hashes.
pub fn content_hash(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_terminality() {
        assert!(Phase::Completed.is_terminal());
        assert!(Phase::Reverted.is_terminal());
        assert!(Phase::Cancelled.is_terminal());
        assert!(!Phase::Executing.is_terminal());
        assert!(!Phase::Recovery.is_terminal());
    }

    #[test]
    fn file_status_chain_is_monotone() {
        assert!(FileStatus::Pending.can_transition_to(FileStatus::Generating));
        assert!(FileStatus::Generating.can_transition_to(FileStatus::Validating));
        assert!(FileStatus::Auditing.can_transition_to(FileStatus::Approved));
        assert!(!FileStatus::Approved.can_transition_to(FileStatus::Generating));
        assert!(!FileStatus::Generated.can_transition_to(FileStatus::Pending));
    }

    #[test]
    fn rejected_may_retry_and_failed_is_terminal() {
        assert!(FileStatus::Rejected.can_transition_to(FileStatus::Generating));
        assert!(FileStatus::Auditing.can_transition_to(FileStatus::Failed));
        assert!(!FileStatus::Failed.can_transition_to(FileStatus::Generating));
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let mut file = FileArtifact::new(PathBuf::from("a.py"), FileAction::Create);
        file.transition(FileStatus::Generating).unwrap();
        let err = file.transition(FileStatus::Pending).unwrap_err();
        assert!(err.to_string().contains("illegal file status transition"));
    }

    #[test]
    fn begin_retry_requires_rejection_or_recoverable_failure() {
        let mut file = FileArtifact::new(PathBuf::from("a.py"), FileAction::Create);
        assert!(file.begin_retry().is_err());

        file.status = FileStatus::Rejected;
        file.begin_retry().unwrap();
        assert_eq!(file.status, FileStatus::Generating);

        file.status = FileStatus::Failed;
        file.recoverable = false;
        assert!(file.begin_retry().is_err());
        file.recoverable = true;
        file.begin_retry().unwrap();
        assert_eq!(file.status, FileStatus::Generating);
    }

    #[test]
    fn force_regenerate_spares_terminal_failures() {
        let mut file = FileArtifact::new(PathBuf::from("a.py"), FileAction::Create);
        file.status = FileStatus::Approved;
        file.resume_partial = true;
        file.force_regenerate();
        assert_eq!(file.status, FileStatus::Rejected);
        assert!(!file.resume_partial);

        file.status = FileStatus::Failed;
        file.recoverable = false;
        file.force_regenerate();
        assert_eq!(file.status, FileStatus::Failed);
    }

    #[test]
    fn metrics_track_attempt_counts_and_latency() {
        let mut metrics = GlobalMetrics::default();
        let mut attempt = Attempt {
            model_id: "glm".into(),
            provider: Provider::Glm,
            role: Role::Executor,
            tokens_used: 100,
            latency_ms: 200,
            success: true,
            error_code: AttemptErrorCode::None,
            estimated_cost_usd: 0.01,
            timestamp: Utc::now(),
        };
        metrics.record_attempt(&attempt);
        attempt.success = false;
        attempt.error_code = AttemptErrorCode::Timeout;
        attempt.latency_ms = 400;
        metrics.record_attempt(&attempt);

        assert_eq!(metrics.total_attempts, 2);
        assert_eq!(metrics.successful_attempts, 1);
        assert_eq!(metrics.failed_attempts, 1);
        assert_eq!(metrics.total_tokens, 200);
        assert!((metrics.avg_latency_ms - 300.0).abs() < f64::EPSILON);
    }

    #[test]
    fn workflow_step_finish_records_duration() {
        let mut step = WorkflowStep::start(Role::Architect, None);
        assert_eq!(step.status, StepStatus::Running);
        step.finish(StepStatus::Completed);
        assert!(step.status.is_terminal());
        assert!(step.ended_at.is_some());
    }

    #[test]
    fn session_ids_are_monotone_sortable() {
        let config = OrchestraConfig::default();
        let a = Session::new("first", config.clone());
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = Session::new("second", config);
        assert!(a.session_id < b.session_id);
    }

    #[test]
    fn checkpoint_ids_are_zero_padded() {
        let mut session = Session::new("t", OrchestraConfig::default());
        assert_eq!(session.next_checkpoint_id(), "001");
        session.checkpoints.push(CheckpointRef {
            id: "001".into(),
            label: "plan".into(),
            phase: Phase::Planning,
            dir: PathBuf::from("x"),
            copied_paths: vec![],
        });
        assert_eq!(session.next_checkpoint_id(), "002");
    }

    #[test]
    fn attempt_error_code_serializes_screaming_snake() {
        let json = serde_json::to_string(&AttemptErrorCode::RateLimit).unwrap();
        assert_eq!(json, "\"RATE_LIMIT\"");
        let json = serde_json::to_string(&AttemptErrorCode::None).unwrap();
        assert_eq!(json, "\"NONE\"");
    }

    #[test]
    fn session_serializes_with_camel_case_schema_keys() {
        let session = Session::new("demo task", OrchestraConfig::default());
        let value = serde_json::to_value(&session).unwrap();
        assert!(value.get("sessionId").is_some());
        assert!(value.get("startedAt").is_some());
        assert!(value.get("lastActivity").is_some());
        assert!(value.get("globalMetrics").is_some());
        assert!(value.get("canResume").is_some());
    }
}

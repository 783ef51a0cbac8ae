//! Durable session state: the document model and its single-writer manager.

pub mod manager;
pub mod session;

pub use manager::StateManager;
pub use session::{
    Attempt, AttemptErrorCode, AuditVerdict, CheckpointRef, FileAction, FileArtifact, FileStatus,
    GlobalMetrics, Phase, Session, SessionError, StepStatus, ValidationOutcome, WorkflowStep,
    content_hash,
};

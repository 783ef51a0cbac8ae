//! Single-writer state manager.
//!
//! Every mutation rewrites `.orchestra/state.json` whole, fsync then
//! rename, so a crash can never leave a half-written document. Checkpoints
//! copy the scratch role files into `checkpoints/{NNN-label}/` at phase
//! boundaries; completed sessions are archived under `sessions/<id>/`.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::info;

use crate::errors::EngineError;
use crate::events;
use crate::scratch::ScratchArea;

use super::session::{CheckpointRef, Phase, Session, SessionError, WorkflowStep};

#[derive(Debug)]
pub struct StateManager {
    scratch: ScratchArea,
    session: Session,
}

impl StateManager {
    /// Start a fresh session for a task. Role files from any previous
    /// session are cleared; checkpoints and history are kept until `clean`.
    pub fn init(task: &str, config: crate::config::OrchestraConfig) -> Result<Self> {
        let scratch = ScratchArea::new(config.orchestra_dir());
        scratch.ensure()?;
        scratch.clear_role_files()?;
        let session = Session::new(task, config);
        let mut manager = Self { scratch, session };
        manager.persist()?;
        Ok(manager)
    }

    /// Load the current session from disk, failing with `StateCorrupted`
    /// when the document does not match the schema.
    pub fn load(orchestra_dir: PathBuf) -> Result<Self, EngineError> {
        let scratch = ScratchArea::new(orchestra_dir);
        let path = scratch.state_path();
        let content = std::fs::read_to_string(&path).map_err(|e| EngineError::StateCorrupted {
            path: path.clone(),
            reason: format!("unreadable: {e}"),
        })?;
        let session: Session =
            serde_json::from_str(&content).map_err(|e| EngineError::StateCorrupted {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        if session.session_id.is_empty() || session.task.is_empty() {
            return Err(EngineError::StateCorrupted {
                path,
                reason: "missing sessionId or task".into(),
            });
        }
        Ok(Self { scratch, session })
    }

    pub fn exists(orchestra_dir: &Path) -> bool {
        orchestra_dir.join("state.json").exists()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn scratch(&self) -> &ScratchArea {
        &self.scratch
    }

    /// Apply a mutation and persist. The closure is the only way callers
    /// touch the document, which keeps writes totally ordered.
    pub fn update<F>(&mut self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut Session),
    {
        mutate(&mut self.session);
        self.persist()
    }

    /// Fallible variant of [`Self::update`] for mutations that enforce a
    /// document invariant, e.g. file-status transitions. Nothing is
    /// persisted when the closure errors.
    pub fn try_update<F>(&mut self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut Session) -> Result<()>,
    {
        mutate(&mut self.session)?;
        self.persist()
    }

    pub fn set_phase(&mut self, phase: Phase) -> Result<()> {
        let from = self.session.phase;
        info!(
            code = events::PHASE_TRANSITION,
            from = %from,
            to = %phase,
            iteration = self.session.iteration,
            "phase transition"
        );
        self.update(|s| s.phase = phase)
    }

    pub fn set_iteration(&mut self, iteration: u32) -> Result<()> {
        self.update(|s| s.iteration = iteration)
    }

    pub fn set_plan(&mut self, plan: String) -> Result<()> {
        self.update(|s| s.plan = Some(plan))
    }

    pub fn record_error(&mut self, message: String, fatal: bool) -> Result<()> {
        self.update(|s| {
            s.last_error = Some(SessionError { message, fatal });
            if fatal {
                s.can_resume = false;
            }
        })
    }

    /// Append a workflow step and return its id for later completion.
    pub fn append_workflow_step(&mut self, step: WorkflowStep) -> Result<String> {
        let id = step.id.clone();
        self.update(|s| s.workflow.push(step))?;
        Ok(id)
    }

    /// Copy scratch into a new checkpoint directory `{NNN-label}`.
    pub fn create_checkpoint(&mut self, label: &str) -> Result<CheckpointRef> {
        let id = self.session.next_checkpoint_id();
        let dir_name = format!("{id}-{label}");
        let dir = self.scratch.checkpoints_dir().join(&dir_name);
        let copied_paths = self.scratch.snapshot_into(&dir)?;
        let checkpoint = CheckpointRef {
            id: id.clone(),
            label: label.to_string(),
            phase: self.session.phase,
            dir: dir.clone(),
            copied_paths,
        };
        info!(
            code = events::CHECKPOINT_CREATED,
            checkpoint = %dir_name,
            phase = %self.session.phase,
            "checkpoint created"
        );
        self.update(|s| s.checkpoints.push(checkpoint.clone()))?;
        Ok(checkpoint)
    }

    pub fn latest_checkpoint(&self) -> Option<&CheckpointRef> {
        self.session.checkpoints.last()
    }

    pub fn checkpoint_by_id(&self, id: &str) -> Option<&CheckpointRef> {
        self.session.checkpoints.iter().find(|c| c.id == id)
    }

    /// Restore scratch byte-for-byte from the given checkpoint.
    pub fn restore_checkpoint(&self, checkpoint: &CheckpointRef) -> Result<()> {
        self.scratch.restore_from(&checkpoint.dir)
    }

    /// Resumable iff state exists, the last error is not fatal, and the
    /// phase has not already concluded the task.
    pub fn can_resume(&self) -> bool {
        if let Some(ref err) = self.session.last_error
            && err.fatal
        {
            return false;
        }
        self.session.can_resume
            && !matches!(
                self.session.phase,
                Phase::Completed | Phase::MaxIterations | Phase::Reverted
            )
    }

    /// Archive the finished session into `sessions/<id>/` for `history`.
    pub fn archive(&self) -> Result<PathBuf> {
        let dir = self.scratch.sessions_dir().join(&self.session.session_id);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create archive dir: {}", dir.display()))?;
        let content = serde_json::to_string_pretty(&self.session)
            .context("Failed to serialize session for archive")?;
        std::fs::write(dir.join("state.json"), content)
            .context("Failed to write archived state")?;
        self.scratch.snapshot_into(&dir.join("scratch"))?;
        Ok(dir)
    }

    /// Remove all session scratch (the `clean` command).
    pub fn clear(&self) -> Result<()> {
        self.scratch.remove_all()
    }

    /// Whole-document write: tmp file, fsync, atomic rename.
    fn persist(&mut self) -> Result<()> {
        self.session.last_activity = Utc::now();
        let path = self.scratch.state_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create state dir: {}", parent.display()))?;
        }
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(&self.session)
            .context("Failed to serialize session state")?;
        let mut file = std::fs::File::create(&tmp)
            .with_context(|| format!("Failed to create {}", tmp.display()))?;
        file.write_all(content.as_bytes())
            .context("Failed to write session state")?;
        file.sync_all().context("Failed to fsync session state")?;
        std::fs::rename(&tmp, &path).context("Failed to replace session state")?;
        Ok(())
    }
}

/// List archived sessions, newest first (ids are monotone-sortable).
pub fn list_history(orchestra_dir: &Path, limit: usize) -> Result<Vec<Session>> {
    let sessions_dir = orchestra_dir.join("sessions");
    if !sessions_dir.exists() {
        return Ok(Vec::new());
    }
    let mut ids: Vec<String> = std::fs::read_dir(&sessions_dir)
        .with_context(|| format!("Failed to read {}", sessions_dir.display()))?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().into_string().ok())
        .collect();
    ids.sort();
    ids.reverse();

    let mut sessions = Vec::new();
    for id in ids.into_iter().take(limit) {
        let path = sessions_dir.join(&id).join("state.json");
        match std::fs::read_to_string(&path)
            .ok()
            .and_then(|c| serde_json::from_str::<Session>(&c).ok())
        {
            Some(session) => sessions.push(session),
            None => tracing::warn!("skipping unreadable archived session {id}"),
        }
    }
    Ok(sessions)
}

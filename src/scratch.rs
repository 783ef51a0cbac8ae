//! Session scratch area.
//!
//! Roles coordinate exclusively through files under `.orchestra/`: the
//! architect writes `plan`, the auditor writes `audit`, the executor may
//! raise `help-needed`, and the consultant answers in `solution`. The
//! orchestrator passes these paths into prompts and never parses backend
//! stdout.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub const PLAN_FILE: &str = "plan";
pub const AUDIT_FILE: &str = "audit";
pub const HELP_NEEDED_FILE: &str = "help-needed";
pub const SOLUTION_FILE: &str = "solution";

/// All role-to-role communication files, in checkpoint copy order.
pub const SCRATCH_FILES: [&str; 4] = [PLAN_FILE, AUDIT_FILE, HELP_NEEDED_FILE, SOLUTION_FILE];

/// Handle on one workspace's `.orchestra/` directory.
#[derive(Debug, Clone)]
pub struct ScratchArea {
    root: PathBuf,
}

impl ScratchArea {
    pub fn new(orchestra_dir: PathBuf) -> Self {
        Self {
            root: orchestra_dir,
        }
    }

    pub fn ensure(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root)
            .with_context(|| format!("Failed to create scratch dir: {}", self.root.display()))?;
        std::fs::create_dir_all(self.checkpoints_dir())
            .context("Failed to create checkpoints directory")?;
        std::fs::create_dir_all(self.sessions_dir())
            .context("Failed to create sessions directory")?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn plan_path(&self) -> PathBuf {
        self.root.join(PLAN_FILE)
    }

    pub fn audit_path(&self) -> PathBuf {
        self.root.join(AUDIT_FILE)
    }

    pub fn help_needed_path(&self) -> PathBuf {
        self.root.join(HELP_NEEDED_FILE)
    }

    pub fn solution_path(&self) -> PathBuf {
        self.root.join(SOLUTION_FILE)
    }

    pub fn state_path(&self) -> PathBuf {
        self.root.join("state.json")
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.root.join("checkpoints")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    pub fn read_plan(&self) -> Option<String> {
        read_non_empty(&self.plan_path())
    }

    pub fn read_audit(&self) -> Option<String> {
        read_non_empty(&self.audit_path())
    }

    pub fn read_help_needed(&self) -> Option<String> {
        read_non_empty(&self.help_needed_path())
    }

    pub fn read_solution(&self) -> Option<String> {
        read_non_empty(&self.solution_path())
    }

    /// Remove the help-needed file once the consultant has consumed it.
    pub fn consume_help_needed(&self) -> Result<()> {
        let path = self.help_needed_path();
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        }
        Ok(())
    }

    /// Clear role files for a fresh session; checkpoints and history stay.
    pub fn clear_role_files(&self) -> Result<()> {
        for name in SCRATCH_FILES {
            let path = self.root.join(name);
            if path.exists() {
                std::fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
            }
        }
        Ok(())
    }

    /// Copy current role files into a checkpoint directory; returns the
    /// paths actually captured.
    pub fn snapshot_into(&self, checkpoint_dir: &Path) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(checkpoint_dir).with_context(|| {
            format!("Failed to create checkpoint dir: {}", checkpoint_dir.display())
        })?;
        let mut copied = Vec::new();
        for name in SCRATCH_FILES {
            let src = self.root.join(name);
            if src.exists() {
                let dst = checkpoint_dir.join(name);
                std::fs::copy(&src, &dst)
                    .with_context(|| format!("Failed to copy {} into checkpoint", name))?;
                copied.push(dst);
            }
        }
        Ok(copied)
    }

    /// Restore role files byte-for-byte from a checkpoint directory.
    pub fn restore_from(&self, checkpoint_dir: &Path) -> Result<()> {
        for name in SCRATCH_FILES {
            let src = checkpoint_dir.join(name);
            let dst = self.root.join(name);
            if src.exists() {
                std::fs::copy(&src, &dst)
                    .with_context(|| format!("Failed to restore {} from checkpoint", name))?;
            } else if dst.exists() {
                std::fs::remove_file(&dst)
                    .with_context(|| format!("Failed to remove {} during restore", name))?;
            }
        }
        Ok(())
    }

    /// Remove the whole scratch directory (the `clean` command).
    pub fn remove_all(&self) -> Result<()> {
        if self.root.exists() {
            std::fs::remove_dir_all(&self.root)
                .with_context(|| format!("Failed to remove {}", self.root.display()))?;
        }
        Ok(())
    }
}

fn read_non_empty(path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    if content.trim().is_empty() {
        None
    } else {
        Some(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn scratch() -> (ScratchArea, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let scratch = ScratchArea::new(dir.path().join(".orchestra"));
        scratch.ensure().unwrap();
        (scratch, dir)
    }

    #[test]
    fn empty_plan_reads_as_none() {
        let (scratch, _dir) = scratch();
        assert!(scratch.read_plan().is_none());
        std::fs::write(scratch.plan_path(), "   \n").unwrap();
        assert!(scratch.read_plan().is_none());
        std::fs::write(scratch.plan_path(), "1. write hello.py\n").unwrap();
        assert_eq!(scratch.read_plan().unwrap(), "1. write hello.py\n");
    }

    #[test]
    fn consume_help_needed_removes_file() {
        let (scratch, _dir) = scratch();
        std::fs::write(scratch.help_needed_path(), "stuck on the algorithm").unwrap();
        assert!(scratch.read_help_needed().is_some());
        scratch.consume_help_needed().unwrap();
        assert!(!scratch.help_needed_path().exists());
        // idempotent
        scratch.consume_help_needed().unwrap();
    }

    #[test]
    fn snapshot_and_restore_round_trip() {
        let (scratch, dir) = scratch();
        std::fs::write(scratch.plan_path(), "the plan").unwrap();
        std::fs::write(scratch.audit_path(), "APPROVED\n").unwrap();

        let ckpt = dir.path().join("ckpt");
        let copied = scratch.snapshot_into(&ckpt).unwrap();
        assert_eq!(copied.len(), 2);

        // Mutate and restore
        std::fs::write(scratch.plan_path(), "tampered").unwrap();
        std::fs::write(scratch.solution_path(), "stray file").unwrap();
        scratch.restore_from(&ckpt).unwrap();

        assert_eq!(std::fs::read_to_string(scratch.plan_path()).unwrap(), "the plan");
        assert_eq!(std::fs::read_to_string(scratch.audit_path()).unwrap(), "APPROVED\n");
        // files absent from the snapshot are removed
        assert!(!scratch.solution_path().exists());
    }

    #[test]
    fn clear_role_files_leaves_checkpoints() {
        let (scratch, _dir) = scratch();
        std::fs::write(scratch.plan_path(), "plan").unwrap();
        let ckpt = scratch.checkpoints_dir().join("001-plan");
        scratch.snapshot_into(&ckpt).unwrap();

        scratch.clear_role_files().unwrap();
        assert!(!scratch.plan_path().exists());
        assert!(ckpt.join(PLAN_FILE).exists());
    }
}

//! Git integration: stage all changed files and commit with the
//! configured conventional-commit template on a COMPLETED session.
//! Commits are local only; the engine never pushes.

use anyhow::{Context, Result};
use git2::{IndexAddOption, Repository, Signature, StatusOptions};
use std::path::Path;

use crate::util::slugify;

pub struct GitTracker {
    repo: Repository,
}

impl GitTracker {
    /// Open the workspace repository; errors when the workspace is not a
    /// git repo (callers treat that as git integration disabled).
    pub fn new(workspace_dir: &Path) -> Result<Self> {
        let repo = Repository::open(workspace_dir).context("Failed to open git repository")?;
        Ok(Self { repo })
    }

    /// Whether anything is staged-able: new, modified, or deleted files.
    pub fn has_changes(&self) -> Result<bool> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(true);
        let statuses = self.repo.statuses(Some(&mut opts))?;
        Ok(!statuses.is_empty())
    }

    /// Render the commit message template: `{task}` is replaced with a
    /// slug of the task description.
    pub fn render_message(template: &str, task: &str) -> String {
        template.replace("{task}", &slugify(task, 60))
    }

    /// Stage every change and commit. Returns the new commit sha.
    pub fn commit_all(&self, message: &str) -> Result<String> {
        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = self.repo.find_tree(tree_id)?;
        let sig = Signature::now("orchestra", "orchestra@localhost")?;

        // Unborn branch: the first commit has no parent.
        let commit_id = if let Some(parent) = self.head_commit() {
            self.repo
                .commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?
        } else {
            self.repo
                .commit(Some("HEAD"), &sig, &sig, message, &tree, &[])?
        };

        Ok(commit_id.to_string())
    }

    fn head_commit(&self) -> Option<git2::Commit<'_>> {
        self.repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok())
    }

    /// Current HEAD sha, None on an unborn branch.
    pub fn head_sha(&self) -> Option<String> {
        self.head_commit().map(|c| c.id().to_string())
    }
}

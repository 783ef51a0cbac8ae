//! Workspace trackers. Git is the only one: stage-and-commit on success.

pub mod git;

pub use git::GitTracker;

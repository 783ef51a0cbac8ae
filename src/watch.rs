//! Watch mode: re-trigger a session when the workspace changes.
//!
//! No filesystem-notification dependency; a 500 ms poll over a
//! walkdir-based fingerprint is plenty at workspace scale, and the poll
//! interval doubles as the debounce window.

use std::path::Path;
use std::time::Duration;

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

/// Poll interval and debounce window.
pub const DEBOUNCE: Duration = Duration::from_millis(500);

/// Directories that must not re-trigger a run.
const IGNORED: [&str; 4] = [".orchestra", ".git", "node_modules", "target"];

/// Hash of every file path, size, and mtime under the workspace.
pub fn fingerprint(workspace_dir: &Path) -> String {
    let mut hasher = Sha256::new();
    let mut entries: Vec<(String, u64, i64)> = WalkDir::new(workspace_dir)
        .into_iter()
        .filter_entry(|e| {
            !e.file_name()
                .to_str()
                .map(|n| IGNORED.contains(&n))
                .unwrap_or(false)
        })
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            let meta = e.metadata().ok()?;
            let mtime = meta
                .modified()
                .ok()?
                .duration_since(std::time::UNIX_EPOCH)
                .ok()?
                .as_secs() as i64;
            Some((e.path().display().to_string(), meta.len(), mtime))
        })
        .collect();
    entries.sort();
    for (path, len, mtime) in entries {
        hasher.update(path.as_bytes());
        hasher.update(len.to_le_bytes());
        hasher.update(mtime.to_le_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Block until the workspace changes and then settles: the fingerprint
/// must differ from `baseline` and then hold stable for one debounce
/// window.
pub async fn await_change(workspace_dir: &Path, baseline: &str) -> String {
    loop {
        tokio::time::sleep(DEBOUNCE).await;
        let current = fingerprint(workspace_dir);
        if current == baseline {
            continue;
        }
        // Debounce: wait for the tree to stop moving.
        loop {
            tokio::time::sleep(DEBOUNCE).await;
            let settled = fingerprint(workspace_dir);
            if settled == current {
                return settled;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fingerprint_is_stable_for_unchanged_tree() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "one").unwrap();
        assert_eq!(fingerprint(dir.path()), fingerprint(dir.path()));
    }

    #[test]
    fn fingerprint_changes_with_content() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "one").unwrap();
        let before = fingerprint(dir.path());
        std::fs::write(dir.path().join("b.txt"), "two").unwrap();
        assert_ne!(before, fingerprint(dir.path()));
    }

    #[test]
    fn fingerprint_ignores_orchestra_dir() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "one").unwrap();
        let before = fingerprint(dir.path());
        let scratch = dir.path().join(".orchestra");
        std::fs::create_dir_all(&scratch).unwrap();
        std::fs::write(scratch.join("state.json"), "{}").unwrap();
        assert_eq!(before, fingerprint(dir.path()));
    }

    #[tokio::test]
    async fn await_change_returns_after_modification() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "one").unwrap();
        let baseline = fingerprint(dir.path());

        let path = dir.path().to_path_buf();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            std::fs::write(path.join("a.txt"), "changed").unwrap();
        });

        let changed =
            tokio::time::timeout(Duration::from_secs(10), await_change(dir.path(), &baseline))
                .await
                .expect("change detected in time");
        assert_ne!(changed, baseline);
        writer.await.unwrap();
    }
}

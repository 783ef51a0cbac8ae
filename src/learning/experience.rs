//! Bounded experience buffer.
//!
//! Append-only line-delimited JSON on disk, flushed on every write under a
//! file lock; a rolling window of the most recent entries is kept in
//! memory for stats. The full history stays on disk until `clear()`.

use std::collections::{BTreeMap, VecDeque};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use super::features::{Domain, TaskType};
use super::reward::RewardResult;
use crate::adapter::Role;

/// Default rolling-window capacity.
pub const DEFAULT_WINDOW: usize = 10_000;

/// Which adapters and strategy a session selected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRecord {
    /// Adapter id chosen per role, in the order roles were filled
    pub adapters: Vec<(Role, String)>,
    /// Scheduling strategy, e.g. "sequential", "parallel", "pipeline"
    pub strategy: String,
}

/// Analysis context carried alongside the reward.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperienceMetadata {
    pub task_type: TaskType,
    pub domain: Domain,
    /// Verbatim reward breakdown
    pub breakdown: BTreeMap<String, f64>,
}

/// One `(state, action, reward)` tuple.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Experience {
    pub state: Vec<f64>,
    pub action: ActionRecord,
    pub reward: f64,
    pub done: bool,
    pub metadata: ExperienceMetadata,
    pub timestamp: DateTime<Utc>,
}

impl Experience {
    pub fn new(
        state: Vec<f64>,
        action: ActionRecord,
        reward: &RewardResult,
        task_type: TaskType,
        domain: Domain,
    ) -> Self {
        Self {
            state,
            action,
            reward: reward.reward,
            done: true,
            metadata: ExperienceMetadata {
                task_type,
                domain,
                breakdown: reward.breakdown.clone(),
            },
            timestamp: Utc::now(),
        }
    }
}

/// Aggregates over one slice of the buffer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferStats {
    pub total: usize,
    pub mean_reward: f64,
    pub success_rate: f64,
    pub by_task_type: BTreeMap<String, GroupStats>,
    pub by_domain: BTreeMap<String, GroupStats>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupStats {
    pub count: usize,
    pub mean_reward: f64,
}

/// The buffer: disk path plus the in-memory rolling window.
#[derive(Debug)]
pub struct ExperienceBuffer {
    path: PathBuf,
    window: VecDeque<Experience>,
    capacity: usize,
}

impl ExperienceBuffer {
    /// Open the buffer, reloading the tail of any existing log into the
    /// window.
    pub fn open(path: PathBuf) -> Result<Self> {
        Self::with_capacity(path, DEFAULT_WINDOW)
    }

    pub fn with_capacity(path: PathBuf, capacity: usize) -> Result<Self> {
        let mut window = VecDeque::with_capacity(capacity.min(1024));
        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read experience log: {}", path.display()))?;
            for line in content.lines() {
                if let Ok(exp) = serde_json::from_str::<Experience>(line) {
                    if window.len() == capacity {
                        window.pop_front();
                    }
                    window.push_back(exp);
                }
            }
        }
        Ok(Self {
            path,
            window,
            capacity,
        })
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Append one experience: one JSON line, fsynced under a file lock.
    pub fn append(&mut self, experience: Experience) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create experience dir: {}", parent.display())
            })?;
        }
        let line = serde_json::to_string(&experience).context("Failed to serialize experience")?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open experience log: {}", self.path.display()))?;
        file.lock_exclusive().context("Failed to lock experience log")?;
        writeln!(file, "{line}").context("Failed to append experience")?;
        file.sync_all().context("Failed to fsync experience log")?;
        fs2::FileExt::unlock(&file).ok();

        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(experience);
        Ok(())
    }

    /// Stats over the in-memory window.
    pub fn stats(&self) -> BufferStats {
        if self.window.is_empty() {
            return BufferStats::default();
        }
        let total = self.window.len();
        let mean_reward = self.window.iter().map(|e| e.reward).sum::<f64>() / total as f64;
        let successes = self.window.iter().filter(|e| e.reward > 0.0).count();

        let mut by_task_type: BTreeMap<String, (usize, f64)> = BTreeMap::new();
        let mut by_domain: BTreeMap<String, (usize, f64)> = BTreeMap::new();
        for exp in &self.window {
            let t = by_task_type
                .entry(exp.metadata.task_type.as_str().to_string())
                .or_default();
            t.0 += 1;
            t.1 += exp.reward;
            let d = by_domain
                .entry(exp.metadata.domain.as_str().to_string())
                .or_default();
            d.0 += 1;
            d.1 += exp.reward;
        }
        let finish = |m: BTreeMap<String, (usize, f64)>| {
            m.into_iter()
                .map(|(k, (count, sum))| {
                    (
                        k,
                        GroupStats {
                            count,
                            mean_reward: sum / count as f64,
                        },
                    )
                })
                .collect()
        };

        BufferStats {
            total,
            mean_reward,
            success_rate: successes as f64 / total as f64,
            by_task_type: finish(by_task_type),
            by_domain: finish(by_domain),
        }
    }

    /// Copy the full on-disk history to another path.
    pub fn export(&self, dest: &Path) -> Result<u64> {
        if !self.path.exists() {
            std::fs::write(dest, "")?;
            return Ok(0);
        }
        std::fs::copy(&self.path, dest)
            .with_context(|| format!("Failed to export experiences to {}", dest.display()))
    }

    /// Drop both the window and the on-disk history.
    pub fn clear(&mut self) -> Result<()> {
        self.window.clear();
        if self.path.exists() {
            std::fs::remove_file(&self.path)
                .with_context(|| format!("Failed to remove {}", self.path.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learning::reward::RewardResult;
    use tempfile::tempdir;

    fn reward(value: f64) -> RewardResult {
        let mut breakdown = BTreeMap::new();
        breakdown.insert("success".to_string(), value);
        RewardResult {
            reward: value,
            breakdown,
        }
    }

    fn experience(value: f64, task_type: TaskType) -> Experience {
        Experience::new(
            vec![0.0; 4],
            ActionRecord {
                adapters: vec![(Role::Executor, "glm".into())],
                strategy: "sequential".into(),
            },
            &reward(value),
            task_type,
            Domain::General,
        )
    }

    #[test]
    fn append_persists_jsonl_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("experiences.jsonl");
        let mut buffer = ExperienceBuffer::open(path.clone()).unwrap();
        buffer.append(experience(120.0, TaskType::Api)).unwrap();
        buffer.append(experience(-80.0, TaskType::BugFix)).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        for line in content.lines() {
            serde_json::from_str::<Experience>(line).unwrap();
        }
    }

    #[test]
    fn reopening_reloads_the_window() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("experiences.jsonl");
        {
            let mut buffer = ExperienceBuffer::open(path.clone()).unwrap();
            buffer.append(experience(50.0, TaskType::Testing)).unwrap();
        }
        let buffer = ExperienceBuffer::open(path).unwrap();
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn window_is_bounded_but_disk_keeps_history() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("experiences.jsonl");
        let mut buffer = ExperienceBuffer::with_capacity(path.clone(), 3).unwrap();
        for i in 0..5 {
            buffer.append(experience(i as f64, TaskType::Api)).unwrap();
        }
        assert_eq!(buffer.len(), 3);
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 5);
    }

    #[test]
    fn stats_aggregate_by_type_and_domain() {
        let dir = tempdir().unwrap();
        let mut buffer = ExperienceBuffer::open(dir.path().join("x.jsonl")).unwrap();
        buffer.append(experience(100.0, TaskType::Api)).unwrap();
        buffer.append(experience(-100.0, TaskType::Api)).unwrap();
        buffer.append(experience(60.0, TaskType::Testing)).unwrap();

        let stats = buffer.stats();
        assert_eq!(stats.total, 3);
        assert!((stats.mean_reward - 20.0).abs() < 1e-9);
        assert!((stats.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.by_task_type["api"].count, 2);
        assert!((stats.by_task_type["api"].mean_reward - 0.0).abs() < 1e-9);
        assert_eq!(stats.by_domain["general"].count, 3);
    }

    #[test]
    fn export_copies_full_history() {
        let dir = tempdir().unwrap();
        let mut buffer = ExperienceBuffer::open(dir.path().join("x.jsonl")).unwrap();
        buffer.append(experience(10.0, TaskType::Api)).unwrap();
        let dest = dir.path().join("export.jsonl");
        buffer.export(&dest).unwrap();
        assert_eq!(
            std::fs::read_to_string(&dest).unwrap().lines().count(),
            1
        );
    }

    #[test]
    fn clear_drops_disk_and_window() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.jsonl");
        let mut buffer = ExperienceBuffer::open(path.clone()).unwrap();
        buffer.append(experience(10.0, TaskType::Api)).unwrap();
        buffer.clear().unwrap();
        assert!(buffer.is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn corrupt_lines_are_skipped_on_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.jsonl");
        {
            let mut buffer = ExperienceBuffer::open(path.clone()).unwrap();
            buffer.append(experience(10.0, TaskType::Api)).unwrap();
        }
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("this is not json\n");
        std::fs::write(&path, content).unwrap();

        let buffer = ExperienceBuffer::open(path).unwrap();
        assert_eq!(buffer.len(), 1);
    }
}

//! Per-job pipeline state: one JSON file at
//! `<worktree>/.shipwright/pipeline-state.json` tracking where a job is in
//! its 13-stage run. This is the runner's own bookkeeping — distinct from
//! the daemon-wide `DaemonState` in [`crate::state`], which tracks job
//! admission and completion, not per-stage progress.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipwright_common::Stage;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEntry {
    pub stage: Stage,
    pub iteration: u32,
    pub status: StageStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub backtrack_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Running,
    Completed,
    Skipped,
    Failed,
}

/// Persisted record of a job's progress through the pipeline. One entry per
/// stage the job has touched, in the order it touched them — a stage can
/// reappear if the job backtracked to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    pub issue_id: i64,
    pub template: String,
    #[serde(default)]
    pub entries: Vec<StageEntry>,
    #[serde(default)]
    pub total_backtracks: u32,

    #[serde(skip)]
    path: PathBuf,
}

impl PipelineState {
    fn path_for(worktree: &Path) -> PathBuf {
        worktree.join(".shipwright").join("pipeline-state.json")
    }

    pub fn new(worktree: &Path, issue_id: i64, template: impl Into<String>) -> Self {
        Self {
            issue_id,
            template: template.into(),
            entries: Vec::new(),
            total_backtracks: 0,
            path: Self::path_for(worktree),
        }
    }

    pub fn load_or_new(worktree: &Path, issue_id: i64, template: impl Into<String>) -> Result<Self> {
        let path = Self::path_for(worktree);
        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read pipeline state at {}", path.display()))?;
            let mut state: PipelineState = serde_json::from_str(&content)
                .with_context(|| format!("failed to parse pipeline state at {}", path.display()))?;
            state.path = path;
            Ok(state)
        } else {
            Ok(Self::new(worktree, issue_id, template))
        }
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("failed to write pipeline state at {}", self.path.display()))?;
        Ok(())
    }

    pub fn start_stage(&mut self, stage: Stage) {
        let now = Utc::now();
        self.entries.push(StageEntry {
            stage,
            iteration: 0,
            status: StageStatus::Running,
            started_at: now,
            updated_at: now,
            backtrack_count: 0,
        });
    }

    pub fn record_iteration(&mut self, stage: Stage, iteration: u32) {
        if let Some(entry) = self.entries.iter_mut().rev().find(|e| e.stage == stage) {
            entry.iteration = iteration;
            entry.updated_at = Utc::now();
        }
    }

    pub fn finish_stage(&mut self, stage: Stage, status: StageStatus) {
        if let Some(entry) = self.entries.iter_mut().rev().find(|e| e.stage == stage) {
            entry.status = status;
            entry.updated_at = Utc::now();
        }
    }

    /// Record a backtrack from `from` back to `to`, bumping the running
    /// total so the runner can enforce spec.md's `max_backtracks` cap.
    pub fn record_backtrack(&mut self, from: Stage, to: Stage) {
        self.total_backtracks += 1;
        if let Some(entry) = self.entries.iter_mut().rev().find(|e| e.stage == from) {
            entry.backtrack_count += 1;
        }
        self.start_stage(to);
    }

    pub fn current_stage(&self) -> Option<Stage> {
        self.entries.last().map(|e| e.stage)
    }

    pub fn stage_duration_secs(&self, stage: Stage) -> Option<i64> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.stage == stage)
            .map(|e| (e.updated_at - e.started_at).num_seconds())
    }
}

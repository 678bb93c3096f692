//! Durable audit trail for a job's run through the pipeline: one `AuditRun`
//! per job, with a `StageAudit` per pipeline stage and an `IterationAudit`
//! per self-heal/backtrack iteration within that stage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipwright_common::Stage;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRun {
    pub run_id: Uuid,
    pub issue_id: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub config: RunConfig,
    pub stages: Vec<StageAudit>,
}

impl AuditRun {
    pub fn new(issue_id: i64, config: RunConfig) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            issue_id,
            started_at: Utc::now(),
            ended_at: None,
            config,
            stages: Vec::new(),
        }
    }

    pub fn finish(&mut self) {
        self.ended_at = Some(Utc::now());
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub template: String,
    pub worktree: PathBuf,
    pub verbose: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageAudit {
    pub stage: Stage,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub iterations: Vec<IterationAudit>,
    pub outcome: StageOutcome,
    pub file_changes: FileChangeSummary,
}

impl StageAudit {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            started_at: Utc::now(),
            ended_at: None,
            iterations: Vec::new(),
            outcome: StageOutcome::InProgress,
            file_changes: FileChangeSummary::default(),
        }
    }

    pub fn finish(&mut self, outcome: StageOutcome, changes: FileChangeSummary) {
        self.ended_at = Some(Utc::now());
        self.outcome = outcome;
        self.file_changes = changes;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationAudit {
    pub iteration: u32,
    pub started_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub executor_session: ExecutorSession,
    pub git_snapshot_before: String,
    pub git_snapshot_after: Option<String>,
    pub file_diffs: Vec<FileDiff>,
    pub completion_found: bool,
}

/// One invocation of the opaque executor subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSession {
    pub prompt_file: PathBuf,
    pub prompt_chars: usize,
    pub output_file: PathBuf,
    pub output_chars: usize,
    pub exit_code: i32,
    pub token_usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDiff {
    pub path: PathBuf,
    pub change_type: ChangeType,
    pub lines_added: usize,
    pub lines_removed: usize,
    pub diff_content: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileChangeSummary {
    pub files_added: Vec<PathBuf>,
    pub files_modified: Vec<PathBuf>,
    pub files_deleted: Vec<PathBuf>,
    pub total_lines_added: usize,
    pub total_lines_removed: usize,
}

impl FileChangeSummary {
    pub fn total_files(&self) -> usize {
        self.files_added.len() + self.files_modified.len() + self.files_deleted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total_files() == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum StageOutcome {
    InProgress,
    Completed { iteration: u32 },
    MaxIterationsReached,
    Error { message: String },
    Backtracked { to: Stage },
    Skipped,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum ChangeType {
    Added,
    Modified,
    Deleted,
    Renamed,
}

pub mod logger;
pub use logger::AuditLogger;

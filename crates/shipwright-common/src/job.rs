use crate::stage::Stage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// The internal unit of work per admitted issue (spec.md §3 "Job").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub issue_id: i64,
    pub pid: u32,
    pub worktree: PathBuf,
    pub template: String,
    pub score: u8,
    pub started_at: DateTime<Utc>,
    pub stage: Stage,
    pub iteration: u32,
    pub complexity: u8,
    pub priority: bool,
}

impl Job {
    pub fn new(
        issue_id: i64,
        pid: u32,
        worktree: PathBuf,
        template: impl Into<String>,
        score: u8,
        complexity: u8,
    ) -> Self {
        Self {
            issue_id,
            pid,
            worktree,
            template: template.into(),
            score: score.min(100),
            started_at: Utc::now(),
            stage: Stage::Intake,
            iteration: 0,
            complexity: complexity.clamp(1, 10),
            priority: false,
        }
    }

    pub fn with_priority(mut self, priority: bool) -> Self {
        self.priority = priority;
        self
    }
}

/// Job lifecycle: `queued -> admitted -> running -> {succeeded, failed, aborted}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Admitted,
    Running,
    Succeeded,
    Failed,
    Aborted,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Aborted
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_clamps_score_and_complexity() {
        let job = Job::new(1, 100, "/tmp/wt".into(), "fast", 255, 0);
        assert_eq!(job.score, 100);
        assert_eq!(job.complexity, 1);

        let job = Job::new(1, 100, "/tmp/wt".into(), "fast", 50, 99);
        assert_eq!(job.complexity, 10);
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Aborted.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
    }
}

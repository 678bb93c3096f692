//! The issue-tracker boundary: every place the daemon reads or mutates
//! tracker state (labels, comments, PRs, branch protection) goes through
//! [`IssueTracker`], so a test double can stand in for GitHub without
//! touching the network (spec.md §6 "NO_GITHUB=1").

pub mod git;
pub mod github;
pub mod offline;

pub use git::GitTracker;
pub use github::GitHubTracker;
pub use offline::OfflineTracker;

use crate::errors::TrackerError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipwright_common::Issue;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: i64,
    pub url: String,
    pub state: PrState,
    pub mergeable: Option<bool>,
    /// The PR's current head commit, used to key `list_check_runs`. `None`
    /// when the tracker couldn't resolve it (offline double, or a `gh`
    /// response that omitted it).
    pub head_sha: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrState {
    Open,
    Merged,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchProtection {
    pub required_reviews: u32,
    pub required_checks: Vec<String>,
    pub enforce_admins: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRun {
    pub name: String,
    pub status: CheckStatus,
    pub conclusion: Option<CheckConclusion>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Queued,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckConclusion {
    Success,
    Failure,
    Cancelled,
    TimedOut,
}

/// The full set of tracker operations the daemon and pipeline runner need.
/// `GitHubTracker` shells out to `gh`; `OfflineTracker` is an in-memory
/// double for tests and `NO_GITHUB=1` runs.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn list_issues(&self, label: &str) -> Result<Vec<Issue>, TrackerError>;
    async fn get_issue(&self, id: i64) -> Result<Issue, TrackerError>;
    async fn add_label(&self, id: i64, label: &str) -> Result<(), TrackerError>;
    async fn remove_label(&self, id: i64, label: &str) -> Result<(), TrackerError>;
    async fn comment(&self, id: i64, body: &str) -> Result<(), TrackerError>;
    async fn close(&self, id: i64) -> Result<(), TrackerError>;
    async fn create_pr(
        &self,
        branch: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequest, TrackerError>;
    async fn merge_pr(&self, number: i64) -> Result<(), TrackerError>;
    async fn branch_protection(&self, branch: &str) -> Result<Option<BranchProtection>, TrackerError>;
    async fn list_check_runs(&self, sha: &str) -> Result<Vec<CheckRun>, TrackerError>;
    /// The open PR already targeting `head`, if one exists. The pr stage
    /// calls this before `create_pr` so a re-run of the stage (after a
    /// restart, or a retry following a transient failure) doesn't open a
    /// second PR for the same branch.
    async fn find_open_pr(&self, head: &str) -> Result<Option<PullRequest>, TrackerError>;
}

//! In-memory `IssueTracker` used under `NO_GITHUB=1` and in tests: no
//! network, no subprocess, just a `Mutex`-guarded map the test or CI caller
//! seeds and inspects directly.

use super::{BranchProtection, CheckRun, IssueTracker, PrState, PullRequest};
use crate::errors::TrackerError;
use async_trait::async_trait;
use shipwright_common::Issue;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
pub struct OfflineTracker {
    issues: Mutex<HashMap<i64, Issue>>,
    prs: Mutex<HashMap<i64, PullRequest>>,
    pr_branches: Mutex<HashMap<String, i64>>,
    next_pr_number: Mutex<i64>,
    comments: Mutex<Vec<(i64, String)>>,
}

impl OfflineTracker {
    pub fn new() -> Self {
        Self {
            next_pr_number: Mutex::new(1),
            ..Default::default()
        }
    }

    pub fn seed(&self, issue: Issue) {
        self.issues.lock().unwrap().insert(issue.id, issue);
    }

    pub fn comments_for(&self, id: i64) -> Vec<String> {
        self.comments
            .lock()
            .unwrap()
            .iter()
            .filter(|(cid, _)| *cid == id)
            .map(|(_, body)| body.clone())
            .collect()
    }
}

#[async_trait]
impl IssueTracker for OfflineTracker {
    async fn list_issues(&self, label: &str) -> Result<Vec<Issue>, TrackerError> {
        Ok(self
            .issues
            .lock()
            .unwrap()
            .values()
            .filter(|i| i.has_label(label))
            .cloned()
            .collect())
    }

    async fn get_issue(&self, id: i64) -> Result<Issue, TrackerError> {
        self.issues
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| TrackerError::CommandFailed(format!("no such issue {id}")))
    }

    async fn add_label(&self, id: i64, label: &str) -> Result<(), TrackerError> {
        let mut issues = self.issues.lock().unwrap();
        let issue = issues
            .get_mut(&id)
            .ok_or_else(|| TrackerError::CommandFailed(format!("no such issue {id}")))?;
        issue.labels.insert(label.to_string());
        Ok(())
    }

    async fn remove_label(&self, id: i64, label: &str) -> Result<(), TrackerError> {
        let mut issues = self.issues.lock().unwrap();
        let issue = issues
            .get_mut(&id)
            .ok_or_else(|| TrackerError::CommandFailed(format!("no such issue {id}")))?;
        issue.labels.remove(label);
        Ok(())
    }

    async fn comment(&self, id: i64, body: &str) -> Result<(), TrackerError> {
        self.comments.lock().unwrap().push((id, body.to_string()));
        Ok(())
    }

    async fn close(&self, id: i64) -> Result<(), TrackerError> {
        self.issues
            .lock()
            .unwrap()
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| TrackerError::CommandFailed(format!("no such issue {id}")))
    }

    async fn create_pr(
        &self,
        branch: &str,
        _base: &str,
        _title: &str,
        _body: &str,
    ) -> Result<PullRequest, TrackerError> {
        let mut next = self.next_pr_number.lock().unwrap();
        let number = *next;
        *next += 1;
        let pr = PullRequest {
            number,
            url: format!("offline://pr/{number}/{branch}"),
            state: PrState::Open,
            mergeable: Some(true),
            head_sha: Some(format!("offline-sha-{number}")),
        };
        self.prs.lock().unwrap().insert(number, pr.clone());
        self.pr_branches.lock().unwrap().insert(branch.to_string(), number);
        Ok(pr)
    }

    async fn merge_pr(&self, number: i64) -> Result<(), TrackerError> {
        let mut prs = self.prs.lock().unwrap();
        let pr = prs
            .get_mut(&number)
            .ok_or_else(|| TrackerError::CommandFailed(format!("no such PR {number}")))?;
        pr.state = PrState::Merged;
        Ok(())
    }

    async fn find_open_pr(&self, head: &str) -> Result<Option<PullRequest>, TrackerError> {
        let number = match self.pr_branches.lock().unwrap().get(head).copied() {
            Some(n) => n,
            None => return Ok(None),
        };
        Ok(self
            .prs
            .lock()
            .unwrap()
            .get(&number)
            .filter(|pr| pr.state == PrState::Open)
            .cloned())
    }

    async fn branch_protection(&self, _branch: &str) -> Result<Option<BranchProtection>, TrackerError> {
        Ok(None)
    }

    async fn list_check_runs(&self, _sha: &str) -> Result<Vec<CheckRun>, TrackerError> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn seeded_issue_is_listed_by_label() {
        let tracker = OfflineTracker::new();
        tracker.seed(Issue::new(1, "t", "b").with_labels(["shipwright-ready"]));
        let issues = tracker.list_issues("shipwright-ready").await.unwrap();
        assert_eq!(issues.len(), 1);
    }

    #[tokio::test]
    async fn create_pr_then_merge_changes_state() {
        let tracker = OfflineTracker::new();
        let pr = tracker.create_pr("feature", "main", "t", "b").await.unwrap();
        assert_eq!(pr.state, PrState::Open);
        tracker.merge_pr(pr.number).await.unwrap();
        let pr2 = tracker.prs.lock().unwrap().get(&pr.number).cloned().unwrap();
        assert_eq!(pr2.state, PrState::Merged);
    }

    #[tokio::test]
    async fn comment_is_recorded() {
        let tracker = OfflineTracker::new();
        tracker.seed(Issue::new(5, "t", "b"));
        tracker.comment(5, "hello").await.unwrap();
        assert_eq!(tracker.comments_for(5), vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn find_open_pr_matches_head_branch() {
        let tracker = OfflineTracker::new();
        let pr = tracker.create_pr("shipwright/issue-5", "main", "t", "b").await.unwrap();
        let found = tracker.find_open_pr("shipwright/issue-5").await.unwrap().unwrap();
        assert_eq!(found.number, pr.number);
        assert!(tracker.find_open_pr("shipwright/issue-6").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn find_open_pr_ignores_merged_pr() {
        let tracker = OfflineTracker::new();
        let pr = tracker.create_pr("shipwright/issue-7", "main", "t", "b").await.unwrap();
        tracker.merge_pr(pr.number).await.unwrap();
        assert!(tracker.find_open_pr("shipwright/issue-7").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn close_removes_issue() {
        let tracker = OfflineTracker::new();
        tracker.seed(Issue::new(9, "t", "b"));
        tracker.close(9).await.unwrap();
        assert!(tracker.get_issue(9).await.is_err());
    }
}

//! `gh`-CLI-backed `IssueTracker`. Shells out rather than hitting the REST
//! API directly so the daemon inherits the user's existing `gh auth login`
//! session — the same trust boundary the teacher's CLI uses for its own
//! subprocess calls.

use super::{BranchProtection, CheckConclusion, CheckRun, CheckStatus, IssueTracker, PrState, PullRequest};
use crate::errors::TrackerError;
use async_trait::async_trait;
use serde::Deserialize;
use shipwright_common::Issue;
use std::collections::BTreeSet;
use std::process::Stdio;
use tokio::process::Command;

pub struct GitHubTracker {
    repo: String,
}

impl GitHubTracker {
    pub fn new(repo: impl Into<String>) -> Self {
        Self { repo: repo.into() }
    }

    async fn run(&self, args: &[&str]) -> Result<String, TrackerError> {
        let output = Command::new("gh")
            .args(args)
            .arg("--repo")
            .arg(&self.repo)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            if stderr.contains("authentication") || stderr.contains("not logged in") {
                return Err(TrackerError::AuthFailed(stderr));
            }
            if stderr.contains("rate limit") || stderr.contains("API rate limit exceeded") {
                return Err(TrackerError::RateLimited { retry_after_secs: 60 });
            }
            return Err(TrackerError::CommandFailed(format!(
                "gh {:?} failed: {stderr}",
                args
            )));
        }
        Ok(stdout)
    }

    async fn head_sha_for(&self, number: i64) -> Option<String> {
        #[derive(Deserialize)]
        struct HeadRef {
            #[serde(rename = "headRefOid")]
            head_ref_oid: String,
        }
        let n = number.to_string();
        let out = self.run(&["pr", "view", &n, "--json", "headRefOid"]).await.ok()?;
        serde_json::from_str::<HeadRef>(&out).ok().map(|h| h.head_ref_oid)
    }
}

#[derive(Debug, Deserialize)]
struct GhIssue {
    number: i64,
    title: String,
    body: Option<String>,
    labels: Vec<GhLabel>,
    milestone: Option<GhMilestone>,
    #[serde(rename = "createdAt")]
    created_at: chrono::DateTime<chrono::Utc>,
    assignees: Vec<GhAssignee>,
}

#[derive(Debug, Deserialize)]
struct GhLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GhMilestone {
    title: String,
}

#[derive(Debug, Deserialize)]
struct GhAssignee {
    login: String,
}

impl From<GhIssue> for Issue {
    fn from(gh: GhIssue) -> Self {
        Issue {
            id: gh.number,
            title: gh.title,
            body: gh.body.unwrap_or_default(),
            labels: gh.labels.into_iter().map(|l| l.name).collect::<BTreeSet<_>>(),
            milestone: gh.milestone.map(|m| m.title),
            created_at: gh.created_at,
            assignees: gh.assignees.into_iter().map(|a| a.login).collect(),
        }
    }
}

const ISSUE_FIELDS: &str = "number,title,body,labels,milestone,createdAt,assignees";

#[async_trait]
impl IssueTracker for GitHubTracker {
    async fn list_issues(&self, label: &str) -> Result<Vec<Issue>, TrackerError> {
        let out = self
            .run(&["issue", "list", "--label", label, "--json", ISSUE_FIELDS, "--limit", "200"])
            .await?;
        let issues: Vec<GhIssue> =
            serde_json::from_str(&out).map_err(|e| TrackerError::MalformedResponse(e.to_string()))?;
        Ok(issues.into_iter().map(Issue::from).collect())
    }

    async fn get_issue(&self, id: i64) -> Result<Issue, TrackerError> {
        let id_str = id.to_string();
        let out = self
            .run(&["issue", "view", &id_str, "--json", ISSUE_FIELDS])
            .await?;
        let issue: GhIssue =
            serde_json::from_str(&out).map_err(|e| TrackerError::MalformedResponse(e.to_string()))?;
        Ok(issue.into())
    }

    async fn add_label(&self, id: i64, label: &str) -> Result<(), TrackerError> {
        let id_str = id.to_string();
        self.run(&["issue", "edit", &id_str, "--add-label", label]).await?;
        Ok(())
    }

    async fn remove_label(&self, id: i64, label: &str) -> Result<(), TrackerError> {
        let id_str = id.to_string();
        self.run(&["issue", "edit", &id_str, "--remove-label", label]).await?;
        Ok(())
    }

    async fn comment(&self, id: i64, body: &str) -> Result<(), TrackerError> {
        let id_str = id.to_string();
        self.run(&["issue", "comment", &id_str, "--body", body]).await?;
        Ok(())
    }

    async fn close(&self, id: i64) -> Result<(), TrackerError> {
        let id_str = id.to_string();
        self.run(&["issue", "close", &id_str]).await?;
        Ok(())
    }

    async fn create_pr(
        &self,
        branch: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequest, TrackerError> {
        let out = self
            .run(&["pr", "create", "--head", branch, "--base", base, "--title", title, "--body", body])
            .await?;
        let url = out.trim().to_string();
        let number = url
            .rsplit('/')
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| TrackerError::MalformedResponse(format!("could not parse PR number from {url}")))?;
        let head_sha = self.head_sha_for(number).await;
        Ok(PullRequest { number, url, state: PrState::Open, mergeable: None, head_sha })
    }

    async fn merge_pr(&self, number: i64) -> Result<(), TrackerError> {
        let n = number.to_string();
        self.run(&["pr", "merge", &n, "--squash", "--delete-branch"]).await?;
        Ok(())
    }

    async fn find_open_pr(&self, head: &str) -> Result<Option<PullRequest>, TrackerError> {
        let out = self
            .run(&[
                "pr", "list", "--head", head, "--state", "open", "--json", "number,url,mergeable,headRefOid",
            ])
            .await?;

        #[derive(Deserialize)]
        struct GhPr {
            number: i64,
            url: String,
            mergeable: Option<String>,
            #[serde(rename = "headRefOid")]
            head_ref_oid: Option<String>,
        }
        let prs: Vec<GhPr> =
            serde_json::from_str(&out).map_err(|e| TrackerError::MalformedResponse(e.to_string()))?;

        Ok(prs.into_iter().next().map(|p| PullRequest {
            number: p.number,
            url: p.url,
            state: PrState::Open,
            mergeable: p.mergeable.map(|m| m.eq_ignore_ascii_case("mergeable")),
            head_sha: p.head_ref_oid,
        }))
    }

    async fn branch_protection(&self, branch: &str) -> Result<Option<BranchProtection>, TrackerError> {
        let path = format!("repos/{}/branches/{}/protection", self.repo, branch);
        match self.run(&["api", &path]).await {
            Ok(out) => {
                #[derive(Deserialize)]
                struct Protection {
                    required_pull_request_reviews: Option<ReviewsField>,
                    required_status_checks: Option<ChecksField>,
                    enforce_admins: Option<EnforceAdmins>,
                }
                #[derive(Deserialize)]
                struct ReviewsField {
                    required_approving_review_count: u32,
                }
                #[derive(Deserialize)]
                struct ChecksField {
                    contexts: Vec<String>,
                }
                #[derive(Deserialize)]
                struct EnforceAdmins {
                    enabled: bool,
                }
                let p: Protection =
                    serde_json::from_str(&out).map_err(|e| TrackerError::MalformedResponse(e.to_string()))?;
                Ok(Some(BranchProtection {
                    required_reviews: p
                        .required_pull_request_reviews
                        .map(|r| r.required_approving_review_count)
                        .unwrap_or(0),
                    required_checks: p.required_status_checks.map(|c| c.contexts).unwrap_or_default(),
                    enforce_admins: p.enforce_admins.map(|e| e.enabled).unwrap_or(false),
                }))
            }
            Err(TrackerError::CommandFailed(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_check_runs(&self, sha: &str) -> Result<Vec<CheckRun>, TrackerError> {
        let path = format!("repos/{}/commits/{}/check-runs", self.repo, sha);
        let out = self.run(&["api", &path]).await?;

        #[derive(Deserialize)]
        struct CheckRunsResponse {
            check_runs: Vec<GhCheckRun>,
        }
        #[derive(Deserialize)]
        struct GhCheckRun {
            name: String,
            status: String,
            conclusion: Option<String>,
            completed_at: Option<chrono::DateTime<chrono::Utc>>,
        }
        let resp: CheckRunsResponse =
            serde_json::from_str(&out).map_err(|e| TrackerError::MalformedResponse(e.to_string()))?;

        Ok(resp
            .check_runs
            .into_iter()
            .map(|c| CheckRun {
                name: c.name,
                status: match c.status.as_str() {
                    "queued" => CheckStatus::Queued,
                    "in_progress" => CheckStatus::InProgress,
                    _ => CheckStatus::Completed,
                },
                conclusion: c.conclusion.map(|concl| match concl.as_str() {
                    "success" => CheckConclusion::Success,
                    "cancelled" => CheckConclusion::Cancelled,
                    "timed_out" => CheckConclusion::TimedOut,
                    _ => CheckConclusion::Failure,
                }),
                completed_at: c.completed_at,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gh_issue_converts_into_issue() {
        let gh = GhIssue {
            number: 42,
            title: "Fix it".into(),
            body: Some("please".into()),
            labels: vec![GhLabel { name: "bug".into() }],
            milestone: None,
            created_at: chrono::Utc::now(),
            assignees: vec![],
        };
        let issue: Issue = gh.into();
        assert_eq!(issue.id, 42);
        assert!(issue.has_label("bug"));
    }
}

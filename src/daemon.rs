//! The Daemon Supervisor (C5): the outer tick loop that watches the issue
//! tracker, admits work through the triage engine, spawns one subprocess per
//! admitted job, reaps finished ones, and folds outcomes back into the
//! learning tables (spec.md §4.5).
//!
//! Grounded on the teacher's "spawn a subprocess per unit of work, track its
//! handle, reap on exit" shape (the now-superseded `cmd/swarm.rs` and
//! `factory/agent_executor.rs` — both trimmed once [`crate::pipeline`]
//! replaced the phase-based runner, but the shape survives here), and on
//! [`crate::executor::claude::ClaudeExecutor`]'s subprocess-spawn pattern for
//! the actual `tokio::process::Command` plumbing. The rate-limit circuit
//! breaker and pre-flight auth probe are new logic grounded in the same
//! retry/backoff vocabulary [`crate::review::dispatcher`] uses for specialist
//! timeouts: a bounded exponential backoff rather than failing forever.

use crate::config::Config;
use crate::errors::DaemonError;
use crate::executor::Executor;
use crate::learning;
use crate::progress::{self, JobObservables, ProgressRecord, Response, Verdict};
use crate::state::{CompletedOutcome, ConfigSnapshot, StateStore};
use crate::tracker::{GitTracker, IssueTracker};
use crate::triage::{self, complexity::LiteralHeuristic};
use chrono::{DateTime, Utc};
use shipwright_common::{Issue, Job};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{info, warn};

/// How often the pre-flight auth probe re-runs while the daemon is healthy.
const PREFLIGHT_INTERVAL: chrono::Duration = chrono::Duration::minutes(5);
/// Circuit-breaker backoff schedule on consecutive tracker failures,
/// capped at 300s (spec.md §4.5).
const CIRCUIT_BACKOFF_SECS: &[u64] = &[30, 60, 120, 240, 300];

/// Per-job bookkeeping the supervisor keeps in memory (not persisted):
/// the spawned child, the git SHA snapshot taken when it started (for
/// diff-stat progress collection), and its progress record.
struct RunningJob {
    child: Child,
    before_sha: Option<String>,
    progress: ProgressRecord,
}

/// The outer supervisor loop. One per daemon process; `DaemonState` (in
/// [`crate::state`]) is the cross-process source of truth, this struct is
/// just the in-memory half that can't be persisted (child handles).
pub struct DaemonSupervisor {
    config: Arc<Config>,
    tracker: Arc<dyn IssueTracker>,
    executor: Arc<dyn Executor>,
    store: StateStore,
    machine_id: String,
    running: HashMap<i64, RunningJob>,
    consecutive_tracker_failures: u32,
    circuit_open_until: Option<DateTime<Utc>>,
    last_preflight: Option<DateTime<Utc>>,
}

impl DaemonSupervisor {
    pub fn new(config: Arc<Config>, tracker: Arc<dyn IssueTracker>, executor: Arc<dyn Executor>) -> Result<Self, DaemonError> {
        let store = StateStore::new(config.state_file(), config.events_file());
        store.init(crate::state::model::DaemonState::new(
            config.toml.daemon.max_parallel,
            config.toml.daemon.priority_lane_cap,
            config.toml.pipeline.max_retries,
            ConfigSnapshot {
                poll_interval_secs: config.toml.daemon.poll_interval_secs,
                max_parallel: config.toml.daemon.max_parallel,
                watch_label: config.toml.daemon.watch_label.clone(),
                watch_mode: "label".to_string(),
            },
        ))?;

        Ok(Self {
            machine_id: machine_id(),
            config,
            tracker,
            executor,
            store,
            running: HashMap::new(),
            consecutive_tracker_failures: 0,
            circuit_open_until: None,
            last_preflight: None,
        })
    }

    fn claim_label(&self) -> String {
        format!("claimed:{}", self.machine_id)
    }

    /// Whether a user-initiated pause marker is present
    /// ([`Config::pause_file`]). Checked before every tick.
    pub fn is_paused(&self) -> bool {
        self.config.pause_file().exists()
    }

    pub fn pause(&self, reason: &str) -> std::io::Result<()> {
        std::fs::write(
            self.config.pause_file(),
            serde_json::json!({ "reason": reason, "paused_at": Utc::now() }).to_string(),
        )
    }

    pub fn resume(&self) -> std::io::Result<()> {
        if self.config.pause_file().exists() {
            std::fs::remove_file(self.config.pause_file())?;
        }
        Ok(())
    }

    /// Run one pre-flight probe: can we reach the tracker, and does the
    /// executor respond. On failure, writes the auto-pause marker so the
    /// daemon stops admitting new work until a human clears it
    /// (spec.md §5 "pre-flight auth checks").
    async fn preflight(&mut self) -> Result<(), DaemonError> {
        let probe_timeout = Duration::from_secs(self.config.executor.auth_probe_timeout_secs);

        let tracker_ok = tokio::time::timeout(probe_timeout, self.tracker.list_issues(&self.config.toml.daemon.watch_label))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);

        let executor_ok = self.executor.probe(probe_timeout).await.is_ok();

        self.last_preflight = Some(Utc::now());

        if !tracker_ok || !executor_ok {
            let reason = format!(
                "pre-flight failed: tracker_ok={tracker_ok} executor_ok={executor_ok}"
            );
            let _ = self.pause(&reason);
            return Err(DaemonError::PreflightFailed(reason));
        }
        Ok(())
    }

    fn preflight_due(&self) -> bool {
        match self.last_preflight {
            None => true,
            Some(last) => Utc::now() - last >= PREFLIGHT_INTERVAL,
        }
    }

    /// Backoff duration for the current run of consecutive tracker
    /// failures, capped at 300s.
    fn circuit_backoff(&self) -> Duration {
        let idx = (self.consecutive_tracker_failures as usize).saturating_sub(1).min(CIRCUIT_BACKOFF_SECS.len() - 1);
        Duration::from_secs(CIRCUIT_BACKOFF_SECS[idx])
    }

    fn circuit_open(&self) -> bool {
        self.circuit_open_until.map(|until| Utc::now() < until).unwrap_or(false)
    }

    fn record_tracker_failure(&mut self) {
        self.consecutive_tracker_failures += 1;
        let backoff = self.circuit_backoff();
        self.circuit_open_until = Some(Utc::now() + chrono::Duration::seconds(backoff.as_secs() as i64));
        warn!(failures = self.consecutive_tracker_failures, backoff_secs = backoff.as_secs(), "tracker circuit breaker tripped");
    }

    fn record_tracker_success(&mut self) {
        self.consecutive_tracker_failures = 0;
        self.circuit_open_until = None;
    }

    /// The main loop: pause/preflight/circuit checks, one tick, sleep. Runs
    /// until `max_ticks` ticks have executed (`None` means forever) so tests
    /// and `--max-iterations`-bounded CLI invocations can bound it.
    pub async fn run(&mut self, max_ticks: Option<u32>) -> Result<(), DaemonError> {
        let mut ticks = 0u32;
        loop {
            if self.is_paused() {
                info!("daemon paused, skipping tick");
            } else if self.circuit_open() {
                info!("tracker circuit breaker open, skipping tick");
            } else {
                if self.preflight_due() {
                    if let Err(e) = self.preflight().await {
                        warn!(error = %e, "pre-flight check failed");
                    }
                }
                if !self.is_paused() {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "tick failed");
                    }
                }
            }

            ticks += 1;
            if let Some(max) = max_ticks {
                if ticks >= max {
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_secs(self.config.toml.daemon.poll_interval_secs)).await;
        }
    }

    /// One full iteration: fetch candidates, triage and enqueue/admit, spawn
    /// newly admitted jobs, reap finished ones, and check progress on the
    /// rest (spec.md §4.5 steps 2-6).
    pub async fn tick(&mut self) -> Result<(), DaemonError> {
        let candidates = match self.fetch_candidates().await {
            Ok(issues) => {
                self.record_tracker_success();
                issues
            }
            Err(e) => {
                self.record_tracker_failure();
                return Err(e.into());
            }
        };

        for issue in candidates {
            self.triage_and_enqueue(&issue).await?;
        }

        self.admit_queued().await?;
        self.reap_finished().await?;
        self.check_progress().await;

        self.store.apply(|state| state.last_poll = Some(Utc::now()))?;
        Ok(())
    }

    /// Candidates: open issues carrying the watch label, minus ones already
    /// active/queued/blacklisted and ones another daemon instance has
    /// claimed (a `claimed:<machine>` label that isn't ours).
    async fn fetch_candidates(&self) -> Result<Vec<Issue>, DaemonError> {
        let issues = self.tracker.list_issues(&self.config.toml.daemon.watch_label).await?;
        let my_claim = self.claim_label();
        let state = self.store.read()?;

        let mut candidates = Vec::new();
        for issue in issues {
            if state.is_active_or_queued(issue.id) || state.is_blacklisted(issue.id) {
                continue;
            }
            if issue.labels.iter().any(|l| l.starts_with("claimed:") && *l != my_claim) {
                continue;
            }
            if crate::dashboard::claimed_elsewhere(
                self.config.dashboard_url.as_deref(),
                issue.id,
                &self.machine_id,
            )
            .await
            {
                continue;
            }
            candidates.push(issue);
        }
        Ok(candidates)
    }

    /// Triage one candidate and either enqueue it (it has a live blocker
    /// dependency, or capacity is full) or admit it directly when there's
    /// room (spec.md §4.2/§4.5's admission rule).
    async fn triage_and_enqueue(&mut self, issue: &Issue) -> Result<(), DaemonError> {
        let branch_protection = self
            .tracker
            .branch_protection("main")
            .await
            .ok()
            .flatten()
            .map(|bp| crate::triage::templates::BranchProtection {
                required_reviews: bp.required_reviews,
                strict_reviews: bp.enforce_admins,
            })
            .unwrap_or_default();

        let mut ctx = learning::load_template_context(&self.config.optimization_dir());
        ctx.branch_protection = branch_protection;
        ctx.label_overrides = self.config.toml.labels.overrides.clone();
        ctx.dora_window = self.config.toml.daemon.dora_window;

        let state = self.store.read()?;
        let triage_result = triage::triage(issue, &state, &ctx, &LiteralHeuristic)?;
        let priority = issue
            .labels
            .iter()
            .any(|l| self.config.toml.daemon.priority_lane_labels.iter().any(|p| p.eq_ignore_ascii_case(l)));

        let has_live_blocker = issue
            .body
            .split(|c: char| !c.is_ascii_digit() && c != '#')
            .filter_map(|tok| tok.strip_prefix('#'))
            .filter_map(|n| n.parse::<i64>().ok())
            .any(|id| id != issue.id && state.is_active_or_queued(id));

        drop(state);

        if has_live_blocker || !self.store.read()?.has_capacity() {
            self.store.apply(|state| state.add_queued(issue.id, priority))?;
            return Ok(());
        }

        self.admit_one(issue, &triage_result.template, triage_result.score, triage_result.complexity, priority)
            .await
    }

    /// Pop queued issues and admit whatever now fits, re-fetching the issue
    /// snapshot (and re-triaging) since queue dwell time may have changed
    /// its blockers or priority.
    async fn admit_queued(&mut self) -> Result<(), DaemonError> {
        loop {
            if !self.store.read()?.has_capacity() {
                return Ok(());
            }
            let next = self.store.apply(|state| state.pop_queued())?;
            let Some(issue_id) = next else { return Ok(()) };

            let issue = match self.tracker.get_issue(issue_id).await {
                Ok(i) => i,
                Err(e) => {
                    warn!(issue_id, error = %e, "failed to refetch queued issue; dropping");
                    continue;
                }
            };

            let mut ctx = learning::load_template_context(&self.config.optimization_dir());
            ctx.dora_window = self.config.toml.daemon.dora_window;
            ctx.label_overrides = self.config.toml.labels.overrides.clone();
            let state = self.store.read()?;
            let triage_result = triage::triage(&issue, &state, &ctx, &LiteralHeuristic)?;
            let priority = issue
                .labels
                .iter()
                .any(|l| self.config.toml.daemon.priority_lane_labels.iter().any(|p| p.eq_ignore_ascii_case(l)));
            let has_live_blocker = issue
                .body
                .split(|c: char| !c.is_ascii_digit() && c != '#')
                .filter_map(|tok| tok.strip_prefix('#'))
                .filter_map(|n| n.parse::<i64>().ok())
                .any(|id| id != issue.id && state.is_active_or_queued(id));
            drop(state);

            if has_live_blocker {
                self.store.apply(|state| state.add_queued(issue_id, priority))?;
                return Ok(());
            }

            self.admit_one(&issue, &triage_result.template, triage_result.score, triage_result.complexity, priority)
                .await?;
        }
    }

    async fn admit_one(&mut self, issue: &Issue, template: &str, score: u8, complexity: u8, priority: bool) -> Result<(), DaemonError> {
        let worktree = self.config.worktree_for(issue.id);
        std::fs::create_dir_all(&worktree).ok();

        let pid_placeholder = 0u32;
        let job = Job::new(issue.id, pid_placeholder, worktree.clone(), template, score, complexity).with_priority(priority);

        let admitted = self.store.apply(|state| state.admit(job))?;
        if admitted.is_err() {
            self.store.apply(|state| state.add_queued(issue.id, priority))?;
            return Ok(());
        }

        let _ = self.tracker.add_label(issue.id, &self.claim_label()).await;
        crate::dashboard::record_claim(self.config.dashboard_url.as_deref(), issue.id, &self.machine_id).await;
        self.spawn_runner(issue.id, template, &worktree).await
    }

    /// Spawn one subprocess re-invoking this same binary's `pipeline start`
    /// command (the teacher's "one subprocess per unit of work" shape). The
    /// OS pid is recorded into `Job::pid` for crash-recovery visibility;
    /// the `Child` handle itself only lives in this process's memory.
    async fn spawn_runner(&mut self, issue_id: i64, template: &str, worktree: &std::path::Path) -> Result<(), DaemonError> {
        let exe = std::env::current_exe().map_err(|e| DaemonError::PreflightFailed(e.to_string()))?;
        let mut cmd = Command::new(exe);
        cmd.arg("pipeline")
            .arg("start")
            .arg("--issue")
            .arg(issue_id.to_string())
            .arg("--pipeline")
            .arg(template)
            .env("SHIPWRIGHT_HOME", &self.config.home)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());

        let child = cmd.spawn().map_err(|e| DaemonError::PreflightFailed(e.to_string()))?;
        let pid = child.id().unwrap_or(0);
        self.store.apply(|state| {
            if let Some(job) = state.active_jobs.get_mut(&issue_id) {
                job.pid = pid;
            }
        })?;

        let before_sha = GitTracker::new(worktree).ok().and_then(|g| g.snapshot_before("daemon admit").ok());
        let progress = ProgressRecord::load_or_new(&self.config.progress_dir(), issue_id);
        self.running.insert(issue_id, RunningJob { child, before_sha, progress });
        Ok(())
    }

    /// Poll every spawned child; for each that has exited, record the
    /// outcome in `DaemonState`, feed the learning tables, release the
    /// claim label, and drop its progress record.
    async fn reap_finished(&mut self) -> Result<(), DaemonError> {
        let finished: Vec<i64> = self
            .running
            .iter_mut()
            .filter_map(|(id, job)| match job.child.try_wait() {
                Ok(Some(_)) => Some(*id),
                _ => None,
            })
            .collect();

        for issue_id in finished {
            let Some(mut job) = self.running.remove(&issue_id) else { continue };
            let status = job.child.try_wait().ok().flatten();
            let succeeded = status.map(|s| s.success()).unwrap_or(false);

            let template = self
                .store
                .read()
                .ok()
                .and_then(|s| s.active_jobs.get(&issue_id).map(|j| j.template.clone()))
                .unwrap_or_else(|| self.config.toml.pipeline.default_template.clone());

            let started_at = self
                .store
                .read()
                .ok()
                .and_then(|s| s.active_jobs.get(&issue_id).map(|j| j.started_at))
                .unwrap_or_else(Utc::now);
            let duration_secs = (Utc::now() - started_at).num_seconds().max(0);

            self.store.apply(|state| {
                state.complete(
                    issue_id,
                    CompletedOutcome {
                        issue_id,
                        template: template.clone(),
                        succeeded,
                        quality_score: None,
                        completed_at: Utc::now(),
                    },
                );
            })?;

            let _ = learning::record_pipeline_duration(
                &self.config.learning_dir(),
                learning::PipelineDuration { template: template.clone(), issue_id, duration_secs, succeeded },
            );
            let _ = learning::record_template_outcome(&self.config.optimization_dir(), &template, succeeded);

            let _ = self.tracker.remove_label(issue_id, &self.claim_label()).await;
            let _ = job.progress.clear();

            info!(issue_id, succeeded, duration_secs, "job reaped");
        }

        Ok(())
    }

    /// Assess progress for every still-running job and act on the verdict:
    /// log when slowing, nudge with a tracker comment when stalled, kill
    /// and record when stuck (spec.md §4.4 "graduated response").
    async fn check_progress(&mut self) {
        let issue_ids: Vec<i64> = self.running.keys().copied().collect();
        for issue_id in issue_ids {
            let worktree = self.config.worktree_for(issue_id);
            let still_running = self
                .running
                .get_mut(&issue_id)
                .map(|j| j.child.try_wait().ok().flatten().is_none())
                .unwrap_or(false);
            if !still_running {
                continue;
            }

            let before_sha = self.running.get(&issue_id).and_then(|j| j.before_sha.clone());
            let Some(before_sha) = before_sha else { continue };

            let last_error_signature = self.tail_error_signature(issue_id);
            let observables = JobObservables {
                worktree: &worktree,
                before_sha: &before_sha,
                last_error_signature,
                executor_subprocess_active: true,
            };

            let snapshot = match progress::collect_snapshot(&observables) {
                Ok(s) => s,
                Err(e) => {
                    warn!(issue_id, error = %e, "progress snapshot collection failed");
                    continue;
                }
            };

            let verdict = if let Some(job) = self.running.get_mut(&issue_id) {
                let v = progress::assess(&mut job.progress, snapshot, true);
                let _ = job.progress.save();
                v
            } else {
                continue;
            };

            self.respond_to_verdict(issue_id, verdict).await;
        }
    }

    /// Tail the most recently modified executor output log for `issue_id`
    /// and return a signature (the last non-empty line) when it looks like
    /// an error, so `assess` can detect repeated identical failures.
    fn tail_error_signature(&self, issue_id: i64) -> Option<String> {
        let log_dir = self.config.logs_dir().join(format!("issue-{issue_id}"));
        let entries = std::fs::read_dir(&log_dir).ok()?;
        let latest = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|ext| ext == "log").unwrap_or(false))
            .max_by_key(|e| e.metadata().and_then(|m| m.modified()).ok())?;

        let content = std::fs::read_to_string(latest.path()).ok()?;
        let last_line = content.lines().rev().find(|l| !l.trim().is_empty())?;
        if last_line.to_lowercase().contains("error") {
            Some(last_line.to_string())
        } else {
            None
        }
    }

    async fn respond_to_verdict(&mut self, issue_id: i64, verdict: Verdict) {
        match verdict.response() {
            Response::Ignore => {}
            Response::Log => {
                info!(issue_id, ?verdict, "job progress slowing");
            }
            Response::Nudge => {
                warn!(issue_id, ?verdict, "job stalled, nudging");
                let _ = self
                    .tracker
                    .comment(issue_id, "Shipwright: this job hasn't made measurable progress in a while. Still working on it.")
                    .await;
            }
            Response::Kill => {
                warn!(issue_id, ?verdict, "job stuck, killing");
                if let Some(mut job) = self.running.remove(&issue_id) {
                    let _ = job.child.start_kill();
                    let _ = job.progress.clear();
                }
                let _ = self.store.apply(|state| {
                    state.complete(
                        issue_id,
                        CompletedOutcome {
                            issue_id,
                            template: state
                                .active_jobs
                                .get(&issue_id)
                                .map(|j| j.template.clone())
                                .unwrap_or_default(),
                            succeeded: false,
                            quality_score: None,
                            completed_at: Utc::now(),
                        },
                    );
                });
                let _ = self.tracker.remove_label(issue_id, &self.claim_label()).await;
                let _ = self
                    .tracker
                    .comment(issue_id, "Shipwright: this job appears stuck and has been stopped. It will be retried if under the retry limit.")
                    .await;
            }
        }
    }
}

/// A best-effort stable identifier for this daemon instance, used to tag
/// issues it has claimed so a second daemon instance watching the same
/// label doesn't double-admit. Falls back to the process id when no
/// hostname is available.
fn machine_id() -> String {
    std::env::var("SHIPWRIGHT_MACHINE_ID")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("pid-{}", std::process::id()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutorContext, ExecutorOutput};
    use crate::tracker::offline::OfflineTracker;
    use async_trait::async_trait;
    use tempfile::tempdir;

    struct StubExecutor;

    #[async_trait]
    impl Executor for StubExecutor {
        async fn run(&self, ctx: &ExecutorContext) -> Result<ExecutorOutput, crate::errors::ExecutorError> {
            Ok(ExecutorOutput::Present { text: ctx.completion_tag.clone() })
        }
        async fn probe(&self, _timeout: Duration) -> Result<(), crate::errors::ExecutorError> {
            Ok(())
        }
    }

    fn config() -> Arc<Config> {
        let dir = tempdir().unwrap();
        let home = dir.path().join("home");
        std::mem::forget(dir);
        Arc::new(Config::new(home, false).unwrap())
    }

    fn supervisor() -> DaemonSupervisor {
        DaemonSupervisor::new(config(), Arc::new(OfflineTracker::new()), Arc::new(StubExecutor)).unwrap()
    }

    #[test]
    fn claim_label_embeds_machine_id() {
        let s = supervisor();
        assert!(s.claim_label().starts_with("claimed:"));
    }

    #[test]
    fn circuit_backoff_schedule_is_monotonic_and_capped() {
        let mut s = supervisor();
        let mut last = Duration::from_secs(0);
        for _ in 0..8 {
            s.record_tracker_failure();
            let backoff = s.circuit_backoff();
            assert!(backoff >= last);
            assert!(backoff <= Duration::from_secs(300));
            last = backoff;
        }
    }

    #[test]
    fn circuit_opens_after_failure_and_clears_on_success() {
        let mut s = supervisor();
        assert!(!s.circuit_open());
        s.record_tracker_failure();
        assert!(s.circuit_open());
        s.record_tracker_success();
        assert!(!s.circuit_open());
    }

    #[test]
    fn pause_and_resume_toggle_the_marker_file() {
        let s = supervisor();
        assert!(!s.is_paused());
        s.pause("testing").unwrap();
        assert!(s.is_paused());
        s.resume().unwrap();
        assert!(!s.is_paused());
    }

    #[tokio::test]
    async fn fetch_candidates_excludes_issues_claimed_by_another_machine() {
        let s = supervisor();
        let tracker = OfflineTracker::new();
        tracker.seed(Issue::new(1, "t", "b").with_labels([s.config.toml.daemon.watch_label.as_str(), "claimed:other-machine"]));
        tracker.seed(Issue::new(2, "t", "b").with_labels([s.config.toml.daemon.watch_label.as_str()]));
        let s2 = DaemonSupervisor::new(s.config.clone(), Arc::new(tracker), s.executor.clone()).unwrap();
        let candidates = s2.fetch_candidates().await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, 2);
    }

    #[tokio::test]
    async fn preflight_succeeds_against_offline_tracker_and_stub_executor() {
        let mut s = supervisor();
        assert!(s.preflight().await.is_ok());
        assert!(!s.is_paused());
    }
}

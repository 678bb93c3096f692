//! The `DaemonState` blob: the single persistent source of truth for what
//! the daemon is currently doing (spec.md §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipwright_common::Job;
use std::collections::{HashMap, VecDeque};

/// A single completed-job outcome, kept in a bounded ring for triage memory
/// and DORA-style change-failure-rate computation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedOutcome {
    pub issue_id: i64,
    pub template: String,
    pub succeeded: bool,
    pub quality_score: Option<u8>,
    pub completed_at: DateTime<Utc>,
}

/// A bounded record of a failure signature, used to detect repeated
/// identical failures (plateau / escalation logic in the pipeline runner).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub issue_id: i64,
    pub signature: String,
    pub ts: DateTime<Utc>,
}

/// Snapshot of the knobs in effect when the state was last written. Not
/// authoritative for config (that's `Config`/`ShipwrightToml`) — this is
/// what the daemon was actually running with, for observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub poll_interval_secs: u64,
    pub max_parallel: usize,
    pub watch_label: String,
    pub watch_mode: String,
}

const COMPLETED_RING_SIZE: usize = 200;
const FAILURE_RING_SIZE: usize = 200;

/// The full daemon state blob, serialized to `state.json`.
///
/// Invariants (spec.md §3, enforced by the mutators in this module and by
/// `StateStore::admit`, never by ad-hoc field writes elsewhere):
/// 1. `active_jobs.len() <= max_parallel`.
/// 2. `active_jobs` and `queued` are disjoint.
/// 3. every `active_jobs[*].pid` is believed alive; reaping happens in the
///    same update that records completion.
/// 4. `priority_lane_active subseteq active_jobs` and
///    `priority_lane_active.len() <= priority_lane_cap`.
/// 5. `retry_counts[i] <= max_retries` for every `i`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonState {
    pub active_jobs: HashMap<i64, Job>,
    pub queued: VecDeque<i64>,
    pub priority_lane_active: Vec<i64>,
    pub completed: VecDeque<CompletedOutcome>,
    pub retry_counts: HashMap<i64, u32>,
    pub blacklisted: Vec<i64>,
    pub failure_history: VecDeque<FailureRecord>,
    pub config: ConfigSnapshot,
    pub max_parallel: usize,
    pub priority_lane_cap: usize,
    pub max_retries: u32,
    pub started_at: DateTime<Utc>,
    pub last_poll: Option<DateTime<Utc>>,
    pub pid: u32,
}

impl DaemonState {
    pub fn new(max_parallel: usize, priority_lane_cap: usize, max_retries: u32, config: ConfigSnapshot) -> Self {
        Self {
            active_jobs: HashMap::new(),
            queued: VecDeque::new(),
            priority_lane_active: Vec::new(),
            completed: VecDeque::new(),
            retry_counts: HashMap::new(),
            blacklisted: Vec::new(),
            failure_history: VecDeque::new(),
            config,
            max_parallel,
            priority_lane_cap,
            max_retries,
            started_at: Utc::now(),
            last_poll: None,
            pid: std::process::id(),
        }
    }

    pub fn is_active_or_queued(&self, issue_id: i64) -> bool {
        self.active_jobs.contains_key(&issue_id) || self.queued.contains(&issue_id)
    }

    pub fn is_blacklisted(&self, issue_id: i64) -> bool {
        self.blacklisted.contains(&issue_id)
    }

    /// FIFO enqueue with priority-lane preemption: a priority-tagged id
    /// jumps ahead of non-priority ids already in the queue.
    pub fn add_queued(&mut self, issue_id: i64, priority: bool) {
        if self.is_active_or_queued(issue_id) || self.is_blacklisted(issue_id) {
            return;
        }
        if priority {
            self.queued.push_front(issue_id);
        } else {
            self.queued.push_back(issue_id);
        }
    }

    pub fn pop_queued(&mut self) -> Option<i64> {
        self.queued.pop_front()
    }

    /// Attempt to admit a job, checking every invariant atomically. Returns
    /// `Err(reason)` rather than panicking so the caller can log and retry
    /// next tick.
    pub fn admit(&mut self, job: Job) -> Result<(), String> {
        if self.active_jobs.len() >= self.max_parallel {
            return Err("max_parallel reached".into());
        }
        if self.active_jobs.contains_key(&job.issue_id) {
            return Err(format!("issue {} already active", job.issue_id));
        }
        if job.priority && self.priority_lane_active.len() >= self.priority_lane_cap {
            return Err("priority_lane_cap reached".into());
        }
        let retries = *self.retry_counts.get(&job.issue_id).unwrap_or(&0);
        if retries > self.max_retries {
            return Err(format!("issue {} exceeded max_retries", job.issue_id));
        }

        self.queued.retain(|id| *id != job.issue_id);
        if job.priority {
            self.priority_lane_active.push(job.issue_id);
        }
        self.active_jobs.insert(job.issue_id, job);
        Ok(())
    }

    /// Moves an active job to completed, releasing its priority slot and
    /// any progress-file bookkeeping (progress files themselves live under
    /// `progress/`, cleared by the caller).
    pub fn complete(&mut self, issue_id: i64, outcome: CompletedOutcome) {
        self.active_jobs.remove(&issue_id);
        self.priority_lane_active.retain(|id| *id != issue_id);

        if !outcome.succeeded {
            let entry = self.retry_counts.entry(issue_id).or_insert(0);
            *entry += 1;
            if *entry > self.max_retries && !self.blacklisted.contains(&issue_id) {
                self.blacklisted.push(issue_id);
            }
        } else {
            self.retry_counts.remove(&issue_id);
        }

        self.completed.push_back(outcome);
        while self.completed.len() > COMPLETED_RING_SIZE {
            self.completed.pop_front();
        }
    }

    pub fn record_failure(&mut self, issue_id: i64, signature: impl Into<String>) {
        self.failure_history.push_back(FailureRecord {
            issue_id,
            signature: signature.into(),
            ts: Utc::now(),
        });
        while self.failure_history.len() > FAILURE_RING_SIZE {
            self.failure_history.pop_front();
        }
    }

    pub fn active_count(&self) -> usize {
        self.active_jobs.len()
    }

    pub fn has_capacity(&self) -> bool {
        self.active_jobs.len() < self.max_parallel
    }

    /// The most recent `window` completed outcomes, used for DORA-style
    /// change-failure-rate computation in triage template selection.
    pub fn recent_completions(&self, window: usize) -> Vec<&CompletedOutcome> {
        self.completed.iter().rev().take(window).collect()
    }

    /// Checks the five invariants; used in tests and as a paranoia check
    /// before writing the blob back to disk.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.active_jobs.len() > self.max_parallel {
            return Err("invariant 1 violated: active_jobs exceeds max_parallel".into());
        }
        for id in self.active_jobs.keys() {
            if self.queued.contains(id) {
                return Err(format!("invariant 2 violated: issue {id} is both active and queued"));
            }
        }
        if self.priority_lane_active.len() > self.priority_lane_cap {
            return Err("invariant 4 violated: priority_lane_active exceeds cap".into());
        }
        for id in &self.priority_lane_active {
            if !self.active_jobs.contains_key(id) {
                return Err(format!("invariant 4 violated: priority slot {id} not in active_jobs"));
            }
        }
        for (id, count) in &self.retry_counts {
            if *count > self.max_retries && !self.blacklisted.contains(id) {
                return Err(format!("invariant 5 violated: issue {id} exceeds max_retries but isn't blacklisted"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn cfg() -> ConfigSnapshot {
        ConfigSnapshot {
            poll_interval_secs: 30,
            max_parallel: 2,
            watch_label: "ready".into(),
            watch_mode: "label".into(),
        }
    }

    fn job(id: i64, priority: bool) -> Job {
        Job::new(id, 100, PathBuf::from("/tmp/wt"), "fast", 50, 3).with_priority(priority)
    }

    #[test]
    fn admit_respects_max_parallel() {
        let mut state = DaemonState::new(1, 1, 3, cfg());
        assert!(state.admit(job(1, false)).is_ok());
        assert!(state.admit(job(2, false)).is_err());
    }

    #[test]
    fn admit_respects_priority_lane_cap() {
        let mut state = DaemonState::new(5, 1, 3, cfg());
        assert!(state.admit(job(1, true)).is_ok());
        assert!(state.admit(job(2, true)).is_err());
        assert!(state.admit(job(3, false)).is_ok());
    }

    #[test]
    fn priority_queue_preempts_fifo() {
        let mut state = DaemonState::new(5, 5, 3, cfg());
        state.add_queued(1, false);
        state.add_queued(2, false);
        state.add_queued(3, true);
        assert_eq!(state.pop_queued(), Some(3));
        assert_eq!(state.pop_queued(), Some(1));
        assert_eq!(state.pop_queued(), Some(2));
    }

    #[test]
    fn complete_releases_priority_slot_and_removes_from_active() {
        let mut state = DaemonState::new(5, 1, 3, cfg());
        state.admit(job(1, true)).unwrap();
        state.complete(
            1,
            CompletedOutcome {
                issue_id: 1,
                template: "fast".into(),
                succeeded: true,
                quality_score: Some(90),
                completed_at: Utc::now(),
            },
        );
        assert!(state.active_jobs.is_empty());
        assert!(state.priority_lane_active.is_empty());
        assert!(state.admit(job(2, true)).is_ok());
    }

    #[test]
    fn repeated_failures_blacklist_after_max_retries() {
        let mut state = DaemonState::new(5, 1, 1, cfg());
        for _ in 0..3 {
            state.admit(job(7, false)).ok();
            state.complete(
                7,
                CompletedOutcome {
                    issue_id: 7,
                    template: "fast".into(),
                    succeeded: false,
                    quality_score: None,
                    completed_at: Utc::now(),
                },
            );
        }
        assert!(state.is_blacklisted(7));
        assert!(state.admit(job(7, false)).is_err());
    }

    #[test]
    fn invariants_hold_through_admit_and_complete_sequence() {
        let mut state = DaemonState::new(3, 1, 3, cfg());
        state.add_queued(1, false);
        state.add_queued(2, true);
        let id = state.pop_queued().unwrap();
        state.admit(job(id, true)).unwrap();
        assert!(state.check_invariants().is_ok());
        state.complete(
            id,
            CompletedOutcome {
                issue_id: id,
                template: "fast".into(),
                succeeded: true,
                quality_score: Some(80),
                completed_at: Utc::now(),
            },
        );
        assert!(state.check_invariants().is_ok());
    }

    #[test]
    fn recent_completions_returns_most_recent_first() {
        let mut state = DaemonState::new(5, 5, 3, cfg());
        for i in 1..=7 {
            state.completed.push_back(CompletedOutcome {
                issue_id: i,
                template: "fast".into(),
                succeeded: true,
                quality_score: Some(80),
                completed_at: Utc::now(),
            });
        }
        let recent = state.recent_completions(5);
        assert_eq!(recent.len(), 5);
        assert_eq!(recent[0].issue_id, 7);
    }
}

//! The Progress Monitor (C4): a per-job snapshot/assess loop producing
//! verdicts `{healthy, slowing, stalled, stuck}` that drive the Daemon
//! Supervisor's graduated response (spec.md §4.4).
//!
//! Grounded on `gates::ProgressTracker`'s stale-iteration counting
//! (`is_making_progress`), generalized from a single "file count changed"
//! predicate to the full disjunction spec.md §4.4(2) requires, and on
//! [`crate::tracker::git::GitTracker::compute_changes`] for the
//! version-control diff-stat half of the snapshot. [`crate::signals::parser`]
//! supplies the heartbeat-text half when a job's executor output carries
//! `<progress>`/`<blocker>` tags.

use crate::errors::ProgressError;
use crate::pipeline::state::PipelineState;
use crate::tracker::git::GitTracker;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipwright_common::Stage;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

/// How many consecutive `slowing`-or-worse checks before the Supervisor
/// nudges the issue with a comment (spec.md §4.4 defaults).
pub const PROGRESS_CHECKS_BEFORE_WARN: u32 = 3;
/// How many consecutive checks before the Supervisor kills the job.
pub const PROGRESS_CHECKS_BEFORE_KILL: u32 = 6;

/// One point-in-time observation of a job, kept in a ring of the last 10
/// (spec.md §3 "ProgressSnapshot").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub stage: Stage,
    pub iteration: u32,
    pub diff_lines: usize,
    pub files_changed: usize,
    pub last_error_signature: Option<String>,
    pub ts: DateTime<Utc>,
}

/// Verdict drawn from `{healthy, slowing, stalled, stuck}` (spec.md
/// glossary). Ord is declared purely for test convenience (comparing
/// severity); it has no bearing on the assessment logic itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Healthy,
    Slowing,
    Stalled,
    Stuck,
}

/// The graduated response the Supervisor takes for a verdict (spec.md
/// §4.4 "Graduated response").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    Ignore,
    Log,
    Nudge,
    Kill,
}

impl Verdict {
    pub fn response(&self) -> Response {
        match self {
            Verdict::Healthy => Response::Ignore,
            Verdict::Slowing => Response::Log,
            Verdict::Stalled => Response::Nudge,
            Verdict::Stuck => Response::Kill,
        }
    }
}

/// Persisted per-job record: the snapshot ring plus the two counters that
/// drive verdict escalation. Lives at `<home>/progress/issue-<N>.json`
/// (spec.md §6); cleared on job completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub issue_id: i64,
    #[serde(default)]
    pub snapshots: VecDeque<ProgressSnapshot>,
    #[serde(default)]
    pub no_progress_count: u32,
    #[serde(default)]
    pub repeated_error_count: u32,
    #[serde(skip)]
    path: PathBuf,
}

const SNAPSHOT_RING_SIZE: usize = 10;

impl ProgressRecord {
    fn path_for(progress_dir: &Path, issue_id: i64) -> PathBuf {
        progress_dir.join(format!("issue-{issue_id}.json"))
    }

    pub fn new(progress_dir: &Path, issue_id: i64) -> Self {
        Self {
            issue_id,
            snapshots: VecDeque::new(),
            no_progress_count: 0,
            repeated_error_count: 0,
            path: Self::path_for(progress_dir, issue_id),
        }
    }

    pub fn load_or_new(progress_dir: &Path, issue_id: i64) -> Self {
        let path = Self::path_for(progress_dir, issue_id);
        match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<Self>(&content) {
                Ok(mut rec) => {
                    rec.path = path;
                    rec
                }
                Err(_) => Self::new(progress_dir, issue_id),
            },
            Err(_) => Self::new(progress_dir, issue_id),
        }
    }

    pub fn save(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(self)?)
    }

    /// Remove the progress file entirely; called on job completion
    /// (success, failure, or kill) per spec.md §4.5 step 6 / §4.4 response.
    pub fn clear(&self) -> std::io::Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    fn push_snapshot(&mut self, snapshot: ProgressSnapshot) {
        self.snapshots.push_back(snapshot);
        while self.snapshots.len() > SNAPSHOT_RING_SIZE {
            self.snapshots.pop_front();
        }
    }

    pub fn latest(&self) -> Option<&ProgressSnapshot> {
        self.snapshots.back()
    }
}

/// Everything the snapshot-collection step (spec.md §4.4(1)) reads for one
/// job: a heartbeat file the Runner updates, falling back to `PipelineState`,
/// plus a version-control diff stat and the tail of the Runner's error log.
pub struct JobObservables<'a> {
    pub worktree: &'a Path,
    pub before_sha: &'a str,
    pub last_error_signature: Option<String>,
    pub executor_subprocess_active: bool,
}

/// Collect one `ProgressSnapshot` for a job from its worktree and the git
/// diff against `before_sha` (the snapshot taken when the job was admitted).
pub fn collect_snapshot(observables: &JobObservables<'_>) -> Result<ProgressSnapshot, ProgressError> {
    let pstate = PipelineState::load_or_new(observables.worktree, 0, "unknown")
        .map_err(|e| ProgressError::MalformedHeartbeat {
            path: observables.worktree.join(".shipwright/pipeline-state.json"),
            message: e.to_string(),
        })?;

    let stage = pstate.current_stage().unwrap_or(Stage::Intake);
    let iteration = pstate
        .entries
        .last()
        .map(|e| e.iteration)
        .unwrap_or(0);

    let (diff_lines, files_changed) = match GitTracker::new(observables.worktree) {
        Ok(git) => match git.compute_changes(observables.before_sha) {
            Ok(changes) => (
                changes.total_lines_added + changes.total_lines_removed,
                changes.total_files(),
            ),
            Err(e) => return Err(ProgressError::DiffStatFailed(e.to_string())),
        },
        Err(e) => return Err(ProgressError::DiffStatFailed(e.to_string())),
    };

    Ok(ProgressSnapshot {
        stage,
        iteration,
        diff_lines,
        files_changed,
        last_error_signature: observables.last_error_signature.clone(),
        ts: Utc::now(),
    })
}

/// Assess a freshly collected snapshot against the job's progress record,
/// update the record's counters in place, and return the resulting
/// verdict (spec.md §4.4(2)/(3)).
///
/// Progress is any of: stage advanced, iteration advanced, diff_lines grew,
/// files_changed grew, or the executor subprocess is actively consuming
/// CPU. An unchanged error signature advances `repeated_error_count`; a
/// different one resets it to 0 — "different mistakes count as progress"
/// (spec.md glossary).
pub fn assess(
    record: &mut ProgressRecord,
    snapshot: ProgressSnapshot,
    executor_subprocess_active: bool,
) -> Verdict {
    let progressed = match record.latest() {
        None => true,
        Some(prev) => {
            snapshot.stage != prev.stage
                || snapshot.iteration > prev.iteration
                || snapshot.diff_lines > prev.diff_lines
                || snapshot.files_changed > prev.files_changed
                || executor_subprocess_active
        }
    };

    let same_error = match (&record.latest().and_then(|p| p.last_error_signature.clone()), &snapshot.last_error_signature) {
        (Some(prev), Some(cur)) => prev == cur,
        _ => false,
    };

    if same_error {
        record.repeated_error_count += 1;
    } else {
        record.repeated_error_count = 0;
    }

    if progressed {
        // P10: a stage/iteration/diff advance resets no_progress_count.
        record.no_progress_count = 0;
    } else {
        record.no_progress_count += 1;
    }

    record.push_snapshot(snapshot);

    if record.repeated_error_count >= 3 {
        Verdict::Stuck
    } else if record.no_progress_count >= PROGRESS_CHECKS_BEFORE_KILL {
        Verdict::Stuck
    } else if record.no_progress_count >= PROGRESS_CHECKS_BEFORE_WARN {
        Verdict::Stalled
    } else if record.no_progress_count >= 1 {
        Verdict::Slowing
    } else {
        Verdict::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn snap(stage: Stage, iteration: u32, diff_lines: usize, files_changed: usize) -> ProgressSnapshot {
        ProgressSnapshot {
            stage,
            iteration,
            diff_lines,
            files_changed,
            last_error_signature: None,
            ts: Utc::now(),
        }
    }

    #[test]
    fn first_snapshot_is_always_healthy() {
        let dir = tempdir().unwrap();
        let mut rec = ProgressRecord::new(dir.path(), 1);
        let v = assess(&mut rec, snap(Stage::Intake, 0, 0, 0), false);
        assert_eq!(v, Verdict::Healthy);
        assert_eq!(rec.no_progress_count, 0);
    }

    #[test]
    fn no_progress_escalates_to_slowing_then_stalled_then_stuck() {
        let dir = tempdir().unwrap();
        let mut rec = ProgressRecord::new(dir.path(), 1);
        assess(&mut rec, snap(Stage::Build, 1, 10, 1), false);

        let v1 = assess(&mut rec, snap(Stage::Build, 1, 10, 1), false);
        assert_eq!(v1, Verdict::Slowing);

        for _ in 0..2 {
            assess(&mut rec, snap(Stage::Build, 1, 10, 1), false);
        }
        assert_eq!(rec.no_progress_count, 3);

        for _ in 0..3 {
            assess(&mut rec, snap(Stage::Build, 1, 10, 1), false);
        }
        assert_eq!(rec.no_progress_count, 6);
    }

    #[test]
    fn stage_advance_resets_no_progress_count() {
        let dir = tempdir().unwrap();
        let mut rec = ProgressRecord::new(dir.path(), 1);
        assess(&mut rec, snap(Stage::Build, 1, 10, 1), false);
        assess(&mut rec, snap(Stage::Build, 1, 10, 1), false);
        assert!(rec.no_progress_count > 0);

        let v = assess(&mut rec, snap(Stage::Test, 1, 10, 1), false);
        assert_eq!(rec.no_progress_count, 0, "P10: stage advance must reset the counter");
        assert_eq!(v, Verdict::Healthy);
    }

    #[test]
    fn diff_growth_counts_as_progress() {
        let dir = tempdir().unwrap();
        let mut rec = ProgressRecord::new(dir.path(), 1);
        assess(&mut rec, snap(Stage::Build, 1, 10, 1), false);
        let v = assess(&mut rec, snap(Stage::Build, 1, 25, 1), false);
        assert_eq!(v, Verdict::Healthy);
        assert_eq!(rec.no_progress_count, 0);
    }

    #[test]
    fn repeated_identical_error_forces_stuck_regardless_of_no_progress_count() {
        let dir = tempdir().unwrap();
        let mut rec = ProgressRecord::new(dir.path(), 1);
        let mut s = snap(Stage::Build, 1, 10, 1);
        s.last_error_signature = Some("panic: index out of bounds".into());
        assess(&mut rec, s.clone(), false);
        assess(&mut rec, s.clone(), false);
        let v = assess(&mut rec, s, false);
        assert_eq!(v, Verdict::Stuck);
    }

    #[test]
    fn different_errors_do_not_accumulate_repeated_error_count() {
        let dir = tempdir().unwrap();
        let mut rec = ProgressRecord::new(dir.path(), 1);
        let mut s1 = snap(Stage::Build, 1, 10, 1);
        s1.last_error_signature = Some("error A".into());
        let mut s2 = snap(Stage::Build, 1, 10, 1);
        s2.last_error_signature = Some("error B".into());
        assess(&mut rec, s1, false);
        assess(&mut rec, s2, false);
        assert_eq!(rec.repeated_error_count, 0);
    }

    #[test]
    fn executor_cpu_activity_counts_as_progress() {
        let dir = tempdir().unwrap();
        let mut rec = ProgressRecord::new(dir.path(), 1);
        assess(&mut rec, snap(Stage::Build, 1, 10, 1), false);
        let v = assess(&mut rec, snap(Stage::Build, 1, 10, 1), true);
        assert_eq!(v, Verdict::Healthy);
    }

    #[test]
    fn verdict_response_mapping_matches_spec() {
        assert_eq!(Verdict::Healthy.response(), Response::Ignore);
        assert_eq!(Verdict::Slowing.response(), Response::Log);
        assert_eq!(Verdict::Stalled.response(), Response::Nudge);
        assert_eq!(Verdict::Stuck.response(), Response::Kill);
    }

    #[test]
    fn record_round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let mut rec = ProgressRecord::new(dir.path(), 42);
        assess(&mut rec, snap(Stage::Plan, 1, 5, 1), false);
        rec.save().unwrap();

        let loaded = ProgressRecord::load_or_new(dir.path(), 42);
        assert_eq!(loaded.snapshots.len(), 1);
        assert_eq!(loaded.issue_id, 42);
    }

    #[test]
    fn clear_removes_the_progress_file() {
        let dir = tempdir().unwrap();
        let rec = ProgressRecord::new(dir.path(), 7);
        rec.save().unwrap();
        assert!(dir.path().join("issue-7.json").exists());
        rec.clear().unwrap();
        assert!(!dir.path().join("issue-7.json").exists());
    }
}

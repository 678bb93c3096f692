//! Typed error hierarchy for the Shipwright daemon.
//!
//! One enum per component (state store, triage, pipeline runner, progress
//! monitor, daemon supervisor), plus `ShipwrightError` as the umbrella type
//! that the CLI boundary and the supervisor's tick loop match on to decide
//! retry/backoff/abort behavior.

use thiserror::Error;

/// Errors from the state store (C1): locking, (de)serialization, corruption
/// recovery.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to acquire exclusive lock on {path} within {timeout_secs}s")]
    LockTimeout {
        path: std::path::PathBuf,
        timeout_secs: u64,
    },

    #[error("failed to read state file at {path}: {source}")]
    ReadFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write state file at {path}: {source}")]
    WriteFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state file at {path} is corrupt and no usable backup exists: {detail}")]
    Corrupt {
        path: std::path::PathBuf,
        detail: String,
    },

    #[error("state invariant violated: {0}")]
    InvariantViolated(String),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// Errors from the triage engine (C2): scoring, template selection.
#[derive(Debug, Error)]
pub enum TriageError {
    #[error("issue {id} has no labels matching any configured template rule and no fallback template is set")]
    NoTemplateMatch { id: i64 },

    #[error("invalid label-override pattern {pattern:?}: {message}")]
    BadLabelPattern { pattern: String, message: String },

    #[error(transparent)]
    Tracker(#[from] TrackerError),
}

/// Errors from the pipeline runner (C3): stage execution, self-healing,
/// compound quality.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("stage {stage} exhausted its iteration budget ({iterations}) without reaching its exit condition")]
    BudgetExhausted { stage: String, iterations: u32 },

    #[error("stage {stage} backtracked past the allowed limit ({limit})")]
    BacktrackLimitExceeded { stage: String, limit: u32 },

    #[error("executor exited with non-zero code {exit_code} during stage {stage}")]
    ExecutorNonZeroExit { stage: String, exit_code: i32 },

    #[error("quality gate failed for stage {stage}: score {score} is below the floor of {floor}")]
    QualityFloorBreached { stage: String, score: u8, floor: u8 },

    #[error("compound quality plateaued at {issue_count} outstanding findings across consecutive cycles")]
    Plateau { issue_count: usize },

    #[error("no real changes to open a pull request for: diff touches only pipeline bookkeeping files")]
    NoRealChanges,

    #[error("branch protection on {branch} requires checks {required:?} that did not go green within {waited_secs}s")]
    CiChecksTimedOut {
        branch: String,
        required: Vec<String>,
        waited_secs: u64,
    },

    #[error("required check {name:?} failed on {branch}")]
    RequiredCheckFailed { branch: String, name: String },

    #[error("stage {stage} requires artifact {artifact:?} that was never produced")]
    MissingArtifact { stage: String, artifact: String },

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the progress monitor (C4).
#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("heartbeat file at {path} could not be parsed: {message}")]
    MalformedHeartbeat {
        path: std::path::PathBuf,
        message: String,
    },

    #[error("git diff-stat collection failed: {0}")]
    DiffStatFailed(String),
}

/// Errors talking to the issue tracker (C4/C5's GitHub surface).
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("tracker command exited with non-zero status: {0}")]
    CommandFailed(String),

    #[error("authentication with the tracker failed: {0}")]
    AuthFailed(String),

    #[error("rate limited by the tracker, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("tracker response could not be parsed: {0}")]
    MalformedResponse(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors from the opaque agent executor subprocess boundary.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("failed to spawn executor process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("failed to write prompt file at {path}: {source}")]
    PromptWriteFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("executor produced no output before the stage timeout elapsed")]
    Timeout,

    #[error("executor reported an authentication error: {0}")]
    AuthError(String),

    #[error("executor reported a rate limit: {0}")]
    RateLimited(String),
}

/// Errors from the daemon supervisor (C5): polling, admission, candidate
/// selection.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("pre-flight auth check failed: {0}")]
    PreflightFailed(String),

    #[error("circuit breaker open until {retry_at}")]
    CircuitOpen { retry_at: String },

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Triage(#[from] TriageError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),
}

/// Umbrella error type that crosses the CLI boundary. Each variant maps to
/// one of the three process exit codes: success (0), recoverable failure
/// (1), or usage/configuration error (2).
#[derive(Debug, Error)]
pub enum ShipwrightError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Triage(#[from] TriageError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Progress(#[from] ProgressError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Daemon(#[from] DaemonError),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// A check condition came back negative on its own terms — a
    /// regression check, a quality gate evaluated outside the pipeline
    /// runner's own flow — as opposed to a crash. Surfaces as exit code 2
    /// at the CLI boundary, same as `Pipeline::QualityFloorBreached`.
    #[error("{0}")]
    CheckFailed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ShipwrightError {
    /// The process exit code this error should surface as, per the CLI's
    /// 0/1/2 exit-code convention: 1 for operational failures that may
    /// succeed on retry, 2 for configuration/usage errors the user must fix.
    pub fn exit_code(&self) -> i32 {
        match self {
            ShipwrightError::Config(_) => 2,
            ShipwrightError::State(StateError::InvariantViolated(_)) => 2,
            ShipwrightError::Pipeline(PipelineError::QualityFloorBreached { .. }) => 2,
            ShipwrightError::Pipeline(PipelineError::Plateau { .. }) => 2,
            ShipwrightError::CheckFailed(_) => 2,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_error_lock_timeout_carries_path_and_duration() {
        let err = StateError::LockTimeout {
            path: "/tmp/state.json".into(),
            timeout_secs: 5,
        };
        assert!(err.to_string().contains("5s"));
    }

    #[test]
    fn pipeline_error_quality_floor_breached_is_matchable() {
        let err = PipelineError::QualityFloorBreached {
            stage: "compound_quality".into(),
            score: 30,
            floor: 40,
        };
        match &err {
            PipelineError::QualityFloorBreached { score, floor, .. } => {
                assert_eq!(*score, 30);
                assert_eq!(*floor, 40);
            }
            _ => panic!("expected QualityFloorBreached"),
        }
    }

    #[test]
    fn pipeline_error_converts_from_executor_error() {
        let inner = ExecutorError::Timeout;
        let pipeline_err: PipelineError = inner.into();
        assert!(matches!(
            pipeline_err,
            PipelineError::Executor(ExecutorError::Timeout)
        ));
    }

    #[test]
    fn tracker_error_rate_limited_carries_retry_after() {
        let err = TrackerError::RateLimited {
            retry_after_secs: 120,
        };
        assert!(err.to_string().contains("120"));
    }

    #[test]
    fn shipwright_error_exit_codes() {
        assert_eq!(ShipwrightError::Config("bad".into()).exit_code(), 2);
        assert_eq!(
            ShipwrightError::State(StateError::InvariantViolated("x".into())).exit_code(),
            2
        );
        assert_eq!(
            ShipwrightError::Executor(ExecutorError::Timeout).exit_code(),
            1
        );
    }

    #[test]
    fn daemon_error_converts_from_state_error() {
        let inner = StateError::Corrupt {
            path: "/tmp/x".into(),
            detail: "bad json".into(),
        };
        let daemon_err: DaemonError = inner.into();
        assert!(matches!(daemon_err, DaemonError::State(StateError::Corrupt { .. })));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&StateError::InvariantViolated("x".into()));
        assert_std_error(&TriageError::NoTemplateMatch { id: 1 });
        assert_std_error(&ExecutorError::Timeout);
        assert_std_error(&TrackerError::AuthFailed("x".into()));
    }
}

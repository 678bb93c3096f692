//! The opaque agent executor boundary (C3's engine): a trait the pipeline
//! runner drives once per stage iteration, plus the one production
//! implementation that shells out to an LLM coding-agent CLI.
//!
//! The executor is treated as a black box: the runner never inspects *how*
//! it did the work, only whether it produced output, signaled auth/rate-limit
//! trouble, or left the stage's completion tag in its output.

pub mod claude;
pub mod stream;

use crate::errors::ExecutorError;
use async_trait::async_trait;
use shipwright_common::Stage;
use std::path::PathBuf;
use std::time::Duration;

/// Everything the executor needs to run one stage iteration.
pub struct ExecutorContext {
    pub issue_id: i64,
    pub stage: Stage,
    pub iteration: u32,
    pub worktree: PathBuf,
    pub prompt: String,
    /// Tag the executor must emit, e.g. `<promise>BUILD_COMPLETE</promise>`,
    /// for the stage to be considered finished.
    pub completion_tag: String,
    pub log_dir: PathBuf,
    pub timeout: Duration,
}

/// What came back from one executor invocation. Modeled as an explicit
/// tagged variant set rather than inspecting exit codes or substrings ad
/// hoc at call sites.
#[derive(Debug, Clone)]
pub enum ExecutorOutput {
    /// The executor produced output but never emitted the completion tag.
    Absent { text: String },
    /// The completion tag was found; the stage's exit condition is met.
    Present { text: String },
    /// The executor's output matched an authentication-failure marker.
    AuthError(String),
    /// The executor's output matched a rate-limit marker.
    RateLimited(String),
}

impl ExecutorOutput {
    pub fn text(&self) -> Option<&str> {
        match self {
            ExecutorOutput::Absent { text } | ExecutorOutput::Present { text } => Some(text),
            _ => None,
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, ExecutorOutput::Present { .. })
    }
}

#[async_trait]
pub trait Executor: Send + Sync {
    async fn run(&self, ctx: &ExecutorContext) -> Result<ExecutorOutput, ExecutorError>;

    /// A cheap liveness/auth probe used by the daemon's pre-flight check.
    /// Default implementation runs a minimal prompt through `run` with a
    /// short timeout.
    async fn probe(&self, timeout: Duration) -> Result<(), ExecutorError>;
}

/// Markers the `claude` CLI (and compatible agent CLIs) emit on auth
/// failure. Matched case-sensitively against accumulated stdout/stderr.
pub const AUTH_ERROR_MARKERS: &[&str] = &[
    "authentication_error",
    "Invalid API key",
    "Please run /login",
    "not authenticated",
];

/// Markers for rate-limiting / quota exhaustion.
pub const RATE_LIMIT_MARKERS: &[&str] = &[
    "rate_limit_error",
    "rate limited",
    "429",
    "usage limit reached",
];

/// The `(prompt_file, output_file)` names `ClaudeExecutor::run` writes under
/// `ExecutorContext::log_dir`. Exposed so callers that want to attribute an
/// iteration's audit record to those files (without the executor handing
/// back its own `ExecutorSession`) can reconstruct the same paths.
pub fn session_filenames(stage: Stage, iteration: u32) -> (String, String) {
    (
        format!("{}-iter-{}-prompt.md", stage.as_str(), iteration),
        format!("{}-iter-{}-output.log", stage.as_str(), iteration),
    )
}

pub fn classify_output(text: &str, completion_tag: &str) -> ExecutorOutput {
    for marker in AUTH_ERROR_MARKERS {
        if text.contains(marker) {
            return ExecutorOutput::AuthError(marker.to_string());
        }
    }
    for marker in RATE_LIMIT_MARKERS {
        if text.contains(marker) {
            return ExecutorOutput::RateLimited(marker.to_string());
        }
    }
    if text.contains(completion_tag) {
        ExecutorOutput::Present { text: text.to_string() }
    } else {
        ExecutorOutput::Absent { text: text.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_detects_auth_error_before_completion_tag() {
        let out = classify_output("Please run /login to continue", "<promise>DONE</promise>");
        assert!(matches!(out, ExecutorOutput::AuthError(_)));
    }

    #[test]
    fn classify_detects_rate_limit() {
        let out = classify_output("error: rate limited, retry later", "<promise>DONE</promise>");
        assert!(matches!(out, ExecutorOutput::RateLimited(_)));
    }

    #[test]
    fn classify_detects_present_when_tag_found() {
        let out = classify_output("work done\n<promise>DONE</promise>", "<promise>DONE</promise>");
        assert!(out.is_present());
    }

    #[test]
    fn classify_defaults_to_absent() {
        let out = classify_output("still working", "<promise>DONE</promise>");
        assert!(matches!(out, ExecutorOutput::Absent { .. }));
    }
}

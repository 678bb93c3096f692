//! `ClaudeExecutor`: shells out to an LLM coding-agent CLI, streams its
//! `stream-json` stdout, and classifies the result.

use super::stream::{ContentBlock, StreamEvent};
use super::{classify_output, Executor, ExecutorContext, ExecutorOutput};
use crate::audit::{ExecutorSession, TokenUsage};
use crate::config::ExecutorSection;
use crate::errors::ExecutorError;
use async_trait::async_trait;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

pub struct ClaudeExecutor {
    settings: ExecutorSection,
}

impl ClaudeExecutor {
    pub fn new(settings: ExecutorSection) -> Self {
        Self { settings }
    }

    fn flags(&self) -> Vec<String> {
        let mut flags = vec![
            "--print".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--dangerously-skip-permissions".to_string(),
        ];
        flags.extend(self.settings.extra_flags.iter().cloned());
        flags
    }
}

#[async_trait]
impl Executor for ClaudeExecutor {
    async fn run(&self, ctx: &ExecutorContext) -> Result<ExecutorOutput, ExecutorError> {
        std::fs::create_dir_all(&ctx.log_dir).map_err(|e| ExecutorError::PromptWriteFailed {
            path: ctx.log_dir.clone(),
            source: e,
        })?;

        let (prompt_name, output_name) = super::session_filenames(ctx.stage, ctx.iteration);
        let prompt_file = ctx.log_dir.join(prompt_name);
        let output_file = ctx.log_dir.join(output_name);

        std::fs::write(&prompt_file, &ctx.prompt).map_err(|e| ExecutorError::PromptWriteFailed {
            path: prompt_file.clone(),
            source: e,
        })?;

        let mut cmd = Command::new(&self.settings.cmd);
        for flag in self.flags() {
            cmd.arg(flag);
        }
        cmd.current_dir(&ctx.worktree);
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(ExecutorError::SpawnFailed)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(ctx.prompt.as_bytes())
                .await
                .map_err(ExecutorError::SpawnFailed)?;
            stdin.shutdown().await.map_err(ExecutorError::SpawnFailed)?;
        }

        let stdout = child.stdout.take().ok_or(ExecutorError::Timeout)?;
        let mut reader = BufReader::new(stdout).lines();

        let mut accumulated = String::new();
        let mut final_result: Option<String> = None;
        let mut usage: Option<TokenUsage> = None;
        let mut is_error = false;

        let run_fut = async {
            while let Ok(Some(line)) = reader.next_line().await {
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<StreamEvent>(&line) {
                    Ok(StreamEvent::Assistant { message, .. }) => {
                        for block in message.content {
                            match block {
                                ContentBlock::ToolUse { name, input, .. } => {
                                    debug!(stage = %ctx.stage, tool = %super::stream::describe_tool_use(&name, &input), "tool use");
                                }
                                ContentBlock::Text { text } => {
                                    accumulated.push_str(&text);
                                    accumulated.push('\n');
                                }
                            }
                        }
                    }
                    Ok(StreamEvent::Result { result, is_error: err, usage: u, .. }) => {
                        final_result = result;
                        is_error = err;
                        usage = u.map(|u| TokenUsage {
                            input_tokens: u.input_tokens,
                            output_tokens: u.output_tokens,
                        });
                    }
                    Ok(StreamEvent::User { .. }) | Ok(StreamEvent::System { .. }) => {}
                    Err(_) => {
                        accumulated.push_str(&line);
                        accumulated.push('\n');
                    }
                }
            }
        };

        let timed_out = tokio::time::timeout(ctx.timeout, run_fut).await.is_err();
        if timed_out {
            let _ = child.start_kill();
            return Err(ExecutorError::Timeout);
        }

        let status = child.wait().await.map_err(ExecutorError::SpawnFailed)?;
        let exit_code = status.code().unwrap_or(-1);
        let combined = final_result.unwrap_or(accumulated);

        if is_error {
            warn!(stage = %ctx.stage, "executor reported an error result");
        }

        std::fs::write(&output_file, &combined).map_err(|e| ExecutorError::PromptWriteFailed {
            path: output_file.clone(),
            source: e,
        })?;

        let session = ExecutorSession {
            prompt_file,
            prompt_chars: ctx.prompt.len(),
            output_file,
            output_chars: combined.len(),
            exit_code,
            token_usage: usage,
        };
        debug!(
            stage = %ctx.stage,
            elapsed_secs = start.elapsed().as_secs_f64(),
            exit_code,
            "executor iteration finished"
        );
        let _ = session;

        let classified = classify_output(&combined, &ctx.completion_tag);
        match classified {
            ExecutorOutput::AuthError(m) => Err(ExecutorError::AuthError(m)),
            ExecutorOutput::RateLimited(m) => Err(ExecutorError::RateLimited(m)),
            other => Ok(other),
        }
    }

    async fn probe(&self, timeout: std::time::Duration) -> Result<(), ExecutorError> {
        let mut cmd = Command::new(&self.settings.cmd);
        cmd.arg("--print").arg("--output-format").arg("stream-json").arg("ping");
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        let mut child = cmd.spawn().map_err(ExecutorError::SpawnFailed)?;
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.shutdown().await;
        }
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(ExecutorError::SpawnFailed(e)),
            Err(_) => {
                let _ = child.start_kill();
                Err(ExecutorError::Timeout)
            }
        }
    }
}

/// Render a stage-specific prompt: the job's plan/design context plus the
/// completion tag the executor must emit when the stage's exit condition is
/// satisfied.
pub fn render_prompt(
    stage: shipwright_common::Stage,
    task_description: &str,
    context_sections: &[(&str, &str)],
    completion_tag: &str,
) -> String {
    let mut sections = String::new();
    for (title, body) in context_sections {
        sections.push_str(&format!("## {title}\n{body}\n\n"));
    }

    format!(
        "You are driving the `{stage}` stage of an automated delivery pipeline.\n\n\
{sections}\
## TASK\n{task_description}\n\n\
## CRITICAL RULES\n\
1. Do only what this stage requires; later stages handle the rest.\n\
2. Check existing code and prior stage artifacts before making changes.\n\
3. Run any checks available to you to verify your work before claiming completion.\n\
4. Only output `{completion_tag}` when this stage is fully complete and verified.\n\
5. If verification fails, fix it before claiming completion.\n\n\
When complete, output:\n{completion_tag}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipwright_common::Stage;

    #[test]
    fn render_prompt_includes_stage_and_tag() {
        let prompt = render_prompt(
            Stage::Build,
            "Implement the feature per plan.md and design.md.",
            &[("PLAN", "do the thing"), ("DESIGN", "do it this way")],
            "<promise>BUILD_COMPLETE</promise>",
        );
        assert!(prompt.contains("`build` stage"));
        assert!(prompt.contains("## PLAN"));
        assert!(prompt.contains("<promise>BUILD_COMPLETE</promise>"));
    }

    #[test]
    fn flags_include_extra_flags() {
        let settings = ExecutorSection {
            cmd: "claude".into(),
            extra_flags: vec!["--model".into(), "opus".into()],
            auth_probe_timeout_secs: 15,
        };
        let executor = ClaudeExecutor::new(settings);
        let flags = executor.flags();
        assert!(flags.contains(&"--model".to_string()));
        assert!(flags.contains(&"stream-json".to_string()));
    }
}

//! The compound-quality stage: alternates specialist review with a
//! self-fix executor pass for up to a template's cycle budget, scoring each
//! cycle with [`crate::gates::quality_score`] and adapting the remaining
//! budget from [`crate::gates::detect_convergence`].
//!
//! Unlike every other stage, compound quality doesn't render one prompt and
//! wait for a completion tag — it runs a dispatcher against several review
//! specialists, and only calls the executor back in when there's something
//! concrete to fix.

use crate::audit::{ExecutorSession, IterationAudit, StageAudit};
use crate::errors::PipelineError;
use crate::executor::claude::render_prompt;
use crate::executor::{session_filenames, Executor, ExecutorContext};
use crate::gates::{self, CycleTally};
use crate::review::{PhaseReviewConfig, ReviewDispatcher, ReviewSpecialist, SpecialistType};
use crate::tracker::GitTracker;
use chrono::Utc;
use shipwright_common::{Issue, Stage};
use std::path::Path;
use std::time::{Duration, Instant};

use super::completion_tag;

/// Everything a compound-quality run needs, borrowed from the owning
/// `PipelineRunner` for the duration of the stage.
pub struct CompoundQualityContext<'a> {
    pub issue: &'a Issue,
    pub worktree: &'a Path,
    pub log_dir: &'a Path,
    pub git: &'a GitTracker,
    pub executor: &'a dyn Executor,
    pub dispatcher: &'a ReviewDispatcher,
    pub floor: u8,
    pub base_cycles: u32,
    /// Active template name, used to key the learned per-context iteration
    /// recommendation (spec.md §4.3 factor (i)).
    pub template: &'a str,
    pub learning_dir: &'a Path,
    /// Spec.md §7.8/§4.3 factor (iv): an exhausted external cost budget
    /// forces the adaptive cycle limit to zero, regardless of convergence.
    pub budget_exhausted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompoundQualityVerdict {
    Passed { score: u8, cycles: u32 },
    NeedsBacktrack { score: u8, cycles: u32 },
    /// Issue count held identical across two consecutive cycles: further
    /// cycles are assumed not to help, so the stage stops early and fails
    /// rather than exhausting the rest of its budget (spec.md §4.3, §7.9,
    /// scenario S6).
    Plateaued { score: u8, cycles: u32, issue_count: usize },
}

fn review_config(issue: &Issue, cycle: u32, base_cycles: u32) -> PhaseReviewConfig {
    PhaseReviewConfig::new(&issue.id.to_string(), &issue.title)
        .add_specialist(ReviewSpecialist::gating(SpecialistType::SecuritySentinel))
        .add_specialist(ReviewSpecialist::advisory(SpecialistType::PerformanceOracle))
        .add_specialist(ReviewSpecialist::advisory(SpecialistType::ArchitectureStrategist))
        .add_specialist(ReviewSpecialist::advisory(SpecialistType::SimplicityReviewer))
        .with_budget(base_cycles, cycle)
}

fn summarize_findings(findings: &[crate::review::ReviewFinding]) -> String {
    if findings.is_empty() {
        return "No outstanding findings.".to_string();
    }
    findings
        .iter()
        .map(|f| match f.line() {
            Some(line) => format!("- [{:?}] {}:{} — {}", f.severity(), f.file(), line, f.issue()),
            None => format!("- [{:?}] {} — {}", f.severity(), f.file(), f.issue()),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Run the compound-quality stage: review, and if the result doesn't clear
/// the floor, ask the executor to address the findings before reviewing
/// again, up to an adaptively-sized cycle budget.
pub async fn run(
    ctx: &CompoundQualityContext<'_>,
    stage_audit: &mut StageAudit,
) -> Result<CompoundQualityVerdict, PipelineError> {
    let mut history: Vec<CycleTally> = Vec::new();
    let mut limit = ctx.base_cycles.max(1);
    let mut cycle = 0u32;

    loop {
        cycle += 1;

        let dispatch = ctx
            .dispatcher
            .dispatch(review_config(ctx.issue, cycle, ctx.base_cycles))
            .await
            .map_err(PipelineError::Other)?;

        let findings: Vec<_> = dispatch
            .aggregation
            .reports
            .iter()
            .flat_map(|r| r.findings.clone())
            .collect();
        let score = gates::quality_score(&findings);
        history.push(CycleTally { cycle, issue_count: findings.len(), score });

        if gates::passes_floor(score, ctx.floor) && dispatch.can_proceed() {
            return Ok(CompoundQualityVerdict::Passed { score, cycles: cycle });
        }

        if gates::detect_convergence(&history) == gates::Convergence::Plateaued {
            return Ok(CompoundQualityVerdict::Plateaued { score, cycles: cycle, issue_count: findings.len() });
        }

        if cycle >= limit {
            return Ok(CompoundQualityVerdict::NeedsBacktrack { score, cycles: cycle });
        }

        let before_sha = ctx
            .git
            .snapshot_before(&format!("compound_quality fix cycle {cycle}"))?;

        let tag = completion_tag(Stage::CompoundQuality);
        let task = format!(
            "Address the following review findings before the next quality cycle:\n\n{}",
            summarize_findings(&findings)
        );
        let prompt = render_prompt(Stage::CompoundQuality, &task, &[], &tag);

        let exec_ctx = ExecutorContext {
            issue_id: ctx.issue.id,
            stage: Stage::CompoundQuality,
            iteration: cycle,
            worktree: ctx.worktree.to_path_buf(),
            prompt: prompt.clone(),
            completion_tag: tag,
            log_dir: ctx.log_dir.to_path_buf(),
            timeout: Duration::from_secs(1800),
        };

        let started = Instant::now();
        let output = ctx.executor.run(&exec_ctx).await?;
        let elapsed = started.elapsed().as_secs_f64();

        let diffs = ctx.git.get_full_diffs(&before_sha)?;
        let changes = ctx.git.compute_changes(&before_sha)?;
        let (prompt_name, output_name) = session_filenames(Stage::CompoundQuality, cycle);

        stage_audit.iterations.push(IterationAudit {
            iteration: cycle,
            started_at: Utc::now(),
            duration_secs: elapsed,
            executor_session: ExecutorSession {
                prompt_file: ctx.log_dir.join(prompt_name),
                prompt_chars: prompt.len(),
                output_file: ctx.log_dir.join(output_name),
                output_chars: output.text().map(|t| t.len()).unwrap_or(0),
                exit_code: if output.is_present() { 0 } else { 1 },
                token_usage: None,
            },
            git_snapshot_before: before_sha,
            git_snapshot_after: ctx.git.head_sha(),
            file_diffs: diffs,
            completion_found: output.is_present(),
        });
        stage_audit.file_changes = changes;

        let convergence = gates::detect_convergence(&history);
        let prev_issues = history
            .len()
            .checked_sub(2)
            .map(|i| history[i].issue_count)
            .unwrap_or(findings.len());
        let learned = crate::learning::recommended_iterations(ctx.learning_dir, ctx.template, Stage::CompoundQuality);
        limit = gates::pipeline_adaptive_cycles(
            ctx.base_cycles,
            convergence,
            findings.len(),
            prev_issues,
            learned,
            ctx.budget_exhausted,
        );
    }
}

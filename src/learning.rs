//! Learning tables: advisory, rolling-window records the daemon and pipeline
//! runner accumulate across runs and consult for future decisions. Never
//! authoritative — every reader falls back to a literal default when a table
//! is missing, empty, or fails to parse (spec.md §4.2 "quality memory" /
//! "learned template weights").
//!
//! Grounded on the teacher's `patterns::budget_suggester` (rolling
//! last-N-samples-with-a-minimum-sample-size-before-trusting-it shape),
//! generalized here from phase-duration budgets to the five tables spec.md
//! actually needs: pipeline/stage durations, quality-score history,
//! template win rates, and recommended iteration counts. Tables live under
//! [`crate::config::Config::learning_dir`] and
//! [`crate::config::Config::optimization_dir`], matching the file names
//! `triage::templates` already documents consulting
//! (`optimization/template-weights.jsonl`, `optimization/quality-scores.jsonl`).

use crate::review::findings::ReviewFinding;
use crate::triage::templates::{QualityMemory, TemplateContext, TemplateWeight};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const ROLLING_WINDOW: usize = 50;
const MIN_SAMPLE_SIZE: u32 = 3;

fn append_jsonl<T: Serialize>(path: &Path, record: &T) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut line = serde_json::to_string(record)?;
    line.push('\n');
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(line.as_bytes())
}

fn read_jsonl<T: for<'de> Deserialize<'de>>(path: &Path) -> Vec<T> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect()
}

/// Keep only the last `n` records of a JSONL file, rewriting it in place.
/// Called after every append so the file never grows past the rolling
/// window (spec.md's learning tables are explicitly advisory/bounded, never
/// an unbounded log — that's what `events.jsonl` is for).
fn truncate_jsonl<T: Serialize + for<'de> Deserialize<'de>>(path: &Path, n: usize) -> std::io::Result<()> {
    let mut records: Vec<T> = read_jsonl(path);
    if records.len() <= n {
        return Ok(());
    }
    let drop = records.len() - n;
    records.drain(0..drop);
    let mut content = String::new();
    for r in &records {
        content.push_str(&serde_json::to_string(r)?);
        content.push('\n');
    }
    std::fs::write(path, content)
}

// ---------------------------------------------------------------------
// pipeline-durations: one rolling window per template.
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDuration {
    pub template: String,
    pub issue_id: i64,
    pub duration_secs: i64,
    pub succeeded: bool,
}

fn pipeline_durations_file(learning_dir: &Path) -> PathBuf {
    learning_dir.join("pipeline-durations.jsonl")
}

pub fn record_pipeline_duration(learning_dir: &Path, record: PipelineDuration) -> std::io::Result<()> {
    let path = pipeline_durations_file(learning_dir);
    append_jsonl(&path, &record)?;
    truncate_jsonl::<PipelineDuration>(&path, ROLLING_WINDOW)
}

/// p95 duration for a template over its rolling window, or `None` if there's
/// no history yet (callers fall back to a literal default timeout).
pub fn pipeline_p95_duration(learning_dir: &Path, template: &str) -> Option<i64> {
    let mut durations: Vec<i64> = read_jsonl::<PipelineDuration>(&pipeline_durations_file(learning_dir))
        .into_iter()
        .filter(|d| d.template == template)
        .map(|d| d.duration_secs)
        .collect();
    if durations.is_empty() {
        return None;
    }
    durations.sort_unstable();
    let idx = ((durations.len() as f64) * 0.95).ceil() as usize;
    Some(durations[idx.saturating_sub(1).min(durations.len() - 1)])
}

// ---------------------------------------------------------------------
// stage-durations: one rolling window per stage, used for adaptive
// heartbeat/stale timeouts (spec.md §4.5 "adapt" step).
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDuration {
    pub stage: String,
    pub duration_secs: i64,
}

fn stage_durations_file(learning_dir: &Path) -> PathBuf {
    learning_dir.join("stage-durations.jsonl")
}

pub fn record_stage_duration(learning_dir: &Path, stage: shipwright_common::Stage, duration_secs: i64) -> std::io::Result<()> {
    let path = stage_durations_file(learning_dir);
    append_jsonl(&path, &StageDuration { stage: stage.as_str().to_string(), duration_secs })?;
    truncate_jsonl::<StageDuration>(&path, ROLLING_WINDOW)
}

/// p90 duration for a stage over its rolling window.
pub fn stage_p90_duration(learning_dir: &Path, stage: shipwright_common::Stage) -> Option<i64> {
    let mut durations: Vec<i64> = read_jsonl::<StageDuration>(&stage_durations_file(learning_dir))
        .into_iter()
        .filter(|d| d.stage == stage.as_str())
        .map(|d| d.duration_secs)
        .collect();
    if durations.is_empty() {
        return None;
    }
    durations.sort_unstable();
    let idx = ((durations.len() as f64) * 0.90).ceil() as usize;
    Some(durations[idx.saturating_sub(1).min(durations.len() - 1)])
}

// ---------------------------------------------------------------------
// quality-scores: per compound-quality run, feeding TemplateContext's
// `quality_memory` (spec.md §4.2 step 5).
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityScoreRecord {
    pub issue_id: i64,
    pub template: String,
    pub score: u8,
    pub critical_findings: u32,
    pub audits_run: u32,
}

fn quality_scores_file(optimization_dir: &Path) -> PathBuf {
    optimization_dir.join("quality-scores.jsonl")
}

pub fn record_quality_score(
    optimization_dir: &Path,
    issue_id: i64,
    template: &str,
    findings: &[ReviewFinding],
    audits_run: u32,
) -> std::io::Result<()> {
    let score = crate::gates::quality_score(findings);
    let critical_findings = findings.iter().filter(|f| f.severity().is_critical()).count() as u32;
    let path = quality_scores_file(optimization_dir);
    append_jsonl(
        &path,
        &QualityScoreRecord {
            issue_id,
            template: template.to_string(),
            score,
            critical_findings,
            audits_run,
        },
    )?;
    truncate_jsonl::<QualityScoreRecord>(&path, ROLLING_WINDOW)
}

/// Aggregate the rolling quality-score history into the `QualityMemory`
/// template selection consults. Returns `None` with no history, matching
/// `TemplateContext::default().quality_memory == None`.
pub fn load_quality_memory(optimization_dir: &Path) -> Option<QualityMemory> {
    let records = read_jsonl::<QualityScoreRecord>(&quality_scores_file(optimization_dir));
    if records.is_empty() {
        return None;
    }
    let recent_critical_findings: u32 = records.iter().rev().take(5).map(|r| r.critical_findings).sum();
    let avg_score = records.iter().map(|r| r.score as f64).sum::<f64>() / records.len() as f64;
    Some(QualityMemory {
        recent_critical_findings,
        avg_score,
    })
}

// ---------------------------------------------------------------------
// template-weights: per-template sample size + success rate, feeding
// TemplateContext's `learned_weights` (spec.md §4.2 step 6).
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateOutcomeRecord {
    pub template: String,
    pub succeeded: bool,
}

fn template_weights_file(optimization_dir: &Path) -> PathBuf {
    optimization_dir.join("template-weights.jsonl")
}

pub fn record_template_outcome(optimization_dir: &Path, template: &str, succeeded: bool) -> std::io::Result<()> {
    let path = template_weights_file(optimization_dir);
    append_jsonl(&path, &TemplateOutcomeRecord { template: template.to_string(), succeeded })?;
    truncate_jsonl::<TemplateOutcomeRecord>(&path, ROLLING_WINDOW * 5)
}

/// Aggregate per-template success rates. Templates with fewer than
/// `MIN_SAMPLE_SIZE` samples are omitted entirely — `templates::select`'s
/// step 6 already filters on `sample_size >= 3`, but omitting them here too
/// means an accidental lowering of that threshold downstream stays safe.
pub fn load_template_weights(optimization_dir: &Path) -> HashMap<String, TemplateWeight> {
    let records = read_jsonl::<TemplateOutcomeRecord>(&template_weights_file(optimization_dir));
    let mut by_template: HashMap<String, (u32, u32)> = HashMap::new();
    for r in records {
        let entry = by_template.entry(r.template).or_insert((0, 0));
        entry.0 += 1;
        if r.succeeded {
            entry.1 += 1;
        }
    }
    by_template
        .into_iter()
        .filter(|(_, (total, _))| *total >= MIN_SAMPLE_SIZE)
        .map(|(template, (total, successes))| {
            (
                template,
                TemplateWeight {
                    sample_size: total,
                    success_rate: successes as f64 / total as f64,
                },
            )
        })
        .collect()
}

// ---------------------------------------------------------------------
// iteration-model: recommended cycle count per (template, stage) context,
// consulted by the pipeline runner when sizing its iteration budget ahead
// of a self-healing stage (spec.md §4.3 "adaptive cycle limits").
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationRecord {
    pub template: String,
    pub stage: String,
    pub iterations_used: u32,
}

fn iteration_model_file(learning_dir: &Path) -> PathBuf {
    learning_dir.join("iteration-model.jsonl")
}

pub fn record_iterations_used(
    learning_dir: &Path,
    template: &str,
    stage: shipwright_common::Stage,
    iterations_used: u32,
) -> std::io::Result<()> {
    let path = iteration_model_file(learning_dir);
    append_jsonl(
        &path,
        &IterationRecord {
            template: template.to_string(),
            stage: stage.as_str().to_string(),
            iterations_used,
        },
    )?;
    truncate_jsonl::<IterationRecord>(&path, ROLLING_WINDOW)
}

/// Recommended cycle count for `(template, stage)`: the rounded-up average
/// of past usage, or `None` with fewer than `MIN_SAMPLE_SIZE` samples.
pub fn recommended_iterations(learning_dir: &Path, template: &str, stage: shipwright_common::Stage) -> Option<u32> {
    let used: Vec<u32> = read_jsonl::<IterationRecord>(&iteration_model_file(learning_dir))
        .into_iter()
        .filter(|r| r.template == template && r.stage == stage.as_str())
        .map(|r| r.iterations_used)
        .collect();
    if (used.len() as u32) < MIN_SAMPLE_SIZE {
        return None;
    }
    let avg = used.iter().sum::<u32>() as f64 / used.len() as f64;
    Some(avg.ceil() as u32)
}

// ---------------------------------------------------------------------
// complexity-actuals: triage's predicted complexity vs. the actual cycle
// count a job needed, used to calibrate `ComplexityClassifier` impls over
// time (spec.md §9 Open Question #3's literal-heuristic classifier).
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplexityActual {
    pub issue_id: i64,
    pub predicted: u8,
    pub actual_cycles: u32,
}

fn complexity_actuals_file(learning_dir: &Path) -> PathBuf {
    learning_dir.join("complexity-actuals.jsonl")
}

pub fn record_complexity_actual(learning_dir: &Path, record: ComplexityActual) -> std::io::Result<()> {
    let path = complexity_actuals_file(learning_dir);
    append_jsonl(&path, &record)?;
    truncate_jsonl::<ComplexityActual>(&path, ROLLING_WINDOW)
}

// ---------------------------------------------------------------------
// ci-check-durations: how long a PR's required checks actually took to go
// green, feeding the merge stage's adaptive wait (spec.md §4.3 merge:
// "p90 * 1.5, clamped [120, 1800]s").
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CiCheckDuration {
    pub duration_secs: i64,
}

fn ci_check_durations_file(learning_dir: &Path) -> PathBuf {
    learning_dir.join("ci-check-durations.jsonl")
}

pub fn record_ci_check_duration(learning_dir: &Path, duration_secs: i64) -> std::io::Result<()> {
    let path = ci_check_durations_file(learning_dir);
    append_jsonl(&path, &CiCheckDuration { duration_secs })?;
    truncate_jsonl::<CiCheckDuration>(&path, ROLLING_WINDOW)
}

const CI_WAIT_FLOOR_SECS: u64 = 120;
const CI_WAIT_CEILING_SECS: u64 = 1800;
const CI_WAIT_DEFAULT_SECS: u64 = 600;

/// How long the merge stage should poll check runs before giving up:
/// p90 of past CI durations, scaled by 1.5x to leave headroom for a slower
/// run, clamped to a sane floor/ceiling. Falls back to a flat 10 minutes
/// with no history.
pub fn adaptive_ci_wait_secs(learning_dir: &Path) -> u64 {
    let mut durations: Vec<i64> = read_jsonl::<CiCheckDuration>(&ci_check_durations_file(learning_dir))
        .into_iter()
        .map(|d| d.duration_secs)
        .collect();
    if durations.is_empty() {
        return CI_WAIT_DEFAULT_SECS;
    }
    durations.sort_unstable();
    let idx = ((durations.len() as f64) * 0.90).ceil() as usize;
    let p90 = durations[idx.saturating_sub(1).min(durations.len() - 1)].max(0) as u64;
    let scaled = (p90 as f64 * 1.5).round() as u64;
    scaled.clamp(CI_WAIT_FLOOR_SECS, CI_WAIT_CEILING_SECS)
}

/// Build a fully populated `TemplateContext` by loading every learning
/// table this process has access to, leaving the caller to fill in
/// `branch_protection`, `label_overrides`, `dora_window` and
/// `cost_budget_exhausted` from live tracker/config state.
pub fn load_template_context(optimization_dir: &Path) -> TemplateContext {
    TemplateContext {
        quality_memory: load_quality_memory(optimization_dir),
        learned_weights: load_template_weights(optimization_dir),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::findings::FindingSeverity;
    use shipwright_common::Stage;
    use tempfile::tempdir;

    #[test]
    fn missing_tables_yield_literal_defaults() {
        let dir = tempdir().unwrap();
        assert_eq!(pipeline_p95_duration(dir.path(), "standard"), None);
        assert_eq!(stage_p90_duration(dir.path(), Stage::Build), None);
        assert!(load_quality_memory(dir.path()).is_none());
        assert!(load_template_weights(dir.path()).is_empty());
        assert_eq!(recommended_iterations(dir.path(), "standard", Stage::Build), None);
    }

    #[test]
    fn pipeline_duration_p95_reflects_recorded_samples() {
        let dir = tempdir().unwrap();
        for secs in [100, 200, 300, 400, 500] {
            record_pipeline_duration(
                dir.path(),
                PipelineDuration { template: "fast".into(), issue_id: 1, duration_secs: secs, succeeded: true },
            )
            .unwrap();
        }
        let p95 = pipeline_p95_duration(dir.path(), "fast").unwrap();
        assert!(p95 >= 400);
    }

    #[test]
    fn template_weights_omit_low_sample_templates() {
        let dir = tempdir().unwrap();
        record_template_outcome(dir.path(), "fast", true).unwrap();
        record_template_outcome(dir.path(), "fast", true).unwrap();
        let weights = load_template_weights(dir.path());
        assert!(weights.get("fast").is_none(), "below MIN_SAMPLE_SIZE should be omitted");

        record_template_outcome(dir.path(), "fast", false).unwrap();
        let weights = load_template_weights(dir.path());
        let w = weights.get("fast").unwrap();
        assert_eq!(w.sample_size, 3);
        assert!((w.success_rate - (2.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn quality_memory_averages_scores_and_sums_recent_critical_findings() {
        let dir = tempdir().unwrap();
        let clean: Vec<ReviewFinding> = vec![];
        let dirty = vec![ReviewFinding::new(FindingSeverity::Error, "src/lib.rs", "bug")];
        record_quality_score(dir.path(), 1, "standard", &clean, 2).unwrap();
        record_quality_score(dir.path(), 2, "standard", &dirty, 1).unwrap();

        let mem = load_quality_memory(dir.path()).unwrap();
        assert_eq!(mem.recent_critical_findings, 1);
        assert!((mem.avg_score - 90.0).abs() < 1e-9);
    }

    #[test]
    fn rolling_window_truncates_to_cap() {
        let dir = tempdir().unwrap();
        for i in 0..(ROLLING_WINDOW + 10) {
            record_pipeline_duration(
                dir.path(),
                PipelineDuration { template: "fast".into(), issue_id: i as i64, duration_secs: 10, succeeded: true },
            )
            .unwrap();
        }
        let records = read_jsonl::<PipelineDuration>(&pipeline_durations_file(dir.path()));
        assert_eq!(records.len(), ROLLING_WINDOW);
    }

    #[test]
    fn recommended_iterations_rounds_up_average() {
        let dir = tempdir().unwrap();
        for used in [2, 3, 4] {
            record_iterations_used(dir.path(), "standard", Stage::Build, used).unwrap();
        }
        assert_eq!(recommended_iterations(dir.path(), "standard", Stage::Build), Some(3));
    }

    #[test]
    fn load_template_context_combines_quality_and_weights() {
        let dir = tempdir().unwrap();
        for _ in 0..3 {
            record_template_outcome(dir.path(), "hotfix", true).unwrap();
        }
        record_quality_score(dir.path(), 1, "hotfix", &[], 1).unwrap();
        let ctx = load_template_context(dir.path());
        assert!(ctx.learned_weights.contains_key("hotfix"));
        assert!(ctx.quality_memory.is_some());
    }

    #[test]
    fn adaptive_ci_wait_falls_back_to_default_with_no_history() {
        let dir = tempdir().unwrap();
        assert_eq!(adaptive_ci_wait_secs(dir.path()), CI_WAIT_DEFAULT_SECS);
    }

    #[test]
    fn adaptive_ci_wait_scales_p90_and_clamps_to_floor() {
        let dir = tempdir().unwrap();
        for secs in [30, 40, 50] {
            record_ci_check_duration(dir.path(), secs).unwrap();
        }
        assert_eq!(adaptive_ci_wait_secs(dir.path()), CI_WAIT_FLOOR_SECS);
    }

    #[test]
    fn adaptive_ci_wait_clamps_to_ceiling() {
        let dir = tempdir().unwrap();
        for _ in 0..5 {
            record_ci_check_duration(dir.path(), 3600).unwrap();
        }
        assert_eq!(adaptive_ci_wait_secs(dir.path()), CI_WAIT_CEILING_SECS);
    }
}

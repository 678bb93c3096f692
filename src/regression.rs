//! Per-repo regression baselines: rolling last-10 tables for coverage,
//! perf, and bundle size (spec.md §3 "Learning tables" / §4.3 "perf
//! regression vs rolling mean ± kσ, bundle size vs rolling mean").
//!
//! Each repo gets its own directory under
//! [`crate::config::Config::baselines_dir`], keyed by a hash of its
//! canonical path so two worktrees of the same repo share one baseline
//! history (spec.md §6 file layout: `baselines/<repo-hash>/...`). Tables
//! are advisory like every other learning table in [`crate::learning`]:
//! a missing or empty baseline means "no regression detected", never a
//! hard failure.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

const ROLLING_WINDOW: usize = 10;

/// The three rolling tables the compound-quality stage checks a build
/// against (spec.md §4.3's "multi-dimensional checks").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    Coverage,
    Perf,
    Bundle,
}

impl Metric {
    fn file_stem(self) -> &'static str {
        match self {
            Metric::Coverage => "coverage-baseline",
            Metric::Perf => "perf-history",
            Metric::Bundle => "bundle-history",
        }
    }
}

/// First 16 hex characters of a sha256 of the canonicalized repo path,
/// stable across runs against the same worktree.
pub fn repo_hash(repo_path: &Path) -> String {
    let canonical = repo_path
        .canonicalize()
        .unwrap_or_else(|_| repo_path.to_path_buf());
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string_lossy().as_bytes());
    let digest = hasher.finalize();
    hex_prefix(&digest, 16)
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect::<String>()[..len].to_string()
}

fn repo_dir(baselines_dir: &Path, repo_path: &Path) -> PathBuf {
    baselines_dir.join(repo_hash(repo_path))
}

fn metric_file(baselines_dir: &Path, repo_path: &Path, metric: Metric) -> PathBuf {
    repo_dir(baselines_dir, repo_path).join(format!("{}.jsonl", metric.file_stem()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    pub value: f64,
    pub ts_epoch: i64,
}

fn append_jsonl(path: &Path, record: &Sample) -> std::io::Result<()> {
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

fn read_jsonl(path: &Path) -> Vec<Sample> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect()
}

fn truncate(path: &Path, n: usize) -> std::io::Result<()> {
    let mut records = read_jsonl(path);
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

/// Record a new sample against a repo's rolling baseline, keeping only the
/// last [`ROLLING_WINDOW`] (spec.md §3: "bounded rolling last-10 metrics").
pub fn record(
    baselines_dir: &Path,
    repo_path: &Path,
    metric: Metric,
    value: f64,
    ts_epoch: i64,
) -> std::io::Result<()> {
    let path = metric_file(baselines_dir, repo_path, metric);
    append_jsonl(&path, &Sample { value, ts_epoch })?;
    truncate(&path, ROLLING_WINDOW)
}

/// Mean and population standard deviation of the current rolling window,
/// or `None` with fewer than two samples (not enough history to judge a
/// trend from, matching every other learning table's "advisory, not
/// authoritative" rule).
pub fn baseline_stats(baselines_dir: &Path, repo_path: &Path, metric: Metric) -> Option<(f64, f64)> {
    let samples = read_jsonl(&metric_file(baselines_dir, repo_path, metric));
    if samples.len() < 2 {
        return None;
    }
    let n = samples.len() as f64;
    let mean = samples.iter().map(|s| s.value).sum::<f64>() / n;
    let variance = samples.iter().map(|s| (s.value - mean).powi(2)).sum::<f64>() / n;
    Some((mean, variance.sqrt()))
}

/// Verdict of a [`check`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegressionVerdict {
    /// No baseline yet, or the value is within `k` standard deviations of
    /// the rolling mean.
    Ok,
    /// The value regressed beyond `k` standard deviations from the mean,
    /// in the direction `higher_is_worse` names as bad.
    Regressed,
}

/// Check `value` against the rolling baseline for `metric`, flagging a
/// regression when it is more than `k` standard deviations worse than the
/// mean. `higher_is_worse` is `true` for perf/bundle-size (bigger is bad)
/// and `false` for coverage (smaller is bad).
pub fn check(
    baselines_dir: &Path,
    repo_path: &Path,
    metric: Metric,
    value: f64,
    k: f64,
    higher_is_worse: bool,
) -> RegressionVerdict {
    let Some((mean, stddev)) = baseline_stats(baselines_dir, repo_path, metric) else {
        return RegressionVerdict::Ok;
    };
    let threshold = if higher_is_worse {
        mean + k * stddev
    } else {
        mean - k * stddev
    };
    let regressed = if higher_is_worse {
        value > threshold
    } else {
        value < threshold
    };
    if regressed {
        RegressionVerdict::Regressed
    } else {
        RegressionVerdict::Ok
    }
}

/// Full rolling history for a metric, oldest first — used by the `regression
/// history` CLI command.
pub fn history(baselines_dir: &Path, repo_path: &Path, metric: Metric) -> Vec<Sample> {
    read_jsonl(&metric_file(baselines_dir, repo_path, metric))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn repo_hash_is_stable_and_16_chars() {
        let dir = tempdir().unwrap();
        let a = repo_hash(dir.path());
        let b = repo_hash(dir.path());
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn missing_baseline_is_advisory_ok() {
        let baselines = tempdir().unwrap();
        let repo = tempdir().unwrap();
        assert!(baseline_stats(baselines.path(), repo.path(), Metric::Perf).is_none());
        assert_eq!(
            check(baselines.path(), repo.path(), Metric::Perf, 999.0, 2.0, true),
            RegressionVerdict::Ok
        );
    }

    #[test]
    fn perf_regression_flags_high_outlier() {
        let baselines = tempdir().unwrap();
        let repo = tempdir().unwrap();
        for (i, v) in [100.0, 102.0, 98.0, 101.0, 99.0].into_iter().enumerate() {
            record(baselines.path(), repo.path(), Metric::Perf, v, i as i64).unwrap();
        }
        let verdict = check(baselines.path(), repo.path(), Metric::Perf, 500.0, 2.0, true);
        assert_eq!(verdict, RegressionVerdict::Regressed);
        let verdict = check(baselines.path(), repo.path(), Metric::Perf, 101.5, 2.0, true);
        assert_eq!(verdict, RegressionVerdict::Ok);
    }

    #[test]
    fn coverage_regression_flags_low_outlier() {
        let baselines = tempdir().unwrap();
        let repo = tempdir().unwrap();
        for (i, v) in [80.0, 82.0, 81.0, 79.0, 80.0].into_iter().enumerate() {
            record(baselines.path(), repo.path(), Metric::Coverage, v, i as i64).unwrap();
        }
        let verdict = check(baselines.path(), repo.path(), Metric::Coverage, 10.0, 2.0, false);
        assert_eq!(verdict, RegressionVerdict::Regressed);
    }

    #[test]
    fn rolling_window_caps_at_ten() {
        let baselines = tempdir().unwrap();
        let repo = tempdir().unwrap();
        for i in 0..25 {
            record(baselines.path(), repo.path(), Metric::Bundle, i as f64, i).unwrap();
        }
        assert_eq!(history(baselines.path(), repo.path(), Metric::Bundle).len(), ROLLING_WINDOW);
    }
}

//! The compound-quality gate: turns a batch of review findings into a score,
//! decides whether that score clears a (per-template) floor, and tracks
//! convergence across compound-quality cycles so the pipeline runner knows
//! when to keep iterating, backtrack, or give up.

use crate::review::findings::{FindingSeverity, ReviewFinding};
use serde::{Deserialize, Serialize};

/// Point deduction per finding severity.
fn deduction(severity: FindingSeverity) -> i32 {
    match severity {
        FindingSeverity::Error => 20,
        FindingSeverity::Warning => 10,
        FindingSeverity::Info | FindingSeverity::Note => 2,
    }
}

/// Compute the compound-quality score: 100 minus deductions for every
/// finding, clamped to `[0, 100]`. The score itself is unbounded below the
/// gate threshold — a run with 20 criticals must score lower than one with
/// 3, or the learning tables lose the signal. The hard floor of 40 applies
/// to the *threshold* a template is allowed to configure ([`template_floor`]),
/// not to the score.
pub fn quality_score(findings: &[ReviewFinding]) -> u8 {
    let total_deduction: i32 = findings.iter().map(|f| deduction(f.severity())).sum();
    (100 - total_deduction).clamp(0, 100) as u8
}

/// Clamp a template's configured gate threshold to the hard floor of 40, so
/// no template can be configured to auto-pass a run riddled with findings.
pub fn template_floor(configured: u8) -> u8 {
    configured.max(40)
}

/// Whether a score clears the gate. `floor` is usually 40 but templates may
/// raise it (e.g. `enterprise`); it is always clamped to the hard floor.
pub fn passes_floor(score: u8, floor: u8) -> bool {
    score >= template_floor(floor)
}

/// One compound-quality cycle's tally, used to detect convergence across
/// consecutive cycles.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CycleTally {
    pub cycle: u32,
    pub issue_count: usize,
    pub score: u8,
}

/// Convergence signal derived from a short history of cycle tallies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Convergence {
    /// Issue count is dropping at a healthy rate; keep going as planned.
    Improving,
    /// Issue count hasn't moved since the last cycle; further cycles are
    /// unlikely to help without a design change.
    Plateaued,
    /// Issue count dropped sharply; the remaining budget can be trimmed.
    Accelerating,
    /// Issue count went *up* since the last cycle; something regressed.
    Regressing,
}

/// Compare the two most recent cycles and classify convergence. Returns
/// `Improving` when there is not yet enough history (fewer than 2 cycles)
/// to judge a trend.
pub fn detect_convergence(history: &[CycleTally]) -> Convergence {
    if history.len() < 2 {
        return Convergence::Improving;
    }
    let prev = history[history.len() - 2];
    let cur = history[history.len() - 1];
    if cur.issue_count > prev.issue_count {
        Convergence::Regressing
    } else if cur.issue_count == prev.issue_count {
        Convergence::Plateaued
    } else if prev.issue_count > 0 && (prev.issue_count - cur.issue_count) * 2 >= prev.issue_count
    {
        Convergence::Accelerating
    } else {
        Convergence::Improving
    }
}

/// Compute the adaptive cycle limit for a compound-quality run (spec.md
/// §4.3): start from (i) the learned recommendation for this context when
/// one exists, else the template's base budget; apply (ii) convergence
/// acceleration — extend by one cycle when the issue count just dropped
/// sharply, there's clearly room for a cheap finish; apply (iii) divergence
/// damping — trim a cycle when the issue count just went up, more cycles
/// are not obviously helping; apply (iv) the budget gate — an exhausted
/// cost budget forces the limit to zero outright, overriding everything
/// else; and finally clamp to (v) the hard ceiling of `2 * base` so a job
/// that never converges still terminates.
pub fn pipeline_adaptive_cycles(
    base: u32,
    convergence: Convergence,
    cur_issues: usize,
    prev_issues: usize,
    learned_recommendation: Option<u32>,
    budget_exhausted: bool,
) -> u32 {
    if budget_exhausted {
        return 0;
    }
    let cap = base.saturating_mul(2);
    let starting = learned_recommendation.map(|r| r.min(cap)).unwrap_or(base).max(1);
    let adjusted = match convergence {
        // (ii) rapid drop in issue count -> a cycle of slack is likely unneeded.
        Convergence::Accelerating => starting.saturating_add(1),
        // (iii) issue count rose -> damp back, extra cycles aren't converging.
        Convergence::Regressing if cur_issues > prev_issues => starting.saturating_sub(1).max(1),
        Convergence::Regressing | Convergence::Improving | Convergence::Plateaued => starting,
    };
    adjusted.min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::findings::ReviewFinding;

    fn finding(sev: FindingSeverity) -> ReviewFinding {
        ReviewFinding::new(sev, "src/lib.rs", "issue")
    }

    #[test]
    fn quality_score_deducts_by_severity() {
        let findings = vec![
            finding(FindingSeverity::Error),
            finding(FindingSeverity::Warning),
            finding(FindingSeverity::Info),
        ];
        assert_eq!(quality_score(&findings), 100 - 20 - 10 - 2);
    }

    #[test]
    fn quality_score_clamps_to_zero_not_forty() {
        let findings: Vec<_> = (0..10).map(|_| finding(FindingSeverity::Error)).collect();
        assert_eq!(quality_score(&findings), 0);
    }

    #[test]
    fn template_floor_refuses_to_go_below_forty() {
        assert_eq!(template_floor(10), 40);
        assert_eq!(template_floor(70), 70);
    }

    #[test]
    fn quality_score_clean_run_is_100() {
        assert_eq!(quality_score(&[]), 100);
    }

    #[test]
    fn passes_floor_checks_threshold() {
        assert!(passes_floor(40, 40));
        assert!(!passes_floor(39, 40));
    }

    #[test]
    fn convergence_detects_plateau() {
        let history = vec![
            CycleTally { cycle: 1, issue_count: 5, score: 80 },
            CycleTally { cycle: 2, issue_count: 5, score: 80 },
        ];
        assert_eq!(detect_convergence(&history), Convergence::Plateaued);
    }

    #[test]
    fn convergence_detects_regression() {
        let history = vec![
            CycleTally { cycle: 1, issue_count: 3, score: 85 },
            CycleTally { cycle: 2, issue_count: 5, score: 70 },
        ];
        assert_eq!(detect_convergence(&history), Convergence::Regressing);
    }

    #[test]
    fn convergence_detects_acceleration() {
        let history = vec![
            CycleTally { cycle: 1, issue_count: 10, score: 60 },
            CycleTally { cycle: 2, issue_count: 2, score: 95 },
        ];
        assert_eq!(detect_convergence(&history), Convergence::Accelerating);
    }

    #[test]
    fn adaptive_cycles_leaves_plateau_unchanged() {
        // Plateau itself stops the compound-quality loop (see
        // `pipeline::compound_quality::run`); the pure function just
        // shouldn't move the limit on its own.
        let cycles = pipeline_adaptive_cycles(3, Convergence::Plateaued, 4, 4, None, false);
        assert_eq!(cycles, 3);
    }

    #[test]
    fn adaptive_cycles_extends_on_rapid_drop() {
        let cycles = pipeline_adaptive_cycles(3, Convergence::Accelerating, 1, 10, None, false);
        assert_eq!(cycles, 4);
    }

    #[test]
    fn adaptive_cycles_shrinks_on_increase() {
        let cycles = pipeline_adaptive_cycles(4, Convergence::Regressing, 9, 3, None, false);
        assert_eq!(cycles, 3);
    }

    #[test]
    fn adaptive_cycles_never_exceeds_double_base() {
        let cycles = pipeline_adaptive_cycles(4, Convergence::Accelerating, 1, 10, Some(8), false);
        assert!(cycles <= 8);
    }

    #[test]
    fn adaptive_cycles_prefers_learned_recommendation() {
        let cycles = pipeline_adaptive_cycles(3, Convergence::Improving, 4, 4, Some(5), false);
        assert_eq!(cycles, 5);
    }

    #[test]
    fn adaptive_cycles_is_zero_when_budget_exhausted() {
        let cycles = pipeline_adaptive_cycles(3, Convergence::Accelerating, 4, 4, Some(5), true);
        assert_eq!(cycles, 0);
    }
}

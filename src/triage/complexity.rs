//! Complexity estimation: an integer 1..10 derived from body length and
//! referenced file count.
//!
//! `ComplexityClassifier` is the seam for a future learned or history-aware
//! estimator; the literal heuristic below is the default and only
//! implementation today, per the decision recorded in DESIGN.md.

use shipwright_common::Issue;

/// A pluggable complexity estimator. The literal heuristic is the only
/// implementor today; a future LLM- or history-informed classifier can
/// slot in here without touching call sites.
pub trait ComplexityClassifier {
    fn classify(&self, issue: &Issue) -> u8;
}

pub struct LiteralHeuristic;

impl ComplexityClassifier for LiteralHeuristic {
    fn classify(&self, issue: &Issue) -> u8 {
        estimate(issue)
    }
}

/// Body length in characters, in bands, each contributing to the final
/// 1..10 complexity score alongside the referenced-file count.
fn body_band(len: usize) -> u8 {
    match len {
        0..=200 => 1,
        201..=500 => 2,
        501..=1000 => 4,
        1001..=2000 => 6,
        2001..=4000 => 8,
        _ => 10,
    }
}

fn file_band(refs: usize) -> u8 {
    match refs {
        0 => 0,
        1..=2 => 1,
        3..=5 => 3,
        6..=10 => 5,
        _ => 7,
    }
}

/// Combine body-length and referenced-file-count bands into a 1..10 score.
pub fn estimate(issue: &Issue) -> u8 {
    let raw = body_band(issue.body.len()) + file_band(issue.referenced_file_count());
    raw.clamp(1, 10)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_issue_with_no_refs_is_minimally_complex() {
        let issue = Issue::new(1, "t", "fix typo");
        assert_eq!(estimate(&issue), 1);
    }

    #[test]
    fn long_issue_with_many_refs_saturates_at_ten() {
        let body = format!(
            "{} touches src/a.rs src/b.rs src/c.rs src/d.rs src/e.rs src/f.rs src/g.rs",
            "x".repeat(5000)
        );
        let issue = Issue::new(1, "t", body);
        assert_eq!(estimate(&issue), 10);
    }

    #[test]
    fn estimate_is_always_in_bounds() {
        for len in [0, 50, 300, 900, 1500, 3000, 10000] {
            let issue = Issue::new(1, "t", "x".repeat(len));
            let c = estimate(&issue);
            assert!((1..=10).contains(&c));
        }
    }

    #[test]
    fn classifier_trait_delegates_to_estimate() {
        let issue = Issue::new(1, "t", "see src/main.rs");
        assert_eq!(LiteralHeuristic.classify(&issue), estimate(&issue));
    }
}

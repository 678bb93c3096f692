//! The Triage Engine (C2): given an `Issue`, returns `{score, template,
//! complexity}`.

pub mod complexity;
pub mod scoring;
pub mod templates;

use crate::errors::TriageError;
use crate::state::DaemonState;
use shipwright_common::Issue;

/// The full triage result for one issue.
#[derive(Debug, Clone)]
pub struct Triage {
    pub score: u8,
    pub template: String,
    pub complexity: u8,
}

/// Score, select a template, and estimate complexity for `issue`.
///
/// Returns `TriageError::NoTemplateMatch` only in the degenerate case where
/// every cascade step is configured off and no fallback fires — in
/// practice step 7 (fallback by score) always fires, so this is reserved
/// for future configuration that disables it outright.
pub fn triage(
    issue: &Issue,
    state: &DaemonState,
    ctx: &templates::TemplateContext,
    classifier: &dyn complexity::ComplexityClassifier,
) -> Result<Triage, TriageError> {
    let now = chrono::Utc::now();
    let breakdown = scoring::score(issue, state, now);
    let score = breakdown.total();
    let template = templates::select(issue, score, state, ctx);
    let complexity = classifier.classify(issue);

    Ok(Triage {
        score,
        template,
        complexity,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ConfigSnapshot;
    use crate::triage::complexity::LiteralHeuristic;

    #[test]
    fn triage_produces_bounded_score_and_complexity() {
        let state = DaemonState::new(
            4,
            1,
            3,
            ConfigSnapshot {
                poll_interval_secs: 30,
                max_parallel: 4,
                watch_label: "ready".into(),
                watch_mode: "label".into(),
            },
        );
        let issue = Issue::new(1, "t", "b").with_labels(["urgent"]);
        let result = triage(&issue, &state, &templates::TemplateContext::default(), &LiteralHeuristic).unwrap();
        assert!(result.score <= 100);
        assert!((1..=10).contains(&result.complexity));
        assert!(!result.template.is_empty());
    }
}

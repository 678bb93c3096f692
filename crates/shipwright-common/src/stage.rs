use serde::{Deserialize, Serialize};

/// The fixed, ordered stage set every pipeline template drives a job
/// through. `TestFirst` is optional and may be absent from a template's
/// active stage list; the rest are always present (though may be
/// individually skipped at runtime — see `shipwright::pipeline::skip`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Intake,
    Plan,
    Design,
    TestFirst,
    Build,
    Test,
    Review,
    CompoundQuality,
    Pr,
    Merge,
    Deploy,
    Validate,
    Monitor,
}

impl Stage {
    /// The full ordered sequence, in pipeline order.
    pub const ORDER: [Stage; 13] = [
        Stage::Intake,
        Stage::Plan,
        Stage::Design,
        Stage::TestFirst,
        Stage::Build,
        Stage::Test,
        Stage::Review,
        Stage::CompoundQuality,
        Stage::Pr,
        Stage::Merge,
        Stage::Deploy,
        Stage::Validate,
        Stage::Monitor,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Intake => "intake",
            Stage::Plan => "plan",
            Stage::Design => "design",
            Stage::TestFirst => "test_first",
            Stage::Build => "build",
            Stage::Test => "test",
            Stage::Review => "review",
            Stage::CompoundQuality => "compound_quality",
            Stage::Pr => "pr",
            Stage::Merge => "merge",
            Stage::Deploy => "deploy",
            Stage::Validate => "validate",
            Stage::Monitor => "monitor",
        }
    }

    /// Stages that intelligent skipping may never bypass (spec.md §4.3).
    pub fn never_skippable(&self) -> bool {
        matches!(
            self,
            Stage::Intake | Stage::Build | Stage::Test | Stage::Pr | Stage::Merge
        )
    }

    pub fn index(&self) -> usize {
        Stage::ORDER.iter().position(|s| s == self).unwrap()
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How idempotent a stage's execution is with respect to prior artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyClass {
    /// Re-running produces the same output given the same inputs; safe to
    /// retry freely.
    Pure,
    /// Mutates external state (branches, comments, PRs); retries must be
    /// guarded (dedup, checks for existing artifacts).
    SideEffecting,
}

/// Recovery strategy declared up front for a stage, per spec.md §4.3/§4.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    Retry,
    SelfHeal,
    Backtrack,
    FailFast,
    Skip,
}

/// A stage's input/output contract, idempotency class, and failure policy.
/// One `StageContract` per entry in `Stage::ORDER`; templates may override
/// budgets/thresholds but not this shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageContract {
    pub stage: Stage,
    pub reads: Vec<&'static str>,
    pub writes: Vec<&'static str>,
    pub idempotency: IdempotencyClass,
    pub failure_policy: FailurePolicy,
}

impl StageContract {
    pub fn default_for(stage: Stage) -> Self {
        use FailurePolicy::*;
        use IdempotencyClass::*;
        match stage {
            Stage::Intake => Self {
                stage,
                reads: vec!["issue_snapshot"],
                writes: vec!["intake.json", "branch", "status_comment"],
                idempotency: SideEffecting,
                failure_policy: FailFast,
            },
            Stage::Plan => Self {
                stage,
                reads: vec!["issue_snapshot", "memory", "architecture_context"],
                writes: vec!["plan.md"],
                idempotency: Pure,
                failure_policy: Retry,
            },
            Stage::Design => Self {
                stage,
                reads: vec!["plan.md", "architecture_model"],
                writes: vec!["design.md"],
                idempotency: Pure,
                failure_policy: Backtrack,
            },
            Stage::TestFirst => Self {
                stage,
                reads: vec!["plan.md", "design.md"],
                writes: vec!["tests/*"],
                idempotency: SideEffecting,
                failure_policy: SelfHeal,
            },
            Stage::Build => Self {
                stage,
                reads: vec!["plan.md", "design.md", "dod.md"],
                writes: vec!["commits", "cost_metrics.json"],
                idempotency: SideEffecting,
                failure_policy: SelfHeal,
            },
            Stage::Test => Self {
                stage,
                reads: vec!["commits"],
                writes: vec!["test_report.json", "coverage.json"],
                idempotency: SideEffecting,
                failure_policy: SelfHeal,
            },
            Stage::Review => Self {
                stage,
                reads: vec!["diff"],
                writes: vec!["review.json"],
                idempotency: Pure,
                failure_policy: FailFast,
            },
            Stage::CompoundQuality => Self {
                stage,
                reads: vec!["diff", "review.json", "test_report.json"],
                writes: vec!["quality_report.json"],
                idempotency: SideEffecting,
                failure_policy: Backtrack,
            },
            Stage::Pr => Self {
                stage,
                reads: vec!["commits", "quality_report.json"],
                writes: vec!["pr_url"],
                idempotency: SideEffecting,
                failure_policy: FailFast,
            },
            Stage::Merge => Self {
                stage,
                reads: vec!["pr_url"],
                writes: vec!["merge_commit"],
                idempotency: SideEffecting,
                failure_policy: Retry,
            },
            Stage::Deploy => Self {
                stage,
                reads: vec!["merge_commit"],
                writes: vec!["deploy_id"],
                idempotency: SideEffecting,
                failure_policy: Retry,
            },
            Stage::Validate => Self {
                stage,
                reads: vec!["deploy_id"],
                writes: vec!["validation_report.json"],
                idempotency: Pure,
                failure_policy: FailFast,
            },
            Stage::Monitor => Self {
                stage,
                reads: vec!["deploy_id", "validation_report.json"],
                writes: vec!["monitor_baseline.json"],
                idempotency: Pure,
                failure_policy: Skip,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_has_all_thirteen_stages() {
        assert_eq!(Stage::ORDER.len(), 13);
    }

    #[test]
    fn never_skippable_set_matches_spec() {
        for s in Stage::ORDER {
            let expected = matches!(
                s,
                Stage::Intake | Stage::Build | Stage::Test | Stage::Pr | Stage::Merge
            );
            assert_eq!(s.never_skippable(), expected, "{s}");
        }
    }

    #[test]
    fn index_is_consistent_with_order() {
        for (i, s) in Stage::ORDER.iter().enumerate() {
            assert_eq!(s.index(), i);
        }
    }

    #[test]
    fn default_contract_round_trips_through_json() {
        for s in Stage::ORDER {
            let c = StageContract::default_for(s);
            let json = serde_json::to_string(&c).unwrap();
            let back: StageContract = serde_json::from_str(&json).unwrap();
            assert_eq!(back.stage, s);
        }
    }
}

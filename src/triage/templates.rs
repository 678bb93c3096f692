//! Template selection: a seven-step cascade, first rule to fire wins.

use crate::state::DaemonState;
use shipwright_common::Issue;
use std::collections::HashMap;

pub const TEMPLATE_FAST: &str = "fast";
pub const TEMPLATE_STANDARD: &str = "standard";
pub const TEMPLATE_FULL: &str = "full";
pub const TEMPLATE_HOTFIX: &str = "hotfix";
pub const TEMPLATE_ENTERPRISE: &str = "enterprise";

/// Branch protection rules relevant to template escalation (subset of the
/// tracker interface's `branch_protection` response).
#[derive(Debug, Clone, Copy, Default)]
pub struct BranchProtection {
    pub required_reviews: u32,
    pub strict_reviews: bool,
}

/// Rolling per-template learned success rate, read from
/// `optimization/template-weights.jsonl`.
#[derive(Debug, Clone, Copy)]
pub struct TemplateWeight {
    pub sample_size: u32,
    pub success_rate: f64,
}

/// Aggregated quality memory for the repo, read from
/// `optimization/quality-scores.jsonl`.
#[derive(Debug, Clone, Copy, Default)]
pub struct QualityMemory {
    pub recent_critical_findings: u32,
    pub avg_score: f64,
}

#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    pub branch_protection: BranchProtection,
    pub label_overrides: HashMap<String, String>,
    pub quality_memory: Option<QualityMemory>,
    pub learned_weights: HashMap<String, TemplateWeight>,
    pub dora_window: usize,
    pub cost_budget_exhausted: bool,
}

/// DORA-style change-failure-rate computed over the last `window` completed
/// runs, used by step 1 of template selection.
fn change_failure_rate(state: &DaemonState, window: usize) -> Option<f64> {
    let recent = state.recent_completions(window);
    if recent.is_empty() {
        return None;
    }
    let failures = recent.iter().filter(|o| !o.succeeded).count();
    Some(failures as f64 / recent.len() as f64)
}

/// Select a template for `issue` with the given triage `score`, consulting
/// rules in order until one fires.
pub fn select(issue: &Issue, score: u8, state: &DaemonState, ctx: &TemplateContext) -> String {
    // 1. DORA override.
    if let Some(cfr) = change_failure_rate(state, ctx.dora_window) {
        if cfr > 0.40 {
            return TEMPLATE_ENTERPRISE.to_string();
        }
        if cfr < 0.10 && score >= 60 {
            return TEMPLATE_FAST.to_string();
        }
    }

    // 2. Branch-protection escalation.
    if ctx.branch_protection.strict_reviews || ctx.branch_protection.required_reviews > 1 {
        return TEMPLATE_ENTERPRISE.to_string();
    }

    // 3. Built-in label overrides.
    if issue.has_any_label(&["hotfix", "incident"]) {
        return TEMPLATE_HOTFIX.to_string();
    }
    if issue.has_label("security") {
        return TEMPLATE_ENTERPRISE.to_string();
    }

    // 4. Configured label-map (user-supplied regex -> template).
    for (pattern, template) in &ctx.label_overrides {
        if let Ok(re) = regex::Regex::new(pattern) {
            if issue.labels.iter().any(|l| re.is_match(l)) {
                return template.clone();
            }
        }
    }

    // 5. Quality memory.
    if let Some(mem) = ctx.quality_memory {
        if mem.recent_critical_findings > 0 {
            return TEMPLATE_ENTERPRISE.to_string();
        }
        if mem.avg_score < 60.0 {
            return TEMPLATE_FULL.to_string();
        }
        if mem.avg_score > 80.0 && score >= 60 {
            return TEMPLATE_FAST.to_string();
        }
    }

    // 6. Learned template weights: highest success_rate among templates
    // with enough samples to trust.
    if let Some((best, _)) = ctx
        .learned_weights
        .iter()
        .filter(|(_, w)| w.sample_size >= 3)
        .max_by(|(_, a), (_, b)| a.success_rate.partial_cmp(&b.success_rate).unwrap())
    {
        return best.clone();
    }

    // 7. Fallback by score.
    if score >= 70 {
        TEMPLATE_FAST.to_string()
    } else if score >= 40 {
        TEMPLATE_STANDARD.to_string()
    } else {
        TEMPLATE_FULL.to_string()
    }
}

//! Structured extraction from executor output that the pipeline runner
//! needs beyond the completion tag: plan validation, test coverage
//! percentages across common toolchains, and nothing else — auth/rate-limit
//! marker detection lives in [`crate::executor`] since it gates the
//! executor boundary itself, not stage-specific parsing.

use regex::Regex;
use std::sync::OnceLock;

/// Parses a `VALID: true` / `VALID: false` line the plan stage's executor
/// prompt asks for, so the runner can decide whether `plan.md` needs another
/// iteration before design can start.
pub fn parse_plan_validation(text: &str) -> Option<bool> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"(?i)VALID:\s*(true|false)").unwrap());
    re.captures(text)
        .map(|c| c[1].eq_ignore_ascii_case("true"))
}

/// Why a plan failed validation, parsed from the `MODE: …` line the
/// plan-validation prompt asks the executor to emit alongside `VALID:
/// false`. Drives which regeneration guidance the plan stage feeds back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanRegenMode {
    RequirementsUnclear,
    InsufficientDetail,
    ScopeTooLarge,
}

impl PlanRegenMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanRegenMode::RequirementsUnclear => "requirements_unclear",
            PlanRegenMode::InsufficientDetail => "insufficient_detail",
            PlanRegenMode::ScopeTooLarge => "scope_too_large",
        }
    }
}

pub fn parse_plan_regen_mode(text: &str) -> Option<PlanRegenMode> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(?i)MODE:\s*(requirements_unclear|insufficient_detail|scope_too_large)").unwrap()
    });
    re.captures(text).map(|c| match c[1].to_ascii_lowercase().as_str() {
        "requirements_unclear" => PlanRegenMode::RequirementsUnclear,
        "insufficient_detail" => PlanRegenMode::InsufficientDetail,
        _ => PlanRegenMode::ScopeTooLarge,
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoverageReport {
    pub percent: f64,
}

/// Extract a coverage percentage from a test runner's summary output.
/// Tries, in order, the formats used by jest/vitest, pytest-cov, `go test
/// -cover`, and `cargo llvm-cov`/`cargo tarpaulin`.
pub fn parse_coverage(text: &str) -> Option<CoverageReport> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        vec![
            // jest/vitest: "All files      |   87.23 |"
            Regex::new(r"(?m)^All files\s*\|\s*([\d.]+)").unwrap(),
            // pytest-cov: "TOTAL    120   15   87%"
            Regex::new(r"(?m)^TOTAL\s+\d+\s+\d+\s+(\d+(?:\.\d+)?)%").unwrap(),
            // go test -cover: "coverage: 87.2% of statements"
            Regex::new(r"coverage:\s*([\d.]+)%\s*of statements").unwrap(),
            // cargo llvm-cov / tarpaulin: "87.23% coverage" or "Coverage Results: 87.23%"
            Regex::new(r"(?i)coverage[a-z ]*:?\s*([\d.]+)%").unwrap(),
        ]
    });

    for re in patterns {
        if let Some(caps) = re.captures(text) {
            if let Ok(percent) = caps[1].parse::<f64>() {
                return Some(CoverageReport { percent });
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_true() {
        assert_eq!(parse_plan_validation("VALID: true"), Some(true));
        assert_eq!(parse_plan_validation("notes\nvalid: FALSE\n"), Some(false));
    }

    #[test]
    fn parses_no_validation_line() {
        assert_eq!(parse_plan_validation("nothing here"), None);
    }

    #[test]
    fn parses_jest_coverage() {
        let out = "All files      |   87.23 |   80.00 |   90.00 |   87.23 |";
        assert_eq!(parse_coverage(out).unwrap().percent, 87.23);
    }

    #[test]
    fn parses_pytest_coverage() {
        let out = "Name      Stmts   Miss  Cover\n----------------------------\nTOTAL       120     15    88%";
        assert_eq!(parse_coverage(out).unwrap().percent, 88.0);
    }

    #[test]
    fn parses_go_coverage() {
        let out = "ok  	example.com/pkg	0.015s	coverage: 92.1% of statements";
        assert_eq!(parse_coverage(out).unwrap().percent, 92.1);
    }

    #[test]
    fn parses_cargo_llvm_cov_coverage() {
        let out = "TOTAL coverage: 73.4%";
        assert_eq!(parse_coverage(out).unwrap().percent, 73.4);
    }

    #[test]
    fn returns_none_when_no_coverage_present() {
        assert!(parse_coverage("no coverage data here").is_none());
    }
}

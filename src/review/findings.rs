//! Review findings types for quality gate outputs.
//!
//! This module defines the types for representing review specialist outputs,
//! including individual findings, complete review reports, and aggregated
//! results from multiple specialists.
//!
//! ## Types
//!
//! - [`FindingSeverity`]: Severity classification for individual findings
//! - [`ReviewVerdict`]: Overall verdict for a review (pass/warn/fail)
//! - [`ReviewFinding`]: A single identified issue with location and suggestion
//! - [`ReviewReport`]: Complete output from one review specialist
//! - [`ReviewAggregation`]: Combined results from multiple specialists
//!
//! ## Example
//!
//! ```
//! use shipwright::review::findings::{ReviewFinding, ReviewReport, ReviewVerdict, FindingSeverity};
//!
//! // Create a finding
//! let finding = ReviewFinding::new(
//!     FindingSeverity::Warning,
//!     "src/auth.rs",
//!     "SQL injection risk in query construction"
//! )
//! .with_line(42)
//! .with_suggestion("Use parameterized queries");
//!
//! // Create a report with the finding
//! let report = ReviewReport::new("05", "security-sentinel", ReviewVerdict::Warn)
//!     .with_summary("One medium-severity finding related to SQL queries")
//!     .add_finding(finding);
//!
//! assert_eq!(report.findings.len(), 1);
//! assert_eq!(report.verdict, ReviewVerdict::Warn);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity level for individual review findings.
///
/// Severities are ordered from most to least critical.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord,
)]
#[serde(rename_all = "lowercase")]
pub enum FindingSeverity {
    /// Critical issue requiring immediate attention.
    /// These typically indicate security vulnerabilities or correctness bugs.
    Error,
    /// Medium-severity issue that should be addressed.
    /// May indicate potential problems or violations of best practices.
    #[default]
    Warning,
    /// Informational observation.
    /// Style suggestions or minor improvements.
    Info,
    /// Additional context or note.
    /// Not necessarily an issue, but worth mentioning.
    Note,
}

impl FindingSeverity {
    /// Check if this severity is considered critical (error).
    ///
    /// # Examples
    ///
    /// ```
    /// use shipwright::review::findings::FindingSeverity;
    ///
    /// assert!(FindingSeverity::Error.is_critical());
    /// assert!(!FindingSeverity::Warning.is_critical());
    /// ```
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::Error)
    }

    /// Check if this severity is actionable (error or warning).
    ///
    /// # Examples
    ///
    /// ```
    /// use shipwright::review::findings::FindingSeverity;
    ///
    /// assert!(FindingSeverity::Error.is_actionable());
    /// assert!(FindingSeverity::Warning.is_actionable());
    /// assert!(!FindingSeverity::Info.is_actionable());
    /// ```
    pub fn is_actionable(&self) -> bool {
        matches!(self, Self::Error | Self::Warning)
    }

    /// Get the emoji indicator for this severity.
    pub fn emoji(&self) -> &'static str {
        match self {
            Self::Error => "🔴",
            Self::Warning => "🟡",
            Self::Info => "🔵",
            Self::Note => "⚪",
        }
    }
}

impl fmt::Display for FindingSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
            Self::Note => "note",
        };
        write!(f, "{}", s)
    }
}

/// Overall verdict for a review.
///
/// The verdict determines whether a phase can proceed (for gating reviews).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewVerdict {
    /// All checks passed with no significant issues.
    #[default]
    Pass,
    /// Issues found but not blocking (advisory findings).
    Warn,
    /// Critical issues found that block progression (for gating reviews).
    Fail,
}

impl ReviewVerdict {
    /// Check if this verdict allows phase progression.
    ///
    /// For gating reviews, only `Pass` and `Warn` allow progression.
    ///
    /// # Examples
    ///
    /// ```
    /// use shipwright::review::findings::ReviewVerdict;
    ///
    /// assert!(ReviewVerdict::Pass.allows_progression());
    /// assert!(ReviewVerdict::Warn.allows_progression());
    /// assert!(!ReviewVerdict::Fail.allows_progression());
    /// ```
    pub fn allows_progression(&self) -> bool {
        !matches!(self, Self::Fail)
    }

    /// Check if this is a passing verdict.
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }

    /// Check if this is a failing verdict.
    pub fn is_fail(&self) -> bool {
        matches!(self, Self::Fail)
    }

    /// Get the emoji indicator for this verdict.
    pub fn emoji(&self) -> &'static str {
        match self {
            Self::Pass => "✓",
            Self::Warn => "⚠",
            Self::Fail => "✗",
        }
    }
}

impl fmt::Display for ReviewVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pass => "PASS",
            Self::Warn => "WARN",
            Self::Fail => "FAIL",
        };
        write!(f, "{}", s)
    }
}

/// A single finding from a review specialist.
///
/// Represents an identified issue, observation, or suggestion at a specific
/// location in the codebase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewFinding {
    /// Severity of this finding.
    severity: FindingSeverity,
    /// File path where the issue was found (relative to project root).
    file: String,
    /// Line number (1-based, optional for file-level findings).
    #[serde(skip_serializing_if = "Option::is_none")]
    line: Option<u32>,
    /// Column number (1-based, optional).
    #[serde(skip_serializing_if = "Option::is_none")]
    column: Option<u32>,
    /// Description of the issue or observation.
    issue: String,
    /// Suggested fix or improvement (optional).
    #[serde(skip_serializing_if = "Option::is_none")]
    suggestion: Option<String>,
    /// Category or rule ID that triggered this finding (optional).
    #[serde(skip_serializing_if = "Option::is_none")]
    category: Option<String>,
}

impl ReviewFinding {
    /// Create a new review finding.
    ///
    /// # Arguments
    ///
    /// * `severity` - The severity level of this finding
    /// * `file` - The file path where the issue was found
    /// * `issue` - Description of the issue
    ///
    /// # Examples
    ///
    /// ```
    /// use shipwright::review::findings::{ReviewFinding, FindingSeverity};
    ///
    /// let finding = ReviewFinding::new(
    ///     FindingSeverity::Warning,
    ///     "src/db.rs",
    ///     "Potential SQL injection"
    /// );
    /// assert_eq!(finding.file(), "src/db.rs");
    /// ```
    pub fn new(
        severity: FindingSeverity,
        file: impl Into<String>,
        issue: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            file: file.into(),
            line: None,
            column: None,
            issue: issue.into(),
            suggestion: None,
            category: None,
        }
    }

    /// Set the line number for this finding.
    ///
    /// # Examples
    ///
    /// ```
    /// use shipwright::review::findings::{ReviewFinding, FindingSeverity};
    ///
    /// let finding = ReviewFinding::new(FindingSeverity::Error, "src/main.rs", "Issue")
    ///     .with_line(42);
    /// assert_eq!(finding.line(), Some(42));
    /// ```
    pub fn with_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }

    /// Set the column number for this finding.
    pub fn with_column(mut self, column: u32) -> Self {
        self.column = Some(column);
        self
    }

    /// Set a suggestion for fixing this finding.
    ///
    /// # Examples
    ///
    /// ```
    /// use shipwright::review::findings::{ReviewFinding, FindingSeverity};
    ///
    /// let finding = ReviewFinding::new(FindingSeverity::Warning, "src/db.rs", "SQL injection risk")
    ///     .with_suggestion("Use parameterized queries");
    /// assert_eq!(finding.suggestion(), Some("Use parameterized queries"));
    /// ```
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Set a category or rule ID for this finding.
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Get a formatted location string.
    ///
    /// Returns `file:line:column` or `file:line` or just `file` depending on
    /// what information is available.
    ///
    /// # Examples
    ///
    /// ```
    /// use shipwright::review::findings::{ReviewFinding, FindingSeverity};
    ///
    /// let finding = ReviewFinding::new(FindingSeverity::Warning, "src/main.rs", "Issue")
    ///     .with_line(42)
    ///     .with_column(10);
    /// assert_eq!(finding.location(), "src/main.rs:42:10");
    /// ```
    pub fn location(&self) -> String {
        match (self.line, self.column) {
            (Some(line), Some(col)) => format!("{}:{}:{}", self.file, line, col),
            (Some(line), None) => format!("{}:{}", self.file, line),
            _ => self.file.clone(),
        }
    }

    /// Check if this finding is critical (error severity).
    pub fn is_critical(&self) -> bool {
        self.severity.is_critical()
    }

    /// Check if this finding is actionable (error or warning).
    pub fn is_actionable(&self) -> bool {
        self.severity.is_actionable()
    }

    /// Get the file path where this finding was identified.
    pub fn file(&self) -> &str {
        &self.file
    }

    /// Get the line number of this finding (1-based).
    pub fn line(&self) -> Option<u32> {
        self.line
    }

    /// Get the column number of this finding (1-based).
    pub fn column(&self) -> Option<u32> {
        self.column
    }

    /// Get the severity level of this finding.
    pub fn severity(&self) -> FindingSeverity {
        self.severity
    }

    /// Get the description of the issue.
    pub fn issue(&self) -> &str {
        &self.issue
    }

    /// Get the suggested fix or improvement.
    pub fn suggestion(&self) -> Option<&str> {
        self.suggestion.as_deref()
    }

    /// Get the category or rule ID.
    pub fn category(&self) -> Option<&str> {
        self.category.as_deref()
    }
}

impl fmt::Display for ReviewFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {}: {}",
            self.severity.emoji(),
            self.severity,
            self.location(),
            self.issue
        )?;
        if let Some(ref suggestion) = self.suggestion {
            write!(f, " (suggestion: {})", suggestion)?;
        }
        Ok(())
    }
}

/// Complete output from a single review specialist.
///
/// Contains all findings from one specialist examining a phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewReport {
    /// Phase number that was reviewed.
    pub phase: String,
    /// Name of the reviewer (specialist agent name).
    pub reviewer: String,
    /// Overall verdict for this review.
    pub verdict: ReviewVerdict,
    /// List of all findings from this review.
    #[serde(default)]
    pub findings: Vec<ReviewFinding>,
    /// High-level summary of the review.
    #[serde(default)]
    pub summary: String,
    /// Timestamp when the review was completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Duration of the review in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl ReviewReport {
    /// Create a new review report.
    ///
    /// # Arguments
    ///
    /// * `phase` - The phase number that was reviewed
    /// * `reviewer` - The specialist agent name
    /// * `verdict` - The overall verdict
    ///
    /// # Examples
    ///
    /// ```
    /// use shipwright::review::findings::{ReviewReport, ReviewVerdict};
    ///
    /// let report = ReviewReport::new("05", "security-sentinel", ReviewVerdict::Pass);
    /// assert_eq!(report.phase, "05");
    /// assert_eq!(report.verdict, ReviewVerdict::Pass);
    /// ```
    pub fn new(
        phase: impl Into<String>,
        reviewer: impl Into<String>,
        verdict: ReviewVerdict,
    ) -> Self {
        Self {
            phase: phase.into(),
            reviewer: reviewer.into(),
            verdict,
            findings: Vec::new(),
            summary: String::new(),
            timestamp: None,
            duration_ms: None,
        }
    }

    /// Add a finding to this report.
    ///
    /// # Examples
    ///
    /// ```
    /// use shipwright::review::findings::{ReviewReport, ReviewVerdict, ReviewFinding, FindingSeverity};
    ///
    /// let finding = ReviewFinding::new(FindingSeverity::Warning, "src/main.rs", "Issue");
    /// let report = ReviewReport::new("05", "security-sentinel", ReviewVerdict::Warn)
    ///     .add_finding(finding);
    /// assert_eq!(report.findings.len(), 1);
    /// ```
    pub fn add_finding(mut self, finding: ReviewFinding) -> Self {
        self.findings.push(finding);
        self
    }

    /// Add multiple findings to this report.
    pub fn add_findings(mut self, findings: impl IntoIterator<Item = ReviewFinding>) -> Self {
        self.findings.extend(findings);
        self
    }

    /// Set the summary for this report.
    ///
    /// # Examples
    ///
    /// ```
    /// use shipwright::review::findings::{ReviewReport, ReviewVerdict};
    ///
    /// let report = ReviewReport::new("05", "security-sentinel", ReviewVerdict::Pass)
    ///     .with_summary("No issues found");
    /// assert_eq!(report.summary, "No issues found");
    /// ```
    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    /// Set the timestamp for this report.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Set the duration for this report.
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Check if this report indicates a gating failure.
    ///
    /// Returns true if the verdict is `Fail`.
    pub fn is_gating_failure(&self) -> bool {
        self.verdict.is_fail()
    }

    /// Get the count of findings by severity.
    pub fn count_by_severity(&self, severity: FindingSeverity) -> usize {
        self.findings
            .iter()
            .filter(|f| f.severity == severity)
            .count()
    }

    /// Get all critical (error) findings.
    pub fn critical_findings(&self) -> Vec<&ReviewFinding> {
        self.findings.iter().filter(|f| f.is_critical()).collect()
    }

    /// Get all actionable (error + warning) findings.
    pub fn actionable_findings(&self) -> Vec<&ReviewFinding> {
        self.findings.iter().filter(|f| f.is_actionable()).collect()
    }

    /// Check if this report has any findings.
    pub fn has_findings(&self) -> bool {
        !self.findings.is_empty()
    }

    /// Get the total number of findings.
    pub fn findings_count(&self) -> usize {
        self.findings.len()
    }
}

impl fmt::Display for ReviewReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} {} [Phase {}]: {}",
            self.verdict.emoji(),
            self.reviewer,
            self.phase,
            self.verdict
        )?;

        if !self.summary.is_empty() {
            writeln!(f, "  Summary: {}", self.summary)?;
        }

        if !self.findings.is_empty() {
            writeln!(f, "  Findings ({}):", self.findings.len())?;
            for finding in &self.findings {
                writeln!(f, "    {}", finding)?;
            }
        }

        Ok(())
    }
}

/// Aggregated results from multiple review specialists.
///
/// Combines reports from all specialists that reviewed a phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewAggregation {
    /// Phase number that was reviewed.
    pub phase: String,
    /// Reports from all specialists.
    #[serde(default)]
    pub reports: Vec<ReviewReport>,
    /// Whether reviews were run in parallel.
    #[serde(default)]
    pub parallel_execution: bool,
    /// Total wall-clock time for all reviews in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_duration_ms: Option<u64>,
}

impl ReviewAggregation {
    /// Create a new aggregation for a phase.
    ///
    /// # Examples
    ///
    /// ```
    /// use shipwright::review::findings::ReviewAggregation;
    ///
    /// let aggregation = ReviewAggregation::new("05");
    /// assert_eq!(aggregation.phase, "05");
    /// assert!(aggregation.reports.is_empty());
    /// ```
    pub fn new(phase: impl Into<String>) -> Self {
        Self {
            phase: phase.into(),
            reports: Vec::new(),
            parallel_execution: false,
            total_duration_ms: None,
        }
    }

    /// Add a report to this aggregation.
    ///
    /// # Examples
    ///
    /// ```
    /// use shipwright::review::findings::{ReviewAggregation, ReviewReport, ReviewVerdict};
    ///
    /// let report = ReviewReport::new("05", "security-sentinel", ReviewVerdict::Pass);
    /// let aggregation = ReviewAggregation::new("05").add_report(report);
    /// assert_eq!(aggregation.reports.len(), 1);
    /// ```
    pub fn add_report(mut self, report: ReviewReport) -> Self {
        self.reports.push(report);
        self
    }

    /// Add multiple reports to this aggregation.
    pub fn add_reports(mut self, reports: impl IntoIterator<Item = ReviewReport>) -> Self {
        self.reports.extend(reports);
        self
    }

    /// Set whether reviews were run in parallel.
    pub fn with_parallel_execution(mut self, parallel: bool) -> Self {
        self.parallel_execution = parallel;
        self
    }

    /// Set the total duration.
    pub fn with_total_duration_ms(mut self, duration_ms: u64) -> Self {
        self.total_duration_ms = Some(duration_ms);
        self
    }

    /// Check if any gating review failed.
    ///
    /// # Examples
    ///
    /// ```
    /// use shipwright::review::findings::{ReviewAggregation, ReviewReport, ReviewVerdict};
    ///
    /// let pass_report = ReviewReport::new("05", "security-sentinel", ReviewVerdict::Pass);
    /// let fail_report = ReviewReport::new("05", "performance-oracle", ReviewVerdict::Fail);
    ///
    /// let passing = ReviewAggregation::new("05").add_report(pass_report.clone());
    /// assert!(!passing.has_gating_failures());
    ///
    /// let failing = ReviewAggregation::new("05")
    ///     .add_report(pass_report)
    ///     .add_report(fail_report);
    /// assert!(failing.has_gating_failures());
    /// ```
    pub fn has_gating_failures(&self) -> bool {
        self.reports.iter().any(|r| r.is_gating_failure())
    }

    /// Get all reports that indicate gating failures.
    pub fn gating_failures(&self) -> Vec<&ReviewReport> {
        self.reports
            .iter()
            .filter(|r| r.is_gating_failure())
            .collect()
    }

    /// Get the names of specialists that reported failures.
    pub fn failed_specialists(&self) -> Vec<&str> {
        self.gating_failures()
            .iter()
            .map(|r| r.reviewer.as_str())
            .collect()
    }

    /// Get the total count of all findings across all reports.
    pub fn all_findings_count(&self) -> usize {
        self.reports.iter().map(|r| r.findings_count()).sum()
    }

    /// Get all findings across all reports.
    pub fn all_findings(&self) -> Vec<&ReviewFinding> {
        self.reports.iter().flat_map(|r| &r.findings).collect()
    }

    /// Get all critical findings across all reports.
    pub fn all_critical_findings(&self) -> Vec<&ReviewFinding> {
        self.reports
            .iter()
            .flat_map(|r| r.critical_findings())
            .collect()
    }

    /// Get the overall verdict based on all reports.
    ///
    /// Returns `Fail` if any report failed, `Warn` if any warned but none failed,
    /// otherwise `Pass`.
    pub fn overall_verdict(&self) -> ReviewVerdict {
        if self.reports.iter().any(|r| r.verdict.is_fail()) {
            ReviewVerdict::Fail
        } else if self
            .reports
            .iter()
            .any(|r| r.verdict == ReviewVerdict::Warn)
        {
            ReviewVerdict::Warn
        } else {
            ReviewVerdict::Pass
        }
    }

    /// Check if this aggregation has any reports.
    pub fn has_reports(&self) -> bool {
        !self.reports.is_empty()
    }

    /// Get the number of reports.
    pub fn reports_count(&self) -> usize {
        self.reports.len()
    }
}

impl fmt::Display for ReviewAggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let overall = self.overall_verdict();
        writeln!(
            f,
            "Review Aggregation [Phase {}]: {} {}",
            self.phase,
            overall.emoji(),
            overall
        )?;
        writeln!(
            f,
            "  {} reports, {} total findings",
            self.reports_count(),
            self.all_findings_count()
        )?;

        for report in &self.reports {
            writeln!(f)?;
            write!(f, "{}", report)?;
        }

        Ok(())
    }
}

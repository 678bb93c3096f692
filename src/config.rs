//! Layered configuration for the Shipwright daemon.
//!
//! Settings are resolved file → environment → CLI, in that order of
//! increasing precedence.
//! The file lives at `<home>/shipwright.toml` where `<home>` is the
//! per-user Shipwright home directory (`~/.shipwright` by default,
//! overridable with `SHIPWRIGHT_HOME` for tests and multi-tenant hosts).
//!
//! ```toml
//! [daemon]
//! watch_label = "shipwright-ready"
//! max_parallel = 4
//! poll_interval_secs = 30
//! priority_lane_cap = 1
//! priority_lane_labels = ["p0", "incident"]
//! adaptive_thresholds_enabled = true
//!
//! [pipeline]
//! default_template = "standard"
//! auto_template = true
//! max_retries = 3
//!
//! [templates.hotfix]
//! max_cycles = 2
//! quality_threshold = 60
//!
//! [labels.overrides]
//! "security.*" = "enterprise"
//! "hotfix|incident" = "hotfix"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Daemon-wide settings: what to watch, how much to admit, how fast to poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSection {
    #[serde(default = "default_watch_label")]
    pub watch_label: String,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_priority_lane_cap")]
    pub priority_lane_cap: usize,
    #[serde(default)]
    pub priority_lane_labels: Vec<String>,
    #[serde(default = "default_adaptive_thresholds_enabled")]
    pub adaptive_thresholds_enabled: bool,
    #[serde(default = "default_dora_window")]
    pub dora_window: usize,
}

fn default_watch_label() -> String {
    "shipwright-ready".to_string()
}
fn default_max_parallel() -> usize {
    4
}
fn default_poll_interval_secs() -> u64 {
    30
}
fn default_priority_lane_cap() -> usize {
    1
}
fn default_adaptive_thresholds_enabled() -> bool {
    true
}
/// Open Question #1 in spec.md §9: the DORA change-failure-rate window was
/// hard-coded at 5 recent completions. We keep 5 as the default but make it
/// configurable, per the resolution recorded in DESIGN.md.
fn default_dora_window() -> usize {
    5
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            watch_label: default_watch_label(),
            max_parallel: default_max_parallel(),
            poll_interval_secs: default_poll_interval_secs(),
            priority_lane_cap: default_priority_lane_cap(),
            priority_lane_labels: Vec::new(),
            adaptive_thresholds_enabled: default_adaptive_thresholds_enabled(),
            dora_window: default_dora_window(),
        }
    }
}

/// Pipeline-wide defaults; individual templates override via `[templates.*]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    #[serde(default = "default_template_name")]
    pub default_template: String,
    #[serde(default = "default_auto_template")]
    pub auto_template: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_backtracks")]
    pub max_backtracks: u32,
}

fn default_template_name() -> String {
    "standard".to_string()
}
fn default_auto_template() -> bool {
    true
}
fn default_max_retries() -> u32 {
    3
}
fn default_max_backtracks() -> u32 {
    2
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            default_template: default_template_name(),
            auto_template: default_auto_template(),
            max_retries: default_max_retries(),
            max_backtracks: default_max_backtracks(),
        }
    }
}

/// Per-template overrides: cycle budget and the quality gate threshold.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateOverride {
    pub max_cycles: Option<u32>,
    pub quality_threshold: Option<u8>,
}

/// User-supplied regex-keyed label→template overrides, consulted as triage
/// step 4 (after the built-in hotfix/security label rules).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LabelsSection {
    #[serde(default)]
    pub overrides: HashMap<String, String>,
}

/// The complete `shipwright.toml` shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShipwrightToml {
    #[serde(default)]
    pub daemon: DaemonSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub templates: HashMap<String, TemplateOverride>,
    #[serde(default)]
    pub labels: LabelsSection,
}

impl ShipwrightToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("failed to parse shipwright.toml")
    }

    pub fn load_or_default(home: &Path) -> Result<Self> {
        let path = home.join("shipwright.toml");
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("failed to serialize shipwright.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.daemon.max_parallel == 0 {
            warnings.push("daemon.max_parallel is 0; the daemon will never admit work".into());
        }
        if self.daemon.priority_lane_cap > self.daemon.max_parallel {
            warnings.push("daemon.priority_lane_cap exceeds daemon.max_parallel".into());
        }
        for (pattern, _) in &self.labels.overrides {
            if regex::Regex::new(pattern).is_err() {
                warnings.push(format!("invalid label override pattern {pattern:?}"));
            }
        }
        warnings
    }

    /// Effective settings for a template, merging `[templates.<name>]` over
    /// hard-coded template bases (see `crate::triage::templates`).
    pub fn template_override(&self, template: &str) -> TemplateOverride {
        self.templates.get(template).cloned().unwrap_or_default()
    }
}

/// The opaque executor subprocess: a named binary plus the flags used to
/// invoke it non-interactively (spec.md §6 "Executor interface").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSection {
    #[serde(default = "default_executor_cmd")]
    pub cmd: String,
    #[serde(default)]
    pub extra_flags: Vec<String>,
    #[serde(default = "default_executor_auth_probe_secs")]
    pub auth_probe_timeout_secs: u64,
}

fn default_executor_cmd() -> String {
    "claude".to_string()
}
fn default_executor_auth_probe_secs() -> u64 {
    15
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            cmd: default_executor_cmd(),
            extra_flags: Vec::new(),
            auth_probe_timeout_secs: default_executor_auth_probe_secs(),
        }
    }
}

/// Resolved runtime configuration: `ShipwrightToml` plus environment and CLI
/// overrides, plus the derived filesystem layout (spec.md §6).
#[derive(Debug, Clone)]
pub struct Config {
    pub home: PathBuf,
    pub toml: ShipwrightToml,
    pub executor: ExecutorSection,
    pub verbose: bool,
    pub no_github: bool,
    pub ci_mode: bool,
    pub dashboard_url: Option<String>,
}

impl Config {
    pub fn new(home: PathBuf, verbose: bool) -> Result<Self> {
        std::fs::create_dir_all(&home)
            .with_context(|| format!("failed to create shipwright home at {}", home.display()))?;
        let home = home
            .canonicalize()
            .context("failed to resolve shipwright home directory")?;
        let mut toml = ShipwrightToml::load_or_default(&home)?;
        apply_env_overrides(&mut toml);

        Ok(Self {
            home,
            toml,
            executor: ExecutorSection::default(),
            verbose,
            no_github: env_flag("NO_GITHUB"),
            ci_mode: env_flag("CI_MODE"),
            dashboard_url: std::env::var("DASHBOARD_URL").ok(),
        })
    }

    /// Resolve the Shipwright home directory: `SHIPWRIGHT_HOME` env var,
    /// else `~/.shipwright`.
    pub fn default_home() -> Result<PathBuf> {
        if let Ok(dir) = std::env::var("SHIPWRIGHT_HOME") {
            return Ok(PathBuf::from(dir));
        }
        dirs::home_dir()
            .map(|h| h.join(".shipwright"))
            .context("could not determine home directory; set SHIPWRIGHT_HOME")
    }

    pub fn state_file(&self) -> PathBuf {
        self.home.join("state.json")
    }
    pub fn events_file(&self) -> PathBuf {
        self.home.join("events.jsonl")
    }
    pub fn progress_dir(&self) -> PathBuf {
        self.home.join("progress")
    }
    pub fn baselines_dir(&self) -> PathBuf {
        self.home.join("baselines")
    }
    pub fn optimization_dir(&self) -> PathBuf {
        self.home.join("optimization")
    }
    pub fn pause_file(&self) -> PathBuf {
        self.home.join("pause.json")
    }
    /// Presence marker written by the external cost tracker (out of scope
    /// per spec.md §1) when a run's budget is exhausted. Spec.md §7.8: the
    /// adaptive cycle limit must return 0 while this holds.
    pub fn budget_exhausted_file(&self) -> PathBuf {
        self.home.join("budget-exhausted.json")
    }
    pub fn cost_budget_exhausted(&self) -> bool {
        self.budget_exhausted_file().exists()
    }
    pub fn worktrees_dir(&self) -> PathBuf {
        self.home.join("worktrees")
    }
    pub fn logs_dir(&self) -> PathBuf {
        self.home.join("logs")
    }
    pub fn learning_dir(&self) -> PathBuf {
        self.home.join("learning")
    }
    pub fn audit_dir(&self) -> PathBuf {
        self.home.join("audit")
    }

    /// The per-job worktree directory for an admitted issue.
    pub fn worktree_for(&self, issue_id: i64) -> PathBuf {
        self.worktrees_dir().join(format!("issue-{issue_id}"))
    }
    /// The executor's per-job log file.
    pub fn log_file_for(&self, issue_id: i64) -> PathBuf {
        self.logs_dir().join(format!("issue-{issue_id}.log"))
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(self.progress_dir())?;
        std::fs::create_dir_all(self.baselines_dir())?;
        std::fs::create_dir_all(self.optimization_dir())?;
        std::fs::create_dir_all(self.worktrees_dir())?;
        std::fs::create_dir_all(self.logs_dir())?;
        std::fs::create_dir_all(self.learning_dir())?;
        std::fs::create_dir_all(self.audit_dir())?;
        Ok(())
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Overlay the environment variables enumerated in spec.md §6 onto a parsed
/// `ShipwrightToml`. Environment wins over the file; CLI flags (applied by
/// callers afterward, e.g. in `cmd::daemon`) win over both.
fn apply_env_overrides(toml: &mut ShipwrightToml) {
    if let Ok(v) = std::env::var("WATCH_LABEL") {
        toml.daemon.watch_label = v;
    }
    if let Ok(v) = std::env::var("MAX_PARALLEL").ok().and_then(|s| s.parse().ok()) {
        toml.daemon.max_parallel = v;
    }
    if let Ok(v) = std::env::var("POLL_INTERVAL").ok().and_then(|s| s.parse().ok()) {
        toml.daemon.poll_interval_secs = v;
    }
    if let Ok(v) = std::env::var("PIPELINE_TEMPLATE") {
        toml.pipeline.default_template = v;
    }
    if let Ok(v) = std::env::var("AUTO_TEMPLATE") {
        toml.pipeline.auto_template = v != "false" && v != "0";
    }
    if let Ok(v) = std::env::var("ADAPTIVE_THRESHOLDS_ENABLED") {
        toml.daemon.adaptive_thresholds_enabled = v != "false" && v != "0";
    }
    if let Ok(v) = std::env::var("PRIORITY_LANE_LABELS") {
        toml.daemon.priority_lane_labels = v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
    }
}

/// Case-insensitive glob matching used for phase/label pattern overrides.
/// `*` matches any run of characters, `?` matches exactly one.
pub fn pattern_matches(pattern: &str, text: &str) -> bool {
    glob_match(&pattern.to_lowercase(), &text.to_lowercase())
}

fn glob_match(pattern: &str, text: &str) -> bool {
    let mut pattern_chars = pattern.chars().peekable();
    let mut text_chars = text.chars().peekable();

    while let Some(p) = pattern_chars.next() {
        match p {
            '*' => {
                while pattern_chars.peek() == Some(&'*') {
                    pattern_chars.next();
                }
                if pattern_chars.peek().is_none() {
                    return true;
                }
                let remaining_pattern: String = pattern_chars.collect();
                let remaining_text: String = text_chars.collect();
                return (0..=remaining_text.len())
                    .any(|i| glob_match(&remaining_pattern, &remaining_text[i..]));
            }
            '?' => {
                if text_chars.next().is_none() {
                    return false;
                }
            }
            c => {
                if text_chars.next() != Some(c) {
                    return false;
                }
            }
        }
    }
    text_chars.next().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_empty_as_defaults() {
        let toml = ShipwrightToml::parse("").unwrap();
        assert_eq!(toml.daemon.max_parallel, 4);
        assert_eq!(toml.daemon.dora_window, 5);
        assert!(toml.pipeline.auto_template);
    }

    #[test]
    fn parses_full_daemon_section() {
        let content = r#"
[daemon]
watch_label = "ready"
max_parallel = 8
poll_interval_secs = 15
priority_lane_cap = 2
priority_lane_labels = ["p0"]
adaptive_thresholds_enabled = false
dora_window = 10
"#;
        let toml = ShipwrightToml::parse(content).unwrap();
        assert_eq!(toml.daemon.watch_label, "ready");
        assert_eq!(toml.daemon.max_parallel, 8);
        assert_eq!(toml.daemon.dora_window, 10);
        assert!(!toml.daemon.adaptive_thresholds_enabled);
        assert_eq!(toml.daemon.priority_lane_labels, vec!["p0".to_string()]);
    }

    #[test]
    fn validate_flags_zero_parallelism_and_oversized_priority_lane() {
        let content = r#"
[daemon]
max_parallel = 0
priority_lane_cap = 3
"#;
        let toml = ShipwrightToml::parse(content).unwrap();
        let warnings = toml.validate();
        assert!(warnings.iter().any(|w| w.contains("max_parallel is 0")));
        assert!(warnings.iter().any(|w| w.contains("priority_lane_cap exceeds")));
    }

    #[test]
    fn validate_flags_bad_label_pattern() {
        let content = r#"
[labels.overrides]
"(unclosed" = "hotfix"
"#;
        let toml = ShipwrightToml::parse(content).unwrap();
        let warnings = toml.validate();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("invalid label override pattern"));
    }

    #[test]
    fn save_and_load_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shipwright.toml");
        let mut toml = ShipwrightToml::default();
        toml.daemon.max_parallel = 12;
        toml.save(&path).unwrap();
        let loaded = ShipwrightToml::load(&path).unwrap();
        assert_eq!(loaded.daemon.max_parallel, 12);
    }

    #[test]
    fn template_override_merges_per_template_table() {
        let content = r#"
[templates.hotfix]
max_cycles = 2
quality_threshold = 60
"#;
        let toml = ShipwrightToml::parse(content).unwrap();
        let over = toml.template_override("hotfix");
        assert_eq!(over.max_cycles, Some(2));
        assert_eq!(over.quality_threshold, Some(60));
        assert_eq!(toml.template_override("unknown").max_cycles, None);
    }

    #[test]
    fn pattern_matches_glob_star_and_case() {
        assert!(pattern_matches("security.*", "security.high"));
        assert!(pattern_matches("HOTFIX", "hotfix"));
        assert!(!pattern_matches("database-*", "database"));
    }

    #[test]
    fn config_home_has_expected_layout() {
        let dir = tempdir().unwrap();
        let home = dir.path().join("home");
        let config = Config::new(home, false).unwrap();
        config.ensure_directories().unwrap();
        assert!(config.state_file().ends_with("state.json"));
        assert!(config.events_file().ends_with("events.jsonl"));
        assert!(config.progress_dir().exists());
        assert!(config.baselines_dir().exists());
        assert!(config.optimization_dir().exists());
    }
}

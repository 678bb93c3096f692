use super::{AuditRun, RunConfig, StageAudit};
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub struct AuditLogger {
    audit_dir: PathBuf,
    current_run: Option<AuditRun>,
    current_run_file: PathBuf,
}

impl AuditLogger {
    pub fn new(audit_dir: &Path) -> Self {
        let current_run_file = audit_dir.join("current-run.json");
        Self {
            audit_dir: audit_dir.to_path_buf(),
            current_run: None,
            current_run_file,
        }
    }

    pub fn start_run(&mut self, issue_id: i64, config: RunConfig) -> Result<()> {
        let run = AuditRun::new(issue_id, config);
        self.current_run = Some(run);
        self.save_current()?;
        Ok(())
    }

    /// Add a stage audit record to the current run.
    ///
    /// Returns an error if no run is currently active (i.e., `start_run` was never called
    /// or `finish_run` has already been called). This prevents silent data loss when callers
    /// forget to start a run before logging stage data.
    pub fn add_stage(&mut self, stage: StageAudit) -> Result<()> {
        let run = self
            .current_run
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("add_stage called with no active run"))?;
        run.stages.push(stage);
        self.save_current()
    }

    /// Apply a mutation to the last stage in the current run.
    ///
    /// Returns an error if no run is currently active, or if the current run has no stages
    /// yet. Both conditions indicate a programming error — the caller must ensure a run and
    /// at least one stage exist before updating.
    pub fn update_last_stage<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut StageAudit),
    {
        let run = self
            .current_run
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("update_last_stage called with no active run"))?;
        let stage = run
            .stages
            .last_mut()
            .ok_or_else(|| anyhow::anyhow!("update_last_stage called with no stages in run"))?;
        f(stage);
        self.save_current()
    }

    pub fn finish_run(&mut self) -> Result<PathBuf> {
        let run = self
            .current_run
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("No current run to finish"))?;

        run.finish();

        let filename = format!(
            "{}_{}.json",
            run.started_at.format("%Y-%m-%dT%H-%M-%S"),
            &run.run_id.to_string()[..8]
        );
        let run_file = self.audit_dir.join("runs").join(&filename);

        let json = serde_json::to_string_pretty(&run).context("failed to serialize audit run")?;
        fs::write(&run_file, json).context("failed to write audit run file")?;

        if self.current_run_file.exists() {
            fs::remove_file(&self.current_run_file)
                .context("failed to remove current-run.json after finishing run")?;
        }

        self.current_run = None;
        Ok(run_file)
    }

    pub fn save_current(&self) -> Result<()> {
        if let Some(ref run) = self.current_run {
            let json =
                serde_json::to_string_pretty(&run).context("failed to serialize current run")?;
            fs::write(&self.current_run_file, json).context("failed to write current run file")?;
        }
        Ok(())
    }

    pub fn load_current(&mut self) -> Result<bool> {
        if self.current_run_file.exists() {
            let content = fs::read_to_string(&self.current_run_file)
                .context("failed to read current run file")?;
            let run: AuditRun =
                serde_json::from_str(&content).context("failed to parse current run file")?;
            self.current_run = Some(run);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn current_run(&self) -> Option<&AuditRun> {
        self.current_run.as_ref()
    }

    pub fn list_runs(&self) -> Result<Vec<PathBuf>> {
        let runs_dir = self.audit_dir.join("runs");
        if !runs_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs: Vec<PathBuf> = fs::read_dir(&runs_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
            .collect();

        runs.sort();
        runs.reverse();
        Ok(runs)
    }

    pub fn load_run(&self, path: &Path) -> Result<AuditRun> {
        let content = fs::read_to_string(path).context("failed to read audit run file")?;
        let run: AuditRun =
            serde_json::from_str(&content).context("failed to parse audit run file")?;
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::StageOutcome;
    use shipwright_common::Stage;
    use tempfile::TempDir;

    fn setup_logger() -> (AuditLogger, TempDir) {
        let dir = TempDir::new().expect("failed to create temp dir");
        let runs_dir = dir.path().join("runs");
        std::fs::create_dir_all(&runs_dir).expect("failed to create runs dir");
        let logger = AuditLogger::new(dir.path());
        (logger, dir)
    }

    fn make_run_config() -> RunConfig {
        RunConfig {
            template: "standard".into(),
            worktree: PathBuf::from("."),
            verbose: false,
        }
    }

    #[test]
    fn test_add_stage_without_active_run_returns_err() {
        let (mut logger, _dir) = setup_logger();
        let result = logger.add_stage(StageAudit::new(Stage::Intake));
        assert!(
            result.is_err(),
            "add_stage with no active run must return Err"
        );
    }

    #[test]
    fn test_update_last_stage_with_no_stages_returns_err() {
        let (mut logger, _dir) = setup_logger();
        logger.start_run(1, make_run_config()).unwrap();
        let result = logger.update_last_stage(|_| {});
        assert!(
            result.is_err(),
            "update_last_stage with empty stages must return Err"
        );
    }

    #[test]
    fn test_update_last_stage_without_active_run_returns_err() {
        let (mut logger, _dir) = setup_logger();
        let result = logger.update_last_stage(|_| {});
        assert!(
            result.is_err(),
            "update_last_stage with no active run must return Err"
        );
    }

    #[test]
    fn test_run_file_is_valid_json() {
        let (mut logger, _dir) = setup_logger();
        logger.start_run(7, make_run_config()).unwrap();
        logger.add_stage(StageAudit::new(Stage::Intake)).unwrap();
        let run_path = logger.finish_run().unwrap();

        let content = std::fs::read_to_string(&run_path).expect("run file must exist");
        let value: serde_json::Value =
            serde_json::from_str(&content).expect("run file must be valid JSON");

        let run_id = value
            .get("run_id")
            .expect("run_id field must be present")
            .as_str()
            .expect("run_id must be a string");
        assert_eq!(run_id.len(), 36);

        let stages = value
            .get("stages")
            .expect("stages field must be present")
            .as_array()
            .expect("stages must be a JSON array");
        assert!(!stages.is_empty());

        let ended_at = value
            .get("ended_at")
            .expect("ended_at field must be present");
        assert!(!ended_at.is_null());
    }

    #[test]
    fn test_multiple_stages_persisted() {
        let (mut logger, dir) = setup_logger();
        logger.start_run(1, make_run_config()).unwrap();
        logger.add_stage(StageAudit::new(Stage::Intake)).unwrap();
        logger.add_stage(StageAudit::new(Stage::Plan)).unwrap();
        logger.add_stage(StageAudit::new(Stage::Design)).unwrap();

        let in_memory_count = logger.current_run().expect("run must be active").stages.len();
        assert_eq!(in_memory_count, 3);

        let mut second_logger = AuditLogger::new(dir.path());
        let loaded = second_logger.load_current().expect("load_current must succeed");
        assert!(loaded);
        let disk_count = second_logger
            .current_run()
            .expect("loaded run must be present")
            .stages
            .len();
        assert_eq!(disk_count, 3);
    }

    #[test]
    fn test_update_last_stage_modifies_stage() {
        let (mut logger, dir) = setup_logger();
        logger.start_run(1, make_run_config()).unwrap();
        logger.add_stage(StageAudit::new(Stage::Build)).unwrap();

        logger
            .update_last_stage(|s| {
                s.outcome = StageOutcome::Completed { iteration: 2 };
            })
            .unwrap();

        let mut second_logger = AuditLogger::new(dir.path());
        second_logger.load_current().unwrap();
        let disk_stage = second_logger
            .current_run()
            .unwrap()
            .stages
            .last()
            .expect("loaded run must have stages");

        assert_eq!(disk_stage.outcome, StageOutcome::Completed { iteration: 2 });
    }

    #[test]
    fn test_start_run_creates_current_run_file() {
        let (mut logger, dir) = setup_logger();
        logger.start_run(1, make_run_config()).unwrap();
        assert!(dir.path().join("current-run.json").exists());
    }

    #[test]
    fn test_finish_run_removes_current_run_file() {
        let (mut logger, dir) = setup_logger();
        logger.start_run(1, make_run_config()).unwrap();
        logger.finish_run().unwrap();
        assert!(!dir.path().join("current-run.json").exists());
    }
}

//! Append-only JSONL event log with line-count rotation (spec.md §4.1, §6).
//!
//! Grounded on the teacher's `AuditLogger` current-run persistence pattern
//! (`audit/logger.rs`), generalized from one JSON-per-run to one
//! JSON-object-per-line, since the daemon emits many small structured
//! events rather than a handful of large run records.

use chrono::Utc;
use serde_json::{Map, Value};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Rotate once the log exceeds this many lines; the rotated file is kept
/// as `events.jsonl.1` (single previous generation, matching the `.bak`
/// single-backup convention used for `state.json`).
const DEFAULT_ROTATE_AT_LINES: usize = 50_000;

pub struct EventLog {
    path: PathBuf,
    rotate_at_lines: usize,
}

impl EventLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            rotate_at_lines: DEFAULT_ROTATE_AT_LINES,
        }
    }

    pub fn with_rotate_at(mut self, lines: usize) -> Self {
        self.rotate_at_lines = lines;
        self
    }

    /// Append one structured event. `type_name` is a dotted name like
    /// `daemon.triage` or `pipeline.quality_gate_failed`; `fields` are
    /// merged into the record alongside `ts`/`ts_epoch`/`type`.
    pub fn emit(&self, type_name: &str, fields: Vec<(&str, Value)>) -> std::io::Result<()> {
        let now = Utc::now();
        let mut record = Map::new();
        record.insert("ts".into(), Value::String(now.to_rfc3339()));
        record.insert("ts_epoch".into(), Value::from(now.timestamp()));
        record.insert("type".into(), Value::String(type_name.to_string()));
        for (k, v) in fields {
            record.insert(k.to_string(), v);
        }

        let mut line = serde_json::to_string(&Value::Object(record))?;
        line.push('\n');

        self.maybe_rotate()?;

        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?
            .write_all(line.as_bytes())
    }

    fn maybe_rotate(&self) -> std::io::Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let count = BufReader::new(fs::File::open(&self.path)?).lines().count();
        if count < self.rotate_at_lines {
            return Ok(());
        }
        let rotated = self.rotated_path();
        fs::rename(&self.path, rotated)?;
        Ok(())
    }

    fn rotated_path(&self) -> PathBuf {
        let mut rotated = self.path.clone();
        rotated.set_extension("jsonl.1");
        rotated
    }

    /// Read back all events whose `ts_epoch` is monotonically non-decreasing
    /// (P4). Used by tests and by `cmd::regression history`.
    pub fn read_all(path: &Path) -> std::io::Result<Vec<Value>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(path)?;
        Ok(content
            .lines()
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn emit_appends_one_line_per_event() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let log = EventLog::new(path.clone());
        log.emit("daemon.triage", vec![("issue_id", Value::from(1))]).unwrap();
        log.emit("daemon.triage", vec![("issue_id", Value::from(2))]).unwrap();

        let events = EventLog::read_all(&path).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["type"], "daemon.triage");
        assert_eq!(events[1]["issue_id"], 2);
    }

    #[test]
    fn ts_epoch_is_present_and_numeric() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let log = EventLog::new(path.clone());
        log.emit("pipeline.quality_gate_failed", vec![]).unwrap();
        let events = EventLog::read_all(&path).unwrap();
        assert!(events[0]["ts_epoch"].is_i64());
    }

    #[test]
    fn rotates_when_line_ceiling_exceeded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let log = EventLog::new(path.clone()).with_rotate_at(3);
        for i in 0..3 {
            log.emit("x", vec![("i", Value::from(i))]).unwrap();
        }
        // fourth emit should rotate the 3-line file away first
        log.emit("x", vec![("i", Value::from(3))]).unwrap();

        assert!(path.exists());
        let rotated = dir.path().join("events.jsonl.1");
        assert!(rotated.exists());
        let rotated_events = EventLog::read_all(&rotated).unwrap();
        assert_eq!(rotated_events.len(), 3);
        let current_events = EventLog::read_all(&path).unwrap();
        assert_eq!(current_events.len(), 1);
    }

    #[test]
    fn read_all_on_missing_file_returns_empty() {
        let dir = tempdir().unwrap();
        let events = EventLog::read_all(&dir.path().join("nope.jsonl")).unwrap();
        assert!(events.is_empty());
    }
}

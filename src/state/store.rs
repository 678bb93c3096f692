//! The locked read-modify-write state store (spec.md §4.1).
//!
//! Every mutation: acquire an exclusive lock on a sibling `.lock` file with
//! a bounded timeout, read the blob (falling back to `.bak` on corruption),
//! apply a pure transform, write to a temp file, rename atomically, then
//! write a fresh `.bak`. On lock timeout the caller must treat capacity as
//! already full — see `active_count_locked`.
//!
//! Grounded on the teacher's append-only `StateManager` (`orchestrator/state.rs`)
//! for the general shape of a small file-backed manager, generalized here to
//! whole-blob locked RMW since `DaemonState` (unlike the teacher's phase log)
//! is a single mutable structure rather than an append-only history.

use crate::errors::StateError;
use crate::state::event_log::EventLog;
use crate::state::model::DaemonState;
use fs2::FileExt;
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(20);

pub struct StateStore {
    path: PathBuf,
    lock_path: PathBuf,
    backup_path: PathBuf,
    events: EventLog,
}

impl StateStore {
    pub fn new(path: PathBuf, events_path: PathBuf) -> Self {
        let lock_path = Self::sibling(&path, "lock");
        let backup_path = Self::sibling(&path, "bak");
        Self {
            path,
            lock_path,
            backup_path,
            events: EventLog::new(events_path),
        }
    }

    fn sibling(path: &Path, ext: &str) -> PathBuf {
        let mut p = path.to_path_buf();
        p.set_extension(ext);
        p
    }

    /// Create the blob if it doesn't exist yet.
    pub fn init(&self, initial: DaemonState) -> Result<(), StateError> {
        if self.path.exists() {
            return Ok(());
        }
        self.write_atomic(&initial)?;
        self.emit("daemon.state_initialized", vec![]);
        Ok(())
    }

    /// Acquire the exclusive lock, load the current state (repairing from
    /// `.bak` if the primary is corrupt), apply `f`, and write the result
    /// back atomically. Returns `Err(StateError::LockTimeout)` if the lock
    /// isn't acquired within 5s — callers must treat this the same as "no
    /// capacity available" per spec.md's safe-full default, never as "state
    /// is empty".
    pub fn apply<F, T>(&self, f: F) -> Result<T, StateError>
    where
        F: FnOnce(&mut DaemonState) -> T,
    {
        let file = self.acquire_lock()?;
        let mut state = self.load()?;
        let result = f(&mut state);
        if let Err(e) = state.check_invariants() {
            return Err(StateError::InvariantViolated(e));
        }
        self.write_atomic(&state)?;
        FileExt::unlock(&file).ok();
        Ok(result)
    }

    /// Returns the active job count, or `max_parallel` (safe-full) if the
    /// lock can't be acquired in time — this is P9 in spec.md §8.
    pub fn active_count_locked(&self, max_parallel_fallback: usize) -> usize {
        match self.acquire_lock() {
            Ok(file) => {
                let count = self.load().map(|s| s.active_count()).unwrap_or(max_parallel_fallback);
                FileExt::unlock(&file).ok();
                count
            }
            Err(_) => max_parallel_fallback,
        }
    }

    fn acquire_lock(&self) -> Result<File, StateError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.lock_path)
            .map_err(|source| StateError::WriteFailed {
                path: self.lock_path.clone(),
                source,
            })?;

        let deadline = Instant::now() + LOCK_TIMEOUT;
        loop {
            if FileExt::try_lock_exclusive(&file).is_ok() {
                return Ok(file);
            }
            if Instant::now() >= deadline {
                return Err(StateError::LockTimeout {
                    path: self.path.clone(),
                    timeout_secs: LOCK_TIMEOUT.as_secs(),
                });
            }
            std::thread::sleep(LOCK_POLL_INTERVAL);
        }
    }

    fn load(&self) -> Result<DaemonState, StateError> {
        match self.read_from(&self.path) {
            Ok(state) => Ok(state),
            Err(primary_err) => match self.read_from(&self.backup_path) {
                Ok(state) => Ok(state),
                Err(_) => Err(StateError::Corrupt {
                    path: self.path.clone(),
                    detail: primary_err.to_string(),
                }),
            },
        }
    }

    fn read_from(&self, path: &Path) -> Result<DaemonState, StateError> {
        let content = fs::read_to_string(path).map_err(|source| StateError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(StateError::from)
    }

    fn write_atomic(&self, state: &DaemonState) -> Result<(), StateError> {
        let json = serde_json::to_string_pretty(state)?;

        if self.path.exists() {
            fs::copy(&self.path, &self.backup_path).map_err(|source| StateError::WriteFailed {
                path: self.backup_path.clone(),
                source,
            })?;
        }

        let tmp_path = Self::sibling(&self.path, "tmp");
        {
            let mut tmp = File::create(&tmp_path).map_err(|source| StateError::WriteFailed {
                path: tmp_path.clone(),
                source,
            })?;
            tmp.write_all(json.as_bytes())
                .map_err(|source| StateError::WriteFailed {
                    path: tmp_path.clone(),
                    source,
                })?;
        }
        fs::rename(&tmp_path, &self.path).map_err(|source| StateError::WriteFailed {
            path: self.path.clone(),
            source,
        })?;
        Ok(())
    }

    /// A point-in-time read of the current state, for callers that only
    /// need to inspect it (e.g. the daemon supervisor's candidate filtering)
    /// rather than mutate it through `apply`.
    pub fn read(&self) -> Result<DaemonState, StateError> {
        let file = self.acquire_lock()?;
        let state = self.load();
        FileExt::unlock(&file).ok();
        state
    }

    pub fn emit(&self, type_name: &str, fields: Vec<(&str, Value)>) {
        if let Err(e) = self.events.emit(type_name, fields) {
            tracing::warn!(error = %e, "failed to append event");
        }
    }

    #[cfg(test)]
    pub fn read_for_test(&self) -> Result<DaemonState, StateError> {
        self.load()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::model::ConfigSnapshot;
    use shipwright_common::Job;
    use std::path::PathBuf as PB;
    use tempfile::tempdir;

    fn cfg() -> ConfigSnapshot {
        ConfigSnapshot {
            poll_interval_secs: 30,
            max_parallel: 2,
            watch_label: "ready".into(),
            watch_mode: "label".into(),
        }
    }

    fn store(dir: &Path) -> StateStore {
        StateStore::new(dir.join("state.json"), dir.join("events.jsonl"))
    }

    #[test]
    fn init_creates_blob_once() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        s.init(DaemonState::new(2, 1, 3, cfg())).unwrap();
        assert!(dir.path().join("state.json").exists());
        s.init(DaemonState::new(99, 99, 99, cfg())).unwrap();
        let loaded = s.read_for_test().unwrap();
        assert_eq!(loaded.max_parallel, 2, "second init must be a no-op");
    }

    #[test]
    fn apply_round_trips_a_mutation() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        s.init(DaemonState::new(2, 1, 3, cfg())).unwrap();
        s.apply(|state| state.add_queued(42, false)).unwrap();
        let loaded = s.read_for_test().unwrap();
        assert_eq!(loaded.queued.front(), Some(&42));
    }

    #[test]
    fn write_atomic_produces_a_bak_sibling() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        s.init(DaemonState::new(2, 1, 3, cfg())).unwrap();
        s.apply(|state| state.add_queued(1, false)).unwrap();
        assert!(dir.path().join("state.bak").exists());
    }

    #[test]
    fn corrupt_primary_falls_back_to_backup() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        s.init(DaemonState::new(2, 1, 3, cfg())).unwrap();
        s.apply(|state| state.add_queued(7, false)).unwrap();
        fs::write(dir.path().join("state.json"), b"not json").unwrap();

        let loaded = s.load().unwrap();
        assert_eq!(loaded.queued.front(), Some(&7));
    }

    #[test]
    fn active_count_locked_returns_max_parallel_when_lock_held_elsewhere() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        s.init(DaemonState::new(3, 1, 3, cfg())).unwrap();

        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(dir.path().join("state.lock"))
            .unwrap();
        FileExt::lock_exclusive(&lock_file).unwrap();

        let count = s.active_count_locked(3);
        assert_eq!(count, 3, "must return the safe-full fallback, never 0");
        FileExt::unlock(&lock_file).ok();
    }

    #[test]
    fn apply_rejects_mutation_that_breaks_invariants() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        s.init(DaemonState::new(1, 1, 3, cfg())).unwrap();
        let result = s.apply(|state| {
            state
                .active_jobs
                .insert(1, Job::new(1, 1, PB::from("/tmp"), "fast", 50, 3));
            state
                .active_jobs
                .insert(2, Job::new(2, 1, PB::from("/tmp"), "fast", 50, 3));
        });
        assert!(result.is_err());
    }
}

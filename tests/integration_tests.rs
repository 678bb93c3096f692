//! Whole-CLI smoke tests for the `shipwright` binary.
//!
//! Grounded on the teacher's own `tests/integration_tests.rs` split: broad
//! CLI surface coverage here (`assert_cmd` driving the built binary end to
//! end, `NO_GITHUB=1` standing in for real tracker I/O), component-level
//! scenario tests colocated with the source under `#[cfg(test)]`.

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn shipwright() -> Command {
    cargo_bin_cmd!("shipwright")
}

fn shipwright_in(home: &TempDir) -> Command {
    let mut cmd = shipwright();
    cmd.env("SHIPWRIGHT_HOME", home.path())
        .env("NO_GITHUB", "1")
        .arg("--home")
        .arg(home.path());
    cmd
}

mod cli_basics {
    use super::*;

    #[test]
    fn help_succeeds() {
        shipwright().arg("--help").assert().success();
    }

    #[test]
    fn version_succeeds() {
        shipwright().arg("--version").assert().success();
    }

    #[test]
    fn no_subcommand_fails_with_usage() {
        shipwright().assert().failure();
    }

    #[test]
    fn unknown_subcommand_fails() {
        shipwright().arg("not-a-real-command").assert().failure();
    }

    #[test]
    fn daemon_help_lists_all_five_subcommands() {
        shipwright()
            .arg("daemon")
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("start"))
            .stdout(predicate::str::contains("stop"))
            .stdout(predicate::str::contains("status"))
            .stdout(predicate::str::contains("pause"))
            .stdout(predicate::str::contains("resume"));
    }

    #[test]
    fn pipeline_help_lists_start() {
        shipwright()
            .arg("pipeline")
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("start"));
    }

    #[test]
    fn regression_help_lists_all_four_subcommands() {
        shipwright()
            .arg("regression")
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("baseline"))
            .stdout(predicate::str::contains("check"))
            .stdout(predicate::str::contains("report"))
            .stdout(predicate::str::contains("history"));
    }

    #[test]
    fn hygiene_help_lists_platform_refactor() {
        shipwright()
            .arg("hygiene")
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("platform-refactor"));
    }
}

mod daemon_lifecycle {
    use super::*;

    #[test]
    fn status_on_fresh_home_reports_zero_active_jobs() {
        let home = TempDir::new().unwrap();
        // `daemon start --max-ticks 0` initializes the state blob without
        // running any ticks, so `status` has something to read.
        shipwright_in(&home)
            .arg("daemon")
            .arg("start")
            .arg("--max-ticks")
            .arg("0")
            .assert()
            .success();

        shipwright_in(&home)
            .arg("daemon")
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("active_jobs:  0"))
            .stdout(predicate::str::contains("queued:       0"));
    }

    #[test]
    fn pause_writes_marker_and_resume_removes_it() {
        let home = TempDir::new().unwrap();
        shipwright_in(&home)
            .arg("daemon")
            .arg("pause")
            .arg("--reason")
            .arg("testing")
            .assert()
            .success();
        assert!(home.path().join("pause.json").exists());

        shipwright_in(&home)
            .arg("daemon")
            .arg("resume")
            .assert()
            .success();
        assert!(!home.path().join("pause.json").exists());
    }

    #[test]
    fn status_reflects_pause_marker() {
        let home = TempDir::new().unwrap();
        shipwright_in(&home)
            .arg("daemon")
            .arg("start")
            .arg("--max-ticks")
            .arg("0")
            .assert()
            .success();
        shipwright_in(&home)
            .arg("daemon")
            .arg("pause")
            .arg("--reason")
            .arg("testing")
            .assert()
            .success();

        shipwright_in(&home)
            .arg("daemon")
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("paused:       true"));
    }

    #[test]
    fn resume_without_prior_pause_is_a_noop_success() {
        let home = TempDir::new().unwrap();
        shipwright_in(&home).arg("daemon").arg("resume").assert().success();
    }

    #[test]
    fn daemon_with_a_watch_label_and_no_issues_ticks_cleanly() {
        let home = TempDir::new().unwrap();
        // `--max-ticks 1` returns after the first tick, before the poll-interval
        // sleep, so this stays fast regardless of the configured poll interval.
        shipwright_in(&home)
            .arg("daemon")
            .arg("start")
            .arg("--max-ticks")
            .arg("1")
            .assert()
            .success();
    }
}

mod triage {
    use super::*;

    #[test]
    fn triage_show_on_unseeded_offline_tracker_fails_with_no_such_issue() {
        let home = TempDir::new().unwrap();
        // OfflineTracker is a fresh in-process map per invocation; a CLI
        // subprocess has no way to seed it, so looking up an issue it never
        // saw is a clean "no such issue" failure, not a crash.
        shipwright_in(&home)
            .arg("triage")
            .arg("show")
            .arg("--issue")
            .arg("101")
            .assert()
            .failure()
            .stderr(predicate::str::contains("no such issue 101"));
    }
}

mod regression {
    use super::*;

    #[test]
    fn report_on_fresh_repo_says_no_baseline() {
        let home = TempDir::new().unwrap();
        let repo = TempDir::new().unwrap();
        shipwright_in(&home)
            .arg("regression")
            .arg("report")
            .arg("--repo-path")
            .arg(repo.path())
            .assert()
            .success()
            .stdout(predicate::str::contains("no baseline yet"));
    }

    #[test]
    fn baseline_then_history_round_trips_recorded_samples() {
        let home = TempDir::new().unwrap();
        let repo = TempDir::new().unwrap();
        for value in ["100.0", "102.0", "98.0"] {
            shipwright_in(&home)
                .arg("regression")
                .arg("baseline")
                .arg("--repo-path")
                .arg(repo.path())
                .arg("--metric")
                .arg("perf")
                .arg("--value")
                .arg(value)
                .assert()
                .success();
        }

        shipwright_in(&home)
            .arg("regression")
            .arg("history")
            .arg("--repo-path")
            .arg(repo.path())
            .arg("--metric")
            .arg("perf")
            .assert()
            .success()
            .stdout(predicate::str::contains("100"))
            .stdout(predicate::str::contains("102"))
            .stdout(predicate::str::contains("98"));
    }

    #[test]
    fn check_within_baseline_succeeds() {
        let home = TempDir::new().unwrap();
        let repo = TempDir::new().unwrap();
        for value in ["100.0", "101.0", "99.0", "100.5", "99.5"] {
            shipwright_in(&home)
                .arg("regression")
                .arg("baseline")
                .arg("--repo-path")
                .arg(repo.path())
                .arg("--metric")
                .arg("perf")
                .arg("--value")
                .arg(value)
                .assert()
                .success();
        }

        shipwright_in(&home)
            .arg("regression")
            .arg("check")
            .arg("--repo-path")
            .arg(repo.path())
            .arg("--metric")
            .arg("perf")
            .arg("--value")
            .arg("100.2")
            .assert()
            .success();
    }

    #[test]
    fn check_beyond_k_sigma_exits_2() {
        let home = TempDir::new().unwrap();
        let repo = TempDir::new().unwrap();
        for value in ["100.0", "101.0", "99.0", "100.5", "99.5"] {
            shipwright_in(&home)
                .arg("regression")
                .arg("baseline")
                .arg("--repo-path")
                .arg(repo.path())
                .arg("--metric")
                .arg("perf")
                .arg("--value")
                .arg(value)
                .assert()
                .success();
        }

        shipwright_in(&home)
            .arg("regression")
            .arg("check")
            .arg("--repo-path")
            .arg(repo.path())
            .arg("--metric")
            .arg("perf")
            .arg("--value")
            .arg("5000.0")
            .assert()
            .code(2);
    }

    #[test]
    fn coverage_drop_is_a_regression_but_equal_perf_rise_is_not() {
        let home = TempDir::new().unwrap();
        let repo = TempDir::new().unwrap();
        for value in ["80.0", "81.0", "79.0", "80.5", "79.5"] {
            shipwright_in(&home)
                .arg("regression")
                .arg("baseline")
                .arg("--repo-path")
                .arg(repo.path())
                .arg("--metric")
                .arg("coverage")
                .arg("--value")
                .arg(value)
                .assert()
                .success();
        }

        shipwright_in(&home)
            .arg("regression")
            .arg("check")
            .arg("--repo-path")
            .arg(repo.path())
            .arg("--metric")
            .arg("coverage")
            .arg("--value")
            .arg("10.0")
            .assert()
            .code(2);
    }
}

mod hygiene {
    use super::*;

    #[test]
    fn platform_refactor_dry_run_on_empty_home_prunes_nothing() {
        let home = TempDir::new().unwrap();
        shipwright_in(&home)
            .arg("hygiene")
            .arg("platform-refactor")
            .arg("--dry-run")
            .assert()
            .success()
            .stdout(predicate::str::contains("would prune 0"));
    }

    #[test]
    fn platform_refactor_removes_orphaned_progress_file() {
        let home = TempDir::new().unwrap();
        shipwright_in(&home)
            .arg("daemon")
            .arg("start")
            .arg("--max-ticks")
            .arg("0")
            .assert()
            .success();

        let progress_dir = home.path().join("progress");
        std::fs::create_dir_all(&progress_dir).unwrap();
        let orphan = progress_dir.join("issue-999.json");
        std::fs::write(&orphan, "{}").unwrap();

        shipwright_in(&home)
            .arg("hygiene")
            .arg("platform-refactor")
            .assert()
            .success()
            .stdout(predicate::str::contains("pruned 1"));
        assert!(!orphan.exists());
    }
}

mod global_flags {
    use super::*;

    #[test]
    fn verbose_flag_is_accepted_before_and_after_subcommand() {
        let home = TempDir::new().unwrap();
        shipwright_in(&home)
            .arg("-v")
            .arg("daemon")
            .arg("status_would_fail_without_init")
            .assert()
            .failure();
    }

    #[test]
    fn home_override_is_respected_over_env_var() {
        let env_home = TempDir::new().unwrap();
        let flag_home = TempDir::new().unwrap();
        shipwright()
            .env("SHIPWRIGHT_HOME", env_home.path())
            .env("NO_GITHUB", "1")
            .arg("--home")
            .arg(flag_home.path())
            .arg("daemon")
            .arg("start")
            .arg("--max-ticks")
            .arg("0")
            .assert()
            .success();

        assert!(flag_home.path().join("state.json").exists());
        assert!(!env_home.path().join("state.json").exists());
    }
}

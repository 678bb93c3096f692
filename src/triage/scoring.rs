//! Issue scoring: weighted signals summed and clamped to 0..100.

use crate::state::DaemonState;
use shipwright_common::Issue;

/// One bounded contribution to an issue's score, kept separate so callers
/// (and tests) can see the breakdown rather than only the final sum.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreBreakdown {
    pub priority: i32,
    pub age: i32,
    pub complexity_inverted: i32,
    pub dependency: i32,
    pub issue_type: i32,
    pub memory: i32,
}

impl ScoreBreakdown {
    pub fn total(&self) -> u8 {
        let sum = self.priority
            + self.age
            + self.complexity_inverted
            + self.dependency
            + self.issue_type
            + self.memory;
        sum.clamp(0, 100) as u8
    }
}

fn priority_signal(issue: &Issue) -> i32 {
    if issue.has_any_label(&["urgent", "p0"]) {
        30
    } else if issue.has_any_label(&["high", "p1"]) {
        20
    } else if issue.has_any_label(&["normal", "p2"]) {
        10
    } else if issue.has_any_label(&["low", "p3"]) {
        5
    } else {
        0
    }
}

fn age_signal(issue: &Issue, now: chrono::DateTime<chrono::Utc>) -> i32 {
    match issue.age_days(now) {
        d if d > 7 => 15,
        d if d > 3 => 10,
        d if d > 1 => 5,
        _ => 0,
    }
}

/// Inverted complexity signal: a short, file-light issue is cheap to do
/// now and scores high; a long, file-heavy one scores low.
fn complexity_inverted_signal(issue: &Issue) -> i32 {
    let short_body = issue.body.len() < 400;
    let few_refs = issue.referenced_file_count() <= 2;
    match (short_body, few_refs) {
        (true, true) => 20,
        (true, false) | (false, true) => 10,
        (false, false) => 0,
    }
}

/// Dependency signal: an issue that names a blocker by number that is
/// itself still open loses points; an issue that others reference as their
/// blocker gains points. We look for `#<n>` references in the body against
/// the set of currently active/queued issue ids as a cheap proxy for "open".
fn dependency_signal(issue: &Issue, state: &DaemonState) -> i32 {
    let referenced_open_blocker = issue
        .body
        .split(|c: char| !c.is_ascii_digit() && c != '#')
        .filter_map(|tok| tok.strip_prefix('#'))
        .filter_map(|n| n.parse::<i64>().ok())
        .any(|id| id != issue.id && state.is_active_or_queued(id));

    if referenced_open_blocker {
        -15
    } else {
        15
    }
}

fn type_signal(issue: &Issue) -> i32 {
    if issue.has_any_label(&["security", "bug"]) {
        10
    } else if issue.has_label("feature") {
        5
    } else {
        0
    }
}

fn memory_signal(issue: &Issue, state: &DaemonState) -> i32 {
    let last = state
        .completed
        .iter()
        .rev()
        .find(|o| o.issue_id == issue.id);
    match last {
        Some(o) if o.succeeded => 10,
        Some(_) => -5,
        None => 0,
    }
}

/// Full scoring breakdown for an issue against the current daemon state.
pub fn score(issue: &Issue, state: &DaemonState, now: chrono::DateTime<chrono::Utc>) -> ScoreBreakdown {
    ScoreBreakdown {
        priority: priority_signal(issue),
        age: age_signal(issue, now),
        complexity_inverted: complexity_inverted_signal(issue),
        dependency: dependency_signal(issue, state),
        issue_type: type_signal(issue),
        memory: memory_signal(issue, state),
    }
}

/// Tie-break ordering for ranking triage candidates: higher score first,
/// then older issue first, then numerically smaller id.
pub fn rank_key(issue: &Issue, score: u8) -> (std::cmp::Reverse<u8>, chrono::DateTime<chrono::Utc>, i64) {
    (std::cmp::Reverse(score), issue.created_at, issue.id)
}

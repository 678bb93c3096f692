use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A snapshot of an issue as fetched from the tracker.
///
/// The daemon holds no authoritative copy of an issue — every poll
/// re-fetches a fresh `Issue`. This type is the shape of that snapshot,
/// not a cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub id: i64,
    pub title: String,
    pub body: String,
    pub labels: BTreeSet<String>,
    pub milestone: Option<String>,
    pub created_at: DateTime<Utc>,
    pub assignees: Vec<String>,
}

impl Issue {
    pub fn new(id: i64, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            body: body.into(),
            labels: BTreeSet::new(),
            milestone: None,
            created_at: Utc::now(),
            assignees: Vec::new(),
        }
    }

    pub fn with_labels(mut self, labels: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l.eq_ignore_ascii_case(label))
    }

    pub fn has_any_label(&self, labels: &[&str]) -> bool {
        labels.iter().any(|l| self.has_label(l))
    }

    /// Age in whole days since creation, used by triage's age signal.
    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_days().max(0)
    }

    /// Rough count of distinct file paths referenced in the body — a cheap
    /// complexity signal. Looks for path-shaped tokens (contain a `/` or a
    /// recognized source extension).
    pub fn referenced_file_count(&self) -> usize {
        self.body
            .split_whitespace()
            .filter(|tok| {
                let tok = tok.trim_matches(|c: char| !c.is_alphanumeric() && c != '/' && c != '.');
                tok.contains('/')
                    || tok.ends_with(".rs")
                    || tok.ends_with(".ts")
                    || tok.ends_with(".js")
                    || tok.ends_with(".py")
                    || tok.ends_with(".go")
            })
            .collect::<BTreeSet<_>>()
            .len()
    }
}

//! Optional multi-host coordination endpoint for claim arbitration across
//! daemon instances watching the same tracker.
//!
//! The `claimed:<machine>` label is the authoritative-enough fallback when
//! no dashboard is configured; this module is consulted *in addition* to
//! it when `DASHBOARD_URL` is set, never in place of it. Any network
//! failure, timeout, or missing configuration degrades to "not claimed by
//! anyone else" — a dashboard that can't be reached must never block
//! admission, only the authoritative state blob on the winning host can do
//! that. Peer coordination is best-effort by design.

use serde::Deserialize;
use std::time::Duration;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct ClaimResponse {
    #[serde(default)]
    claimed_by: Option<String>,
}

/// Ask the dashboard whether `issue_id` is claimed by a machine other than
/// `machine_id`. Returns `false` (not claimed elsewhere) whenever the
/// dashboard is unset, unreachable, or returns anything unparseable —
/// the label read remains the ground truth in every one of those cases.
pub async fn claimed_elsewhere(dashboard_url: Option<&str>, issue_id: i64, machine_id: &str) -> bool {
    let Some(base) = dashboard_url else {
        return false;
    };
    let url = format!("{}/claims/{}", base.trim_end_matches('/'), issue_id);
    let client = match reqwest::Client::builder().timeout(PROBE_TIMEOUT).build() {
        Ok(c) => c,
        Err(_) => return false,
    };
    let Ok(resp) = client.get(&url).send().await else {
        return false;
    };
    if !resp.status().is_success() {
        return false;
    }
    let Ok(parsed) = resp.json::<ClaimResponse>().await else {
        return false;
    };
    match parsed.claimed_by {
        Some(owner) => owner != machine_id,
        None => false,
    }
}

/// Best-effort notify the dashboard of a claim; failures are logged by the
/// caller and never block admission (the label write is what matters).
pub async fn record_claim(dashboard_url: Option<&str>, issue_id: i64, machine_id: &str) {
    let Some(base) = dashboard_url else {
        return;
    };
    let url = format!("{}/claims/{}", base.trim_end_matches('/'), issue_id);
    let client = match reqwest::Client::builder().timeout(PROBE_TIMEOUT).build() {
        Ok(c) => c,
        Err(_) => return,
    };
    let _ = client
        .put(&url)
        .json(&serde_json::json!({ "claimed_by": machine_id }))
        .send()
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_dashboard_url_is_never_claimed_elsewhere() {
        assert!(!claimed_elsewhere(None, 1, "host-a").await);
    }

    #[tokio::test]
    async fn unreachable_dashboard_degrades_to_not_claimed() {
        assert!(!claimed_elsewhere(Some("http://127.0.0.1:1"), 1, "host-a").await);
    }
}

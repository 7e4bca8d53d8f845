//! Outbound webhook delivery (§6.3, optional).
//!
//! One POST per subscribed plan/node transition, fire-and-forget via
//! `reqwest`, grounded on the same HTTP-client usage the pack's other
//! services use for outbound calls. Subscriber URLs are validated once at
//! registration time: only loopback addresses are accepted, since the
//! webhook receiver is assumed to run alongside the plan runner, not across
//! a network boundary.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::model::{NodeStatus, PhaseStatuses, PlanStatus};

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("webhook url {0:?} is not a valid url")]
    InvalidUrl(String),
    #[error("webhook url {0:?} does not resolve to a loopback address")]
    NotLoopback(String),
}

/// Validate a subscriber URL: must parse, and must resolve to a loopback
/// address (§6.3 "Subscriber URLs are rejected unless they resolve to a
/// loopback address").
pub fn validate_subscriber_url(raw: &str) -> Result<(), WebhookError> {
    let url = reqwest::Url::parse(raw).map_err(|_| WebhookError::InvalidUrl(raw.to_string()))?;
    let host = url.host_str().ok_or_else(|| WebhookError::InvalidUrl(raw.to_string()))?;

    let is_loopback = if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        ip.is_loopback()
    } else {
        host == "localhost"
    };

    if is_loopback {
        Ok(())
    } else {
        Err(WebhookError::NotLoopback(raw.to_string()))
    }
}

/// Fixed phase progress weights (§6.3). `cleanup` is folded in as the
/// terminal 100% mark once the leaf's merge has landed and its worktree is
/// destroyed.
pub fn phase_progress(statuses: &PhaseStatuses, merged: bool, cleaned_up: bool) -> i32 {
    use crate::model::PhaseStatus::*;

    if cleaned_up {
        return 100;
    }
    if merged {
        return 95;
    }
    if statuses.postcheck == Passed {
        return 85;
    }
    if statuses.work == Passed {
        return 70;
    }
    if statuses.precheck == Passed {
        return 10;
    }
    0
}

/// Progress for a node that has reached a terminal failure/cancel state is
/// always `-1`, overriding the phase-weight calculation above.
pub fn progress_for_status(status: NodeStatus, phase_progress: i32) -> i32 {
    if matches!(status, NodeStatus::Failed | NodeStatus::Canceled | NodeStatus::Blocked) {
        -1
    } else {
        phase_progress
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSummary {
    pub id: String,
    pub name: String,
    pub status: NodeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    pub step_statuses: PhaseStatuses,
    pub progress: i32,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSummary {
    pub id: String,
    pub name: String,
    pub status: PlanStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    pub progress: i32,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum WebhookEvent {
    #[serde(rename = "node")]
    Node {
        timestamp: DateTime<Utc>,
        job: NodeSummary,
    },
    #[serde(rename = "plan")]
    Plan {
        timestamp: DateTime<Utc>,
        plan: PlanSummary,
    },
}

/// Best-effort outbound delivery: one POST per subscriber, errors logged
/// and swallowed -- a webhook receiver being unreachable must never fail
/// the plan it is reporting on.
pub struct WebhookDispatcher {
    client: reqwest::Client,
    subscribers: Vec<String>,
}

impl WebhookDispatcher {
    pub fn new(subscribers: Vec<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            subscribers,
        }
    }

    pub async fn dispatch(&self, event: &WebhookEvent) {
        for url in &self.subscribers {
            if let Err(e) = self.client.post(url).json(event).send().await {
                tracing::warn!(url, error = %e, "webhook delivery failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_loopback_ip() {
        assert!(validate_subscriber_url("http://127.0.0.1:9000/hook").is_ok());
    }

    #[test]
    fn accepts_localhost_hostname() {
        assert!(validate_subscriber_url("http://localhost:9000/hook").is_ok());
    }

    #[test]
    fn accepts_ipv6_loopback() {
        assert!(validate_subscriber_url("http://[::1]:9000/hook").is_ok());
    }

    #[test]
    fn rejects_remote_host() {
        assert!(validate_subscriber_url("http://example.com/hook").is_err());
    }

    #[test]
    fn rejects_malformed_url() {
        assert!(validate_subscriber_url("not a url").is_err());
    }

    #[test]
    fn progress_is_negative_one_on_failure_regardless_of_phase() {
        assert_eq!(progress_for_status(NodeStatus::Failed, 70), -1);
        assert_eq!(progress_for_status(NodeStatus::Canceled, 10), -1);
    }

    #[test]
    fn progress_follows_phase_weights_when_running() {
        assert_eq!(progress_for_status(NodeStatus::Running, 70), 70);
    }

    #[test]
    fn phase_progress_weights_match_spec() {
        let mut statuses = PhaseStatuses::default();
        assert_eq!(phase_progress(&statuses, false, false), 0);
        statuses.precheck = crate::model::PhaseStatus::Passed;
        assert_eq!(phase_progress(&statuses, false, false), 10);
        statuses.work = crate::model::PhaseStatus::Passed;
        assert_eq!(phase_progress(&statuses, false, false), 70);
        statuses.postcheck = crate::model::PhaseStatus::Passed;
        assert_eq!(phase_progress(&statuses, false, false), 85);
        assert_eq!(phase_progress(&statuses, true, false), 95);
        assert_eq!(phase_progress(&statuses, true, true), 100);
    }
}

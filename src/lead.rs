// src/lead.rs

pub mod store;

use chrono::{DateTime, Utc};
use lead_protocol::VerificationReport;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Progress of a lead. Codes leave room between Processing and Done for
/// worker-defined stages; only forward moves are allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum LeadStatus {
    Queued,
    Processing,
    Done,
}

impl LeadStatus {
    pub fn code(&self) -> u8 {
        match self {
            LeadStatus::Queued => 1,
            LeadStatus::Processing => 2,
            LeadStatus::Done => 9,
        }
    }

    pub fn is_terminal(&self) -> bool {
        *self == LeadStatus::Done
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum VerificationStatus {
    #[default]
    Pending,
    Failed,
    Passed,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Verification {
    pub status: VerificationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<&VerificationReport> for Verification {
    fn from(report: &VerificationReport) -> Self {
        Self {
            status: if report.passed {
                VerificationStatus::Passed
            } else {
                VerificationStatus::Failed
            },
            message: report.message.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LeadError {
    pub status: bool,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Lead {
    pub id: String,
    pub owner: String,
    pub flow_id: String,
    pub current_node_id: Option<String>,
    pub status: LeadStatus,
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub verification: Verification,
    #[serde(default)]
    pub error: LeadError,
    /// Branch taken on the last dispatch out of `current_node_id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_branch: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Lead {
    pub fn new(owner: &str, flow_id: &str, node_id: &str, payload: Map<String, Value>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            owner: owner.to_string(),
            flow_id: flow_id.to_string(),
            current_node_id: Some(node_id.to_string()),
            status: LeadStatus::Queued,
            payload,
            verification: Verification::default(),
            error: LeadError::default(),
            last_branch: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Moves to `next` if that is further along. Returns whether it moved.
    pub fn advance(&mut self, next: LeadStatus) -> bool {
        if next.code() <= self.status.code() {
            return false;
        }
        self.status = next;
        self.touch();
        true
    }

    /// Flags the lead as failed and counts the attempt.
    pub fn record_failure(&mut self, message: Option<String>) {
        self.error.status = true;
        self.error.retry_count += 1;
        if message.is_some() {
            self.error.message = message;
        }
        self.touch();
    }

    /// The only backwards move: a failed hop goes back to the queue.
    pub fn reset_for_retry(&mut self) {
        self.error.status = false;
        self.error.message = None;
        self.status = LeadStatus::Queued;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_only_moves_forward() {
        let mut lead = Lead::new("o", "f", "a", Map::new());
        assert_eq!(lead.status, LeadStatus::Queued);
        assert!(lead.advance(LeadStatus::Processing));
        assert!(!lead.advance(LeadStatus::Queued));
        assert!(lead.advance(LeadStatus::Done));
        assert!(!lead.advance(LeadStatus::Processing));
        assert!(lead.status.is_terminal());
    }

    #[test]
    fn failures_count_and_retry_clears_the_flag() {
        let mut lead = Lead::new("o", "f", "a", Map::new());
        lead.advance(LeadStatus::Processing);
        lead.record_failure(Some("smtp timeout".into()));
        lead.record_failure(None);
        assert!(lead.error.status);
        assert_eq!(lead.error.retry_count, 2);
        assert_eq!(lead.error.message.as_deref(), Some("smtp timeout"));

        lead.reset_for_retry();
        assert!(!lead.error.status);
        assert_eq!(lead.error.retry_count, 2);
        assert_eq!(lead.status, LeadStatus::Queued);
    }

    #[test]
    fn verification_follows_the_report() {
        let v = Verification::from(&VerificationReport {
            passed: false,
            message: Some("no answer".into()),
        });
        assert_eq!(v.status, VerificationStatus::Failed);
        assert_eq!(v.message.as_deref(), Some("no answer"));
    }

    #[test]
    fn serialized_lead_uses_document_field_names() {
        let lead = Lead::new("o", "f", "a", Map::new());
        let doc = serde_json::to_value(&lead).unwrap();
        assert_eq!(doc["currentNodeId"], "a");
        assert_eq!(doc["status"], "queued");
        assert_eq!(doc["error"]["retryCount"], 0);
    }
}

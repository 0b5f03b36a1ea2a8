use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("could not encode message: {0}")]
    Encode(serde_json::Error),
    #[error("could not decode message: {0}")]
    Decode(serde_json::Error),
}

/// One unit of work for a node worker: "process lead X at node Y".
///
/// Published to the queue `{owner}.{flowId}.{targetNodeId}` through the
/// exchange named after the target node's kind.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskEnvelope {
    pub lead_id: String,
    pub flow_id: String,
    pub owner: String,
    pub source_node_id: String,
    pub target_node_id: String,
    pub timestamp: DateTime<Utc>,
}

impl TaskEnvelope {
    pub fn new(
        lead_id: impl Into<String>,
        flow_id: impl Into<String>,
        owner: impl Into<String>,
        source_node_id: impl Into<String>,
        target_node_id: impl Into<String>,
    ) -> Self {
        Self {
            lead_id: lead_id.into(),
            flow_id: flow_id.into(),
            owner: owner.into(),
            source_node_id: source_node_id.into(),
            target_node_id: target_node_id.into(),
            timestamp: Utc::now(),
        }
    }

    /// Routing key (and queue name) of the target node.
    pub fn routing_key(&self) -> String {
        format!("{}.{}.{}", self.owner, self.flow_id, self.target_node_id)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(ProtocolError::Encode)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(ProtocolError::Decode)
    }
}

/// What lands on the dead-letter queue: the hop that failed plus the
/// lead's error bookkeeping at the time it was parked.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    #[serde(flatten)]
    pub task: TaskEnvelope,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl DeadLetter {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(ProtocolError::Encode)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(ProtocolError::Decode)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReport {
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TaskOutcome {
    /// The worker picked the task up.
    Started,
    /// The node finished; `branch` selects the outgoing route of a
    /// multi-output node.
    Completed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        branch: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        verification: Option<VerificationReport>,
    },
    Failed {
        message: String,
    },
}

/// Sent back by a worker once it has acted on a [`TaskEnvelope`].
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskReport {
    pub lead_id: String,
    pub flow_id: String,
    pub owner: String,
    pub node_id: String,
    pub outcome: TaskOutcome,
}

impl TaskReport {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(ProtocolError::Encode)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(ProtocolError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_uses_camel_case_wire_names() {
        let env = TaskEnvelope::new("l1", "f1", "u1", "A", "B");
        let value = serde_json::to_value(&env).unwrap();

        assert_eq!(value["leadId"], "l1");
        assert_eq!(value["flowId"], "f1");
        assert_eq!(value["owner"], "u1");
        assert_eq!(value["sourceNodeId"], "A");
        assert_eq!(value["targetNodeId"], "B");
        assert!(value.get("timestamp").is_some());
    }

    #[test]
    fn routing_key_is_owner_flow_target() {
        let env = TaskEnvelope::new("l1", "f1", "u1", "A", "B");
        assert_eq!(env.routing_key(), "u1.f1.B");
    }

    #[test]
    fn dead_letter_flattens_the_task() {
        let dl = DeadLetter {
            task: TaskEnvelope::new("l1", "f1", "u1", "A", "A"),
            retry_count: 2,
            message: Some("boom".into()),
        };
        let value = serde_json::to_value(&dl).unwrap();
        assert_eq!(value["leadId"], "l1");
        assert_eq!(value["retryCount"], 2);
        assert_eq!(value["message"], "boom");
    }

    #[test]
    fn report_outcomes_parse_from_worker_json() {
        let raw = json!({
            "leadId": "l1",
            "flowId": "f1",
            "owner": "u1",
            "nodeId": "B",
            "outcome": { "type": "completed", "verification": { "passed": true } }
        });
        let report = TaskReport::from_bytes(raw.to_string().as_bytes()).unwrap();
        assert_eq!(
            report.outcome,
            TaskOutcome::Completed {
                branch: None,
                verification: Some(VerificationReport { passed: true, message: None }),
            }
        );

        let failed = json!({
            "leadId": "l1", "flowId": "f1", "owner": "u1", "nodeId": "B",
            "outcome": { "type": "failed", "message": "no answer" }
        });
        let report: TaskReport = serde_json::from_value(failed).unwrap();
        assert_eq!(report.outcome, TaskOutcome::Failed { message: "no answer".into() });
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(matches!(
            TaskEnvelope::from_bytes(b"not json"),
            Err(ProtocolError::Decode(_))
        ));
    }
}

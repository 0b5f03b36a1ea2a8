// src/completion.rs

use std::sync::Arc;

use lead_protocol::{TaskOutcome, TaskReport, VerificationReport};
use tracing::{debug, info};

use crate::dispatcher::{DispatchOutcome, DispatchRequest, Dispatcher};
use crate::error::EngineError;
use crate::flow::NodeKind;
use crate::flow::store::FlowStore;
use crate::lead::store::LeadStore;
use crate::lead::{LeadStatus, Verification};

/// Applies worker reports to leads and moves them on.
#[derive(Clone)]
pub struct CompletionHandler {
    flows: Arc<dyn FlowStore>,
    leads: Arc<dyn LeadStore>,
    dispatcher: Dispatcher,
}

impl std::fmt::Debug for CompletionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionHandler").finish_non_exhaustive()
    }
}

/// Branch of a multi-output node implied by a verification result.
fn branch_from_verification(kind: NodeKind, verification: Option<&VerificationReport>) -> Option<String> {
    let labels = kind.branch_labels();
    if labels.len() < 2 {
        return None;
    }
    verification.map(|v| if v.passed { labels[0] } else { labels[1] }.to_string())
}

impl CompletionHandler {
    pub fn new(flows: Arc<dyn FlowStore>, leads: Arc<dyn LeadStore>, dispatcher: Dispatcher) -> Self {
        Self {
            flows,
            leads,
            dispatcher,
        }
    }

    /// Raw report as received from a worker.
    pub async fn handle_bytes(&self, bytes: &[u8]) -> Result<Vec<DispatchOutcome>, EngineError> {
        let report = TaskReport::from_bytes(bytes).map_err(|e| EngineError::validation(e.to_string()))?;
        self.handle(report).await
    }

    #[tracing::instrument(skip(self, report), fields(lead_id = %report.lead_id, node = %report.node_id))]
    pub async fn handle(&self, report: TaskReport) -> Result<Vec<DispatchOutcome>, EngineError> {
        let mut lead = self
            .leads
            .get(&report.lead_id)
            .await?
            .ok_or_else(|| EngineError::LeadNotFound(report.lead_id.clone()))?;
        if lead.flow_id != report.flow_id || lead.owner != report.owner {
            return Err(EngineError::validation(format!(
                "lead `{}` does not belong to flow `{}` of `{}`",
                lead.id, report.flow_id, report.owner
            )));
        }

        if lead.status.is_terminal() {
            debug!("ignoring report from node {} for finished lead {}", report.node_id, lead.id);
            return Ok(Vec::new());
        }

        match report.outcome {
            TaskOutcome::Started => {
                if lead.advance(LeadStatus::Processing) {
                    self.leads.save(lead).await?;
                }
                debug!("worker started on {}", report.node_id);
                Ok(Vec::new())
            }
            TaskOutcome::Completed { branch, verification } => {
                let flow = self
                    .flows
                    .get(&report.flow_id)
                    .await?
                    .ok_or_else(|| EngineError::FlowNotFound(report.flow_id.clone()))?;
                let node = flow.node(&report.node_id).ok_or_else(|| {
                    EngineError::validation(format!(
                        "node `{}` is not part of flow `{}`",
                        report.node_id, flow.id
                    ))
                })?;

                let branch = branch.or_else(|| branch_from_verification(node.kind, verification.as_ref()));
                lead.advance(LeadStatus::Processing);
                lead.current_node_id = Some(node.id.clone());
                if let Some(verification) = &verification {
                    lead.verification = Verification::from(verification);
                }
                self.leads.save(lead.clone()).await?;

                info!("node {} done for lead {}", node.id, lead.id);
                let request = DispatchRequest::new(&report.owner, &report.flow_id, &report.node_id).with_branch(branch);
                self.dispatcher.publish_lead(&request, vec![lead]).await
            }
            TaskOutcome::Failed { message } => {
                let request = DispatchRequest::new(&report.owner, &report.flow_id, &report.node_id).as_error(Some(message));
                self.dispatcher.publish_lead(&request, vec![lead]).await
            }
        }
    }
}

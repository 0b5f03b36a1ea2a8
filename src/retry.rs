// src/retry.rs

use std::sync::Arc;

use tracing::{info, warn};

use crate::dispatcher::{DispatchOutcome, DispatchRequest, Dispatcher};
use crate::error::EngineError;
use crate::lead::store::LeadStore;
use crate::lead::{LeadError, LeadStatus};
use crate::logger::DispatchMetrics;

/// Caller-triggered replay of a lead's last hop. Immediate, no backoff.
#[derive(Clone)]
pub struct RetryPath {
    leads: Arc<dyn LeadStore>,
    dispatcher: Dispatcher,
    metrics: DispatchMetrics,
}

impl RetryPath {
    pub fn new(leads: Arc<dyn LeadStore>, dispatcher: Dispatcher, metrics: DispatchMetrics) -> Self {
        Self {
            leads,
            dispatcher,
            metrics,
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn retry_lead(&self, lead_id: &str) -> Result<Vec<DispatchOutcome>, EngineError> {
        let mut lead = self
            .leads
            .get(lead_id)
            .await?
            .ok_or_else(|| EngineError::LeadNotFound(lead_id.to_string()))?;
        let source = lead.current_node_id.clone().ok_or_else(|| {
            EngineError::validation(format!("lead `{lead_id}` has not been dispatched yet"))
        })?;

        let (failed_error, failed_status) = (lead.error.clone(), lead.status);
        lead.reset_for_retry();
        self.leads.save(lead.clone()).await?;
        info!(
            "retrying lead {} from node {} (attempt {})",
            lead.id,
            source,
            lead.error.retry_count + 1
        );

        let request = DispatchRequest::new(&lead.owner, &lead.flow_id, source).with_branch(lead.last_branch.clone());
        let flow_id = lead.flow_id.clone();
        match self.dispatcher.publish_lead(&request, vec![lead]).await {
            Ok(outcomes) => {
                self.metrics.retried(&flow_id);
                Ok(outcomes)
            }
            Err(err) => {
                warn!("retry of lead {} failed, keeping it flagged: {}", lead_id, err);
                self.restore_failure(lead_id, failed_error, failed_status).await?;
                Err(err)
            }
        }
    }

    /// Puts back the error state a failed retry cleared.
    async fn restore_failure(&self, lead_id: &str, error: LeadError, status: LeadStatus) -> Result<(), EngineError> {
        if let Some(mut lead) = self.leads.get(lead_id).await? {
            lead.error = error;
            lead.status = status;
            lead.touch();
            self.leads.save(lead).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for RetryPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPath").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::broker::InMemoryBroker;
    use crate::dispatcher::DeadLetterTarget;
    use crate::flow::routes::RouteCache;
    use crate::flow::store::{FlowStore, InMemoryFlowStore};
    use crate::flow::{Edge, Flow, FlowDefinition, FlowStatus, Node, NodeKind};
    use crate::lead::store::InMemoryLeadStore;
    use crate::lead::Lead;
    use crate::topology::TopologyManager;
    use serde_json::Map;

    #[tokio::test]
    async fn retry_clears_the_error_and_replays_one_hop() {
        let memory = Arc::new(InMemoryBroker::new());
        let flows = Arc::new(InMemoryFlowStore::new());
        let leads = Arc::new(InMemoryLeadStore::new());
        let mut flow = Flow::new(
            "f1",
            FlowDefinition {
                owner: "acme".into(),
                name: "n".into(),
                nodes: vec![Node::new("a", NodeKind::Excel), Node::new("b", NodeKind::Sms)],
                edges: vec![Edge::new("a", "b")],
            },
        );
        flow.status = FlowStatus::Active;
        flows.save(flow.clone()).await.unwrap();
        TopologyManager::new(memory.clone()).create_topology(&flow).await.unwrap();

        let mut lead = Lead::new("acme", "f1", "a", Map::new());
        lead.record_failure(Some("carrier rejected".into()));
        leads.insert(lead.clone()).await.unwrap();

        let dispatcher = Dispatcher::new(
            memory.clone(),
            flows,
            leads.clone(),
            RouteCache::new(Duration::from_secs(60)),
            DeadLetterTarget {
                exchange: "dlx".into(),
                queue: "dlq".into(),
            },
            DispatchMetrics::new(),
        );
        let retry = RetryPath::new(leads.clone(), dispatcher, DispatchMetrics::new());

        let out = retry.retry_lead(&lead.id).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(memory.queue_len(&flow.queue_name("b")), 1);

        let saved = leads.get(&lead.id).await.unwrap().unwrap();
        assert!(!saved.error.status);
        assert_eq!(saved.error.retry_count, 1);
        assert_eq!(saved.status, LeadStatus::Queued);

        let err = retry.retry_lead("missing").await.unwrap_err();
        assert!(matches!(err, EngineError::LeadNotFound(_)));
    }

    #[tokio::test]
    async fn retry_during_an_outage_keeps_the_lead_flagged() {
        let memory = Arc::new(InMemoryBroker::new());
        let flows = Arc::new(InMemoryFlowStore::new());
        let leads = Arc::new(InMemoryLeadStore::new());
        let mut flow = Flow::new(
            "f1",
            FlowDefinition {
                owner: "acme".into(),
                name: "n".into(),
                nodes: vec![Node::new("a", NodeKind::Excel), Node::new("b", NodeKind::Sms)],
                edges: vec![Edge::new("a", "b")],
            },
        );
        flow.status = FlowStatus::Active;
        flows.save(flow.clone()).await.unwrap();
        TopologyManager::new(memory.clone()).create_topology(&flow).await.unwrap();

        let mut lead = Lead::new("acme", "f1", "a", Map::new());
        lead.record_failure(Some("carrier rejected".into()));
        leads.insert(lead.clone()).await.unwrap();

        let dispatcher = Dispatcher::new(
            memory.clone(),
            flows,
            leads.clone(),
            RouteCache::new(Duration::from_secs(60)),
            DeadLetterTarget {
                exchange: "dlx".into(),
                queue: "dlq".into(),
            },
            DispatchMetrics::new(),
        );
        let retry = RetryPath::new(leads.clone(), dispatcher, DispatchMetrics::new());

        memory.set_available(false);
        let err = retry.retry_lead(&lead.id).await.unwrap_err();
        assert!(matches!(err, EngineError::BrokerUnavailable(_)));

        let saved = leads.get(&lead.id).await.unwrap().unwrap();
        assert!(saved.error.status);
        assert_eq!(saved.error.message.as_deref(), Some("carrier rejected"));
        assert_eq!(saved.error.retry_count, 1);
        assert_eq!(saved.status, lead.status);

        memory.set_available(true);
        retry.retry_lead(&lead.id).await.unwrap();
        assert_eq!(memory.queue_len(&flow.queue_name("b")), 1);
        assert!(!leads.get(&lead.id).await.unwrap().unwrap().error.status);
    }
}

// src/ingress.rs

use std::sync::Arc;

use futures::future::try_join_all;
use serde_json::Value;
use tracing::info;

use crate::dispatcher::{DispatchOutcome, DispatchRequest, Dispatcher};
use crate::error::EngineError;
use crate::flow::FlowStatus;
use crate::flow::store::FlowStore;
use crate::lead::Lead;
use crate::lead::store::LeadStore;
use crate::logger::DispatchMetrics;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReport {
    /// Ids of the created leads, in record order.
    pub lead_ids: Vec<String>,
    pub outcomes: Vec<DispatchOutcome>,
}

/// Turns raw record batches into leads and starts routing them.
#[derive(Clone)]
pub struct IngressAdapter {
    flows: Arc<dyn FlowStore>,
    leads: Arc<dyn LeadStore>,
    dispatcher: Dispatcher,
    metrics: DispatchMetrics,
}

impl IngressAdapter {
    pub fn new(
        flows: Arc<dyn FlowStore>,
        leads: Arc<dyn LeadStore>,
        dispatcher: Dispatcher,
        metrics: DispatchMetrics,
    ) -> Self {
        Self {
            flows,
            leads,
            dispatcher,
            metrics,
        }
    }

    /// Creates one Queued lead per record at `node_id`, then dispatches
    /// them from there. Only Active flows take leads. The same record sent
    /// twice becomes two leads.
    #[tracing::instrument(skip(self, records), fields(records = records.len()))]
    pub async fn ingest(
        &self,
        owner: &str,
        flow_id: &str,
        node_id: &str,
        records: Vec<Value>,
    ) -> Result<IngestReport, EngineError> {
        // 1) the batch itself
        if records.is_empty() {
            return Err(EngineError::validation("ingest batch is empty"));
        }

        // 2) the flow and entry node
        let flow = self
            .flows
            .get(flow_id)
            .await?
            .filter(|f| f.owner == owner)
            .ok_or_else(|| EngineError::FlowNotFound(flow_id.to_string()))?;
        if flow.status != FlowStatus::Active {
            return Err(EngineError::FlowInactive {
                flow_id: flow.id.clone(),
                status: flow.status,
            });
        }
        let node = flow.node(node_id).ok_or_else(|| {
            EngineError::validation(format!("node `{node_id}` is not part of flow `{flow_id}`"))
        })?;
        if node.kind.is_branching() {
            return Err(EngineError::validation(format!(
                "leads cannot enter at {} node `{node_id}`",
                node.kind
            )));
        }

        // 3) every record must be an object before anything is stored
        let mut payloads = Vec::with_capacity(records.len());
        for (index, record) in records.into_iter().enumerate() {
            match record {
                Value::Object(map) => payloads.push(map),
                other => {
                    return Err(EngineError::validation(format!(
                        "record {index} is not an object: {other}"
                    )));
                }
            }
        }

        // 4) persist, then route
        let leads: Vec<Lead> = payloads
            .into_iter()
            .map(|payload| Lead::new(owner, flow_id, node_id, payload))
            .collect();
        try_join_all(leads.iter().map(|lead| self.leads.insert(lead.clone()))).await?;
        self.metrics.ingested(flow_id, leads.len() as u64);
        info!("ingested {} lead(s) into {} at {}", leads.len(), flow_id, node_id);

        let lead_ids = leads.iter().map(|l| l.id.clone()).collect();
        let outcomes = self
            .dispatcher
            .publish_lead(&DispatchRequest::new(owner, flow_id, node_id), leads)
            .await?;
        Ok(IngestReport { lead_ids, outcomes })
    }
}

impl std::fmt::Debug for IngressAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngressAdapter").finish_non_exhaustive()
    }
}

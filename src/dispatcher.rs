// src/dispatcher.rs

use std::sync::Arc;

use futures::future::join_all;
use lead_protocol::{DeadLetter, TaskEnvelope};
use tracing::{debug, info, warn};

use crate::broker::{Broker, BrokerError};
use crate::error::EngineError;
use crate::flow::routes::{RouteCache, RouteTable};
use crate::flow::store::FlowStore;
use crate::flow::{Flow, queue_name};
use crate::lead::store::LeadStore;
use crate::lead::{Lead, LeadStatus};
use crate::logger::DispatchMetrics;

/// Where failed leads are parked, independent of any flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterTarget {
    pub exchange: String,
    pub queue: String,
}

/// One hop to dispatch: where the leads are now, and how they left it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRequest {
    pub owner: String,
    pub flow_id: String,
    pub source_node_id: String,
    pub branch: Option<String>,
    pub is_error: bool,
    pub error_message: Option<String>,
}

impl DispatchRequest {
    pub fn new(owner: impl Into<String>, flow_id: impl Into<String>, source_node_id: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            flow_id: flow_id.into(),
            source_node_id: source_node_id.into(),
            branch: None,
            is_error: false,
            error_message: None,
        }
    }

    pub fn with_branch(mut self, branch: Option<String>) -> Self {
        self.branch = branch;
        self
    }

    /// Sends the leads to the dead-letter queue instead of routing them.
    pub fn as_error(mut self, message: Option<String>) -> Self {
        self.is_error = true;
        self.error_message = message;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Task envelopes went out to these target nodes.
    Published { lead_id: String, targets: Vec<String> },
    /// No route matched: the lead is done.
    Completed { lead_id: String },
    DeadLettered { lead_id: String },
}

#[derive(Clone)]
pub struct Dispatcher {
    broker: Arc<dyn Broker>,
    flows: Arc<dyn FlowStore>,
    leads: Arc<dyn LeadStore>,
    routes: RouteCache,
    dead_letter: DeadLetterTarget,
    metrics: DispatchMetrics,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("broker", &self.broker.name())
            .field("dead_letter", &self.dead_letter)
            .finish()
    }
}

impl Dispatcher {
    pub fn new(
        broker: Arc<dyn Broker>,
        flows: Arc<dyn FlowStore>,
        leads: Arc<dyn LeadStore>,
        routes: RouteCache,
        dead_letter: DeadLetterTarget,
        metrics: DispatchMetrics,
    ) -> Self {
        Self {
            broker,
            flows,
            leads,
            routes,
            dead_letter,
            metrics,
        }
    }

    /// Moves every lead one hop on from `request.source_node_id`.
    ///
    /// Leads are handled concurrently and independently: one lead failing
    /// does not stop the others. The first error is returned once all of
    /// them have been attempted. Nothing is deduplicated here.
    #[tracing::instrument(
        skip(self, request, leads),
        fields(flow_id = %request.flow_id, source = %request.source_node_id, leads = leads.len())
    )]
    pub async fn publish_lead(
        &self,
        request: &DispatchRequest,
        leads: Vec<Lead>,
    ) -> Result<Vec<DispatchOutcome>, EngineError> {
        if leads.is_empty() {
            return Ok(Vec::new());
        }

        let results = if request.is_error {
            join_all(leads.into_iter().map(|lead| self.dead_letter_one(request, lead))).await
        } else {
            let flow = self.routable_flow(request).await?;
            let table = self.routes.table(&flow).await;
            join_all(
                leads
                    .into_iter()
                    .map(|lead| self.route_one(&flow, &table, request, lead)),
            )
            .await
        };

        let mut outcomes = Vec::with_capacity(results.len());
        let mut first_error = None;
        for result in results {
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => {
                    warn!("dispatch failed: {}", err);
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(outcomes),
        }
    }

    async fn routable_flow(&self, request: &DispatchRequest) -> Result<Flow, EngineError> {
        let flow = self
            .flows
            .get(&request.flow_id)
            .await?
            .filter(|f| f.owner == request.owner)
            .ok_or_else(|| EngineError::FlowNotFound(request.flow_id.clone()))?;

        let source = flow.node(&request.source_node_id).ok_or_else(|| {
            EngineError::validation(format!(
                "node `{}` is not part of flow `{}`",
                request.source_node_id, flow.id
            ))
        })?;

        match request.branch.as_deref() {
            None if source.kind.is_branching() => {
                return Err(EngineError::validation(format!(
                    "{} node `{}` needs a branch label ({})",
                    source.kind,
                    source.id,
                    source.kind.branch_labels().join("/")
                )));
            }
            Some(label) if source.kind.is_branching() && !source.kind.branch_labels().contains(&label) => {
                warn!("unknown branch `{}` out of {} node `{}`", label, source.kind, source.id);
            }
            _ => {}
        }
        Ok(flow)
    }

    async fn route_one(
        &self,
        flow: &Flow,
        table: &RouteTable,
        request: &DispatchRequest,
        mut lead: Lead,
    ) -> Result<DispatchOutcome, EngineError> {
        let source = &request.source_node_id;
        let targets = table.resolve(source, request.branch.as_deref());

        lead.current_node_id = Some(source.clone());
        lead.last_branch = request.branch.clone();

        if targets.is_empty() {
            lead.advance(LeadStatus::Done);
            self.leads.save(lead.clone()).await?;
            self.metrics.completed(&flow.id);
            info!("lead {} finished at node {}", lead.id, source);
            return Ok(DispatchOutcome::Completed { lead_id: lead.id });
        }

        for target in &targets {
            let node = flow.node(target).ok_or_else(|| {
                EngineError::validation(format!("route target `{target}` is not part of flow `{}`", flow.id))
            })?;
            let envelope = TaskEnvelope::new(&lead.id, &flow.id, &flow.owner, source, target);
            let payload = envelope
                .to_bytes()
                .map_err(|e| BrokerError::Encode(e.to_string()))?;
            self.broker
                .publish(node.kind.exchange_name(), &envelope.routing_key(), payload)
                .await?;
            self.metrics.published(&flow.id, node.kind.exchange_name());
            debug!("lead {} -> {}", lead.id, queue_name(&flow.owner, &flow.id, target));
        }

        lead.touch();
        self.leads.save(lead.clone()).await?;
        Ok(DispatchOutcome::Published {
            lead_id: lead.id,
            targets,
        })
    }

    async fn dead_letter_one(&self, request: &DispatchRequest, mut lead: Lead) -> Result<DispatchOutcome, EngineError> {
        // the failed node is the envelope target; where the lead came from is its source
        let from = lead
            .current_node_id
            .clone()
            .unwrap_or_else(|| request.source_node_id.clone());
        let letter = DeadLetter {
            task: TaskEnvelope::new(&lead.id, &request.flow_id, &request.owner, from, &request.source_node_id),
            retry_count: lead.error.retry_count + 1,
            message: request.error_message.clone(),
        };
        let payload = letter
            .to_bytes()
            .map_err(|e| BrokerError::Encode(e.to_string()))?;
        self.broker
            .publish(&self.dead_letter.exchange, &self.dead_letter.queue, payload)
            .await?;

        lead.record_failure(request.error_message.clone());
        self.leads.save(lead.clone()).await?;
        self.metrics.dead_lettered(&request.flow_id);
        warn!(
            "lead {} dead-lettered at node {} (attempt {})",
            lead.id, request.source_node_id, lead.error.retry_count
        );
        Ok(DispatchOutcome::DeadLettered { lead_id: lead.id })
    }
}

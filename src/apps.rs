// src/apps.rs

use std::path::Path;
use std::sync::Arc;

use lead_protocol::TaskReport;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::broker::{Broker, BrokerHandle, InMemoryBroker};
use crate::completion::CompletionHandler;
use crate::config::EngineConfig;
use crate::dispatcher::{DeadLetterTarget, DispatchOutcome, DispatchRequest, Dispatcher};
use crate::error::EngineError;
use crate::flow::manager::FlowManager;
use crate::flow::routes::RouteCache;
use crate::flow::store::{FlowStore, InMemoryFlowStore};
use crate::flow::{Flow, FlowDefinition, FlowStatus};
use crate::flow_commands::load_flow_dir;
use crate::ingress::{IngestReport, IngressAdapter};
use crate::lead::Lead;
use crate::lead::store::{InMemoryLeadStore, LeadStore};
use crate::logger::DispatchMetrics;
use crate::retry::RetryPath;
use crate::topology::TopologyManager;

/// The wired engine: one broker connection, the stores, and every
/// component built on top of them. Inbound operations go through here.
#[derive(Clone)]
pub struct App {
    config: EngineConfig,
    broker: BrokerHandle,
    leads: Arc<dyn LeadStore>,
    topology: TopologyManager,
    flow_manager: FlowManager,
    dispatcher: Dispatcher,
    ingress: IngressAdapter,
    retry: RetryPath,
    completion: CompletionHandler,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("config", &self.config)
            .field("broker", &self.broker)
            .finish_non_exhaustive()
    }
}

impl App {
    pub fn new(
        config: EngineConfig,
        broker: BrokerHandle,
        flows: Arc<dyn FlowStore>,
        leads: Arc<dyn LeadStore>,
    ) -> Self {
        let shared: Arc<dyn Broker> = Arc::new(broker.clone());
        let metrics = DispatchMetrics::new();
        let routes = RouteCache::new(config.route_cache_ttl);
        let topology = TopologyManager::new(shared.clone());
        let dispatcher = Dispatcher::new(
            shared,
            flows.clone(),
            leads.clone(),
            routes.clone(),
            DeadLetterTarget {
                exchange: config.dead_letter_exchange.clone(),
                queue: config.dead_letter_queue.clone(),
            },
            metrics.clone(),
        );

        Self {
            flow_manager: FlowManager::new(flows.clone(), topology.clone(), routes),
            ingress: IngressAdapter::new(flows.clone(), leads.clone(), dispatcher.clone(), metrics.clone()),
            retry: RetryPath::new(leads.clone(), dispatcher.clone(), metrics),
            completion: CompletionHandler::new(flows, leads.clone(), dispatcher.clone()),
            config,
            broker,
            leads,
            topology,
            dispatcher,
        }
    }

    /// Everything in process memory, including the broker.
    pub fn in_memory(config: EngineConfig) -> (Self, Arc<InMemoryBroker>) {
        let memory = Arc::new(InMemoryBroker::new());
        let app = Self::new(
            config,
            BrokerHandle::ready(memory.clone()),
            Arc::new(InMemoryFlowStore::new()),
            Arc::new(InMemoryLeadStore::new()),
        );
        (app, memory)
    }

    /// In-memory stores over a lazily connected NATS broker.
    pub fn with_nats(config: EngineConfig) -> Self {
        let broker = BrokerHandle::nats(config.broker_url.clone(), config.broker_connect_timeout);
        Self::new(
            config,
            broker,
            Arc::new(InMemoryFlowStore::new()),
            Arc::new(InMemoryLeadStore::new()),
        )
    }

    /// Bootstraps the engine:
    ///   - asserts the dead-letter exchange and queue
    ///   - re-asserts topology of every Active flow
    pub async fn bootstrap(&self) -> Result<(), EngineError> {
        // 1) dead-letter path, shared by all flows
        self.topology
            .ensure_dead_letter(&self.config.dead_letter_exchange, &self.config.dead_letter_queue)
            .await
            .inspect_err(|e| error!("could not set up dead-letter queue: {}", e))?;

        // 2) queues of flows that were already running
        let resynced = self.flow_manager.resync_active().await?;
        info!(
            "leadflow ready on {} broker, {} active flow(s)",
            self.broker.name(),
            resynced
        );
        Ok(())
    }

    /// Creates and activates every definition found in `dir`. Names that
    /// already exist are skipped.
    pub async fn seed_flows(&self, dir: &Path) -> Result<Vec<Flow>, EngineError> {
        let mut seeded = Vec::new();
        for (path, def) in load_flow_dir(dir).map_err(|e| EngineError::validation(format!("{e:#}")))? {
            match self.flow_manager.create(def).await {
                Ok(flow) => {
                    let flow = self.flow_manager.set_status(&flow.id, FlowStatus::Active).await?;
                    info!("seeded flow {} from {}", flow.id, path.display());
                    seeded.push(flow);
                }
                Err(EngineError::FlowStateConflict(msg)) => warn!("skipping {}: {}", path.display(), msg),
                Err(e) => return Err(e),
            }
        }
        Ok(seeded)
    }

    pub async fn shutdown(&self) {
        if let Err(e) = self.broker.close().await {
            warn!("broker close failed: {}", e);
        }
        info!("leadflow stopped");
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn broker(&self) -> &BrokerHandle {
        &self.broker
    }

    pub fn flows(&self) -> &FlowManager {
        &self.flow_manager
    }

    pub async fn ingest(
        &self,
        owner: &str,
        flow_id: &str,
        node_id: &str,
        records: Vec<Value>,
    ) -> Result<IngestReport, EngineError> {
        self.ingress.ingest(owner, flow_id, node_id, records).await
    }

    pub async fn retry_lead(&self, lead_id: &str) -> Result<Vec<DispatchOutcome>, EngineError> {
        self.retry.retry_lead(lead_id).await
    }

    pub async fn create_flow(&self, def: FlowDefinition) -> Result<Flow, EngineError> {
        self.flow_manager.create(def).await
    }

    pub async fn update_flow(&self, flow_id: &str, def: FlowDefinition) -> Result<Flow, EngineError> {
        self.flow_manager.update(flow_id, def).await
    }

    pub async fn set_flow_status(&self, flow_id: &str, status: FlowStatus) -> Result<Flow, EngineError> {
        self.flow_manager.set_status(flow_id, status).await
    }

    /// Dispatches stored leads by id from one node.
    pub async fn publish_lead<S: AsRef<str>>(
        &self,
        request: &DispatchRequest,
        lead_ids: &[S],
    ) -> Result<Vec<DispatchOutcome>, EngineError> {
        let mut leads = Vec::with_capacity(lead_ids.len());
        for id in lead_ids {
            leads.push(self.lead(id.as_ref()).await?);
        }
        self.dispatcher.publish_lead(request, leads).await
    }

    pub async fn report(&self, report: TaskReport) -> Result<Vec<DispatchOutcome>, EngineError> {
        self.completion.handle(report).await
    }

    pub async fn lead(&self, lead_id: &str) -> Result<Lead, EngineError> {
        self.leads
            .get(lead_id)
            .await?
            .ok_or_else(|| EngineError::LeadNotFound(lead_id.to_string()))
    }
}

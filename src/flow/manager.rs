// src/flow/manager.rs

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use super::routes::RouteCache;
use super::store::FlowStore;
use super::{Flow, FlowDefinition, FlowStatus, derive_routes};
use crate::error::EngineError;
use crate::topology::TopologyManager;

/// Owns flow status and keeps broker topology in step with it.
#[derive(Clone)]
pub struct FlowManager {
    flows: Arc<dyn FlowStore>,
    topology: TopologyManager,
    routes: RouteCache,
}

impl std::fmt::Debug for FlowManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowManager")
            .field("routes", &self.routes)
            .finish_non_exhaustive()
    }
}

impl FlowManager {
    pub fn new(flows: Arc<dyn FlowStore>, topology: TopologyManager, routes: RouteCache) -> Self {
        Self {
            flows,
            topology,
            routes,
        }
    }

    /// Stores the flow as Disabled and materializes its topology.
    ///
    /// If the broker is unreachable the flow is still stored and the error
    /// is returned; activating the flow later asserts the topology again.
    #[tracing::instrument(skip(self, def), fields(owner = %def.owner, name = %def.name))]
    pub async fn create(&self, def: FlowDefinition) -> Result<Flow, EngineError> {
        def.validate()?;
        if let Some(existing) = self.flows.find_by_name(&def.owner, &def.name).await? {
            return Err(EngineError::FlowStateConflict(format!(
                "flow `{}` already exists for `{}` ({}, {})",
                def.name, def.owner, existing.id, existing.status
            )));
        }

        let flow = Flow::new(Uuid::new_v4().to_string(), def);
        self.flows.insert(flow.clone()).await?;
        info!("created flow {} ({} node(s))", flow.id, flow.nodes.len());

        self.topology.create_topology(&flow).await?;
        Ok(flow)
    }

    /// Replaces name, nodes and edges and recomputes the routes. Queues are
    /// not touched: nodes added to an Active flow get theirs on the next
    /// activation.
    #[tracing::instrument(skip(self, def))]
    pub async fn update(&self, flow_id: &str, def: FlowDefinition) -> Result<Flow, EngineError> {
        let mut flow = self.get(flow_id).await?;
        if flow.status == FlowStatus::Deleted {
            return Err(EngineError::FlowStateConflict(format!(
                "flow `{flow_id}` is deleted and cannot be edited"
            )));
        }
        if def.owner != flow.owner {
            return Err(EngineError::validation(format!(
                "flow `{flow_id}` belongs to `{}`; its owner cannot change",
                flow.owner
            )));
        }
        def.validate()?;
        if let Some(existing) = self.flows.find_by_name(&def.owner, &def.name).await? {
            if existing.id != flow.id {
                return Err(EngineError::FlowStateConflict(format!(
                    "flow `{}` already exists for `{}`",
                    def.name, def.owner
                )));
            }
        }

        let added: Vec<String> = def
            .nodes
            .iter()
            .filter(|n| flow.node(&n.id).is_none())
            .map(|n| n.id.clone())
            .collect();
        if flow.status == FlowStatus::Active && !added.is_empty() {
            warn!(
                "flow {} is active; new node(s) {:?} have no queue until it is re-activated",
                flow.id, added
            );
        }

        flow.name = def.name;
        flow.nodes = def.nodes;
        flow.routes = derive_routes(&def.edges);
        flow.edges = def.edges;
        flow.updated_at = Utc::now();
        self.flows.save(flow.clone()).await?;
        self.routes.invalidate(&flow.id).await;
        info!("updated flow {} ({} route(s))", flow.id, flow.routes.len());
        Ok(flow)
    }

    /// Disabled and Active switch freely; either may be deleted; Deleted is
    /// final. Asking for the current status is a conflict.
    #[tracing::instrument(skip(self))]
    pub async fn set_status(&self, flow_id: &str, status: FlowStatus) -> Result<Flow, EngineError> {
        let mut flow = self.get(flow_id).await?;
        if flow.status == status {
            return Err(EngineError::FlowStateConflict(format!(
                "flow `{flow_id}` is already {}",
                flow.status
            )));
        }
        if !flow.status.can_transition_to(status) {
            return Err(EngineError::FlowStateConflict(format!(
                "flow `{flow_id}` is {} and cannot become {status}",
                flow.status
            )));
        }

        // broker first, so a failure leaves the stored status untouched
        match status {
            FlowStatus::Active => self.topology.create_topology(&flow).await?,
            FlowStatus::Deleted => self.topology.teardown_topology(&flow).await?,
            FlowStatus::Disabled => {}
        }

        let previous = flow.status;
        flow.status = status;
        flow.updated_at = Utc::now();
        self.flows.save(flow.clone()).await?;
        if status == FlowStatus::Deleted {
            self.routes.invalidate(&flow.id).await;
        }
        info!("flow {} {} -> {}", flow.id, previous, status);
        Ok(flow)
    }

    /// Re-asserts topology for every Active flow. Returns how many were
    /// resynchronised; the first broker failure aborts.
    pub async fn resync_active(&self) -> Result<usize, EngineError> {
        let active = self.flows.list_by_status(FlowStatus::Active).await?;
        for flow in &active {
            self.topology.create_topology(flow).await?;
        }
        info!("resynchronised topology of {} active flow(s)", active.len());
        Ok(active.len())
    }

    pub async fn get(&self, flow_id: &str) -> Result<Flow, EngineError> {
        self.flows
            .get(flow_id)
            .await?
            .ok_or_else(|| EngineError::FlowNotFound(flow_id.to_string()))
    }

    pub async fn list(&self, owner: &str) -> Result<Vec<Flow>, EngineError> {
        Ok(self.flows.list(owner).await?)
    }
}

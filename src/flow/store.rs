// src/flow/store.rs

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::{Flow, FlowStatus};
use crate::error::StoreError;

/// Persistence of flow documents. Only document semantics are required:
/// no transactions, no locking.
#[async_trait]
pub trait FlowStore: Send + Sync {
    /// Fails with `StoreError::Conflict` when the id is taken.
    async fn insert(&self, flow: Flow) -> Result<(), StoreError>;
    async fn get(&self, flow_id: &str) -> Result<Option<Flow>, StoreError>;
    /// Upsert.
    async fn save(&self, flow: Flow) -> Result<(), StoreError>;
    /// Non-deleted flow with this (owner, name), if any.
    async fn find_by_name(&self, owner: &str, name: &str) -> Result<Option<Flow>, StoreError>;
    async fn list(&self, owner: &str) -> Result<Vec<Flow>, StoreError>;
    async fn list_by_status(&self, status: FlowStatus) -> Result<Vec<Flow>, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryFlowStore {
    flows: DashMap<String, Flow>,
}

impl InMemoryFlowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted(mut flows: Vec<Flow>) -> Vec<Flow> {
    flows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    flows
}

#[async_trait]
impl FlowStore for InMemoryFlowStore {
    async fn insert(&self, flow: Flow) -> Result<(), StoreError> {
        match self.flows.entry(flow.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::Conflict(format!("flow id `{}` already exists", flow.id))),
            Entry::Vacant(slot) => {
                slot.insert(flow);
                Ok(())
            }
        }
    }

    async fn get(&self, flow_id: &str) -> Result<Option<Flow>, StoreError> {
        Ok(self.flows.get(flow_id).map(|f| f.clone()))
    }

    async fn save(&self, flow: Flow) -> Result<(), StoreError> {
        self.flows.insert(flow.id.clone(), flow);
        Ok(())
    }

    async fn find_by_name(&self, owner: &str, name: &str) -> Result<Option<Flow>, StoreError> {
        Ok(self
            .flows
            .iter()
            .find(|f| f.owner == owner && f.name == name && f.status != FlowStatus::Deleted)
            .map(|f| f.clone()))
    }

    async fn list(&self, owner: &str) -> Result<Vec<Flow>, StoreError> {
        Ok(sorted(
            self.flows
                .iter()
                .filter(|f| f.owner == owner)
                .map(|f| f.clone())
                .collect(),
        ))
    }

    async fn list_by_status(&self, status: FlowStatus) -> Result<Vec<Flow>, StoreError> {
        Ok(sorted(
            self.flows
                .iter()
                .filter(|f| f.status == status)
                .map(|f| f.clone())
                .collect(),
        ))
    }
}

// src/lead/store.rs

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::Lead;
use crate::error::StoreError;

#[async_trait]
pub trait LeadStore: Send + Sync {
    async fn insert(&self, lead: Lead) -> Result<(), StoreError>;
    async fn get(&self, lead_id: &str) -> Result<Option<Lead>, StoreError>;
    async fn save(&self, lead: Lead) -> Result<(), StoreError>;
    async fn list_by_flow(&self, flow_id: &str) -> Result<Vec<Lead>, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryLeadStore {
    leads: DashMap<String, Lead>,
}

impl InMemoryLeadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.leads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leads.is_empty()
    }
}

#[async_trait]
impl LeadStore for InMemoryLeadStore {
    async fn insert(&self, lead: Lead) -> Result<(), StoreError> {
        match self.leads.entry(lead.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::Conflict(format!("lead `{}` already exists", lead.id))),
            Entry::Vacant(slot) => {
                slot.insert(lead);
                Ok(())
            }
        }
    }

    async fn get(&self, lead_id: &str) -> Result<Option<Lead>, StoreError> {
        Ok(self.leads.get(lead_id).map(|l| l.clone()))
    }

    async fn save(&self, lead: Lead) -> Result<(), StoreError> {
        self.leads.insert(lead.id.clone(), lead);
        Ok(())
    }

    async fn list_by_flow(&self, flow_id: &str) -> Result<Vec<Lead>, StoreError> {
        let mut leads: Vec<Lead> = self
            .leads
            .iter()
            .filter(|l| l.flow_id == flow_id)
            .map(|l| l.clone())
            .collect();
        leads.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(leads)
    }
}

// src/flow/routes.rs

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use moka::future::Cache;
use tracing::trace;

use super::{Flow, Route};

/// Routes of one flow indexed by source node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteTable {
    by_source: HashMap<String, Vec<(Option<String>, String)>>,
}

impl RouteTable {
    pub fn from_routes(routes: &[Route]) -> Self {
        let mut by_source: HashMap<String, Vec<(Option<String>, String)>> = HashMap::new();
        for route in routes {
            by_source
                .entry(route.source_node_id.clone())
                .or_default()
                .push((route.branch_label.clone(), route.target_node_id.clone()));
        }
        Self { by_source }
    }

    /// Target node ids for a hop out of `source`, in route order and
    /// without duplicates. An unlabelled route matches any branch; a
    /// labelled one only its own. Empty means the lead is finished.
    pub fn resolve(&self, source: &str, branch: Option<&str>) -> Vec<String> {
        let mut targets: Vec<String> = Vec::new();
        let Some(candidates) = self.by_source.get(source) else {
            return targets;
        };
        for (label, target) in candidates {
            let matches = match label {
                None => true,
                Some(label) => Some(label.as_str()) == branch,
            };
            if matches && !targets.contains(target) {
                targets.push(target.clone());
            }
        }
        targets
    }
}

/// Convenience over the flow's stored route list.
pub fn resolve(flow: &Flow, source: &str, branch: Option<&str>) -> Vec<String> {
    RouteTable::from_routes(&flow.routes).resolve(source, branch)
}

/// Process-local cache of indexed route tables, keyed by flow id.
/// An entry built from an older revision of the flow is rebuilt.
#[derive(Clone)]
pub struct RouteCache {
    tables: Cache<String, (DateTime<Utc>, Arc<RouteTable>)>,
}

impl std::fmt::Debug for RouteCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteCache")
            .field("entries", &self.tables.entry_count())
            .finish()
    }
}

impl RouteCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            tables: Cache::builder().time_to_idle(ttl).max_capacity(10_000).build(),
        }
    }

    pub async fn table(&self, flow: &Flow) -> Arc<RouteTable> {
        if let Some((revision, table)) = self.tables.get(&flow.id).await {
            if revision == flow.updated_at {
                return table;
            }
        }
        trace!("building route table for flow {}", flow.id);
        let table = Arc::new(RouteTable::from_routes(&flow.routes));
        self.tables
            .insert(flow.id.clone(), (flow.updated_at, table.clone()))
            .await;
        table
    }

    pub async fn invalidate(&self, flow_id: &str) {
        self.tables.invalidate(flow_id).await;
    }

    pub async fn contains(&self, flow_id: &str) -> bool {
        self.tables.get(flow_id).await.is_some()
    }
}

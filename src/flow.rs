// src/flow.rs

pub mod manager;
pub mod routes;
pub mod store;

use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use petgraph::graph::DiGraph;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::EngineError;

/// What a node does, and therefore which worker pool (exchange) its tasks
/// go to. Closed set: the editor cannot invent kinds at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum NodeKind {
    GoogleSheets,
    Sheet,
    Excel,
    FacebookLeadAds,
    Webhook,
    AiCall,
    PreVerify,
    GoogleCalendar,
    Condition,
    SendWebhook,
    Email,
    Sms,
    Verified,
    DeadLead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum NodeCategory {
    Input,
    Processing,
    Logic,
    Action,
    Terminal,
}

impl NodeKind {
    pub const ALL: [NodeKind; 14] = [
        NodeKind::GoogleSheets,
        NodeKind::Sheet,
        NodeKind::Excel,
        NodeKind::FacebookLeadAds,
        NodeKind::Webhook,
        NodeKind::AiCall,
        NodeKind::PreVerify,
        NodeKind::GoogleCalendar,
        NodeKind::Condition,
        NodeKind::SendWebhook,
        NodeKind::Email,
        NodeKind::Sms,
        NodeKind::Verified,
        NodeKind::DeadLead,
    ];

    pub fn category(&self) -> NodeCategory {
        use NodeKind::*;
        match self {
            GoogleSheets | Sheet | Excel | FacebookLeadAds | Webhook => NodeCategory::Input,
            AiCall | PreVerify | GoogleCalendar => NodeCategory::Processing,
            Condition => NodeCategory::Logic,
            SendWebhook | Email | Sms => NodeCategory::Action,
            Verified | DeadLead => NodeCategory::Terminal,
        }
    }

    /// The shared exchange all nodes of this kind publish through.
    pub fn exchange_name(&self) -> &'static str {
        use NodeKind::*;
        match self {
            GoogleSheets => "googleSheets",
            Sheet => "sheet",
            Excel => "excel",
            FacebookLeadAds => "facebookLeadAds",
            Webhook => "webhook",
            AiCall => "aiCall",
            PreVerify => "preVerify",
            GoogleCalendar => "googleCalendar",
            Condition => "condition",
            SendWebhook => "sendWebhook",
            Email => "email",
            Sms => "sms",
            Verified => "verified",
            DeadLead => "deadLead",
        }
    }

    /// Labels a multi-output kind may route on, in output order.
    pub fn branch_labels(&self) -> &'static [&'static str] {
        match self {
            NodeKind::AiCall | NodeKind::PreVerify => &["success", "fail"],
            NodeKind::Condition => &["true", "false"],
            _ => &[],
        }
    }

    pub fn output_count(&self) -> usize {
        self.branch_labels().len().max(1)
    }

    pub fn is_branching(&self) -> bool {
        self.output_count() > 1
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.exchange_name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    #[serde(alias = "type")]
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Worker-specific settings; opaque to the engine.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub settings: Map<String, Value>,
}

impl Node {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            label: None,
            settings: Map::new(),
        }
    }

    pub fn output_count(&self) -> usize {
        self.kind.output_count()
    }
}

/// An edge as drawn in the editor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub source: String,
    pub target: String,
    #[serde(default, alias = "sourceHandle", skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            branch: None,
        }
    }

    pub fn on(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }
}

/// Dispatch-ready form of an edge, stored denormalized on the flow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub source_node_id: String,
    pub target_node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_label: Option<String>,
}

/// What the editor submits on create/update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FlowDefinition {
    pub owner: String,
    pub name: String,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum FlowStatus {
    Deleted,
    Disabled,
    Active,
}

impl FlowStatus {
    pub fn code(&self) -> u8 {
        match self {
            FlowStatus::Deleted => 0,
            FlowStatus::Disabled => 1,
            FlowStatus::Active => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(FlowStatus::Deleted),
            1 => Some(FlowStatus::Disabled),
            2 => Some(FlowStatus::Active),
            _ => None,
        }
    }

    /// Disabled and Active switch freely and both may be deleted.
    /// Nothing leaves Deleted, and staying put is not a transition.
    pub fn can_transition_to(&self, next: FlowStatus) -> bool {
        use FlowStatus::*;
        matches!(
            (self, next),
            (Disabled, Active) | (Active, Disabled) | (Disabled, Deleted) | (Active, Deleted)
        )
    }
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowStatus::Deleted => f.write_str("deleted"),
            FlowStatus::Disabled => f.write_str("disabled"),
            FlowStatus::Active => f.write_str("active"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    pub id: String,
    pub owner: String,
    pub name: String,
    pub status: FlowStatus,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub routes: Vec<Route>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Flow {
    /// A fresh, Disabled flow. The definition must already be validated.
    pub fn new(id: impl Into<String>, def: FlowDefinition) -> Self {
        let now = Utc::now();
        let routes = derive_routes(&def.edges);
        Self {
            id: id.into(),
            owner: def.owner,
            name: def.name,
            status: FlowStatus::Disabled,
            nodes: def.nodes,
            edges: def.edges,
            routes,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    /// Distinct node kinds, in first-appearance order.
    pub fn kinds(&self) -> Vec<NodeKind> {
        let mut seen = HashSet::new();
        self.nodes
            .iter()
            .map(|n| n.kind)
            .filter(|k| seen.insert(*k))
            .collect()
    }

    pub fn queue_name(&self, node_id: &str) -> String {
        queue_name(&self.owner, &self.id, node_id)
    }
}

/// `{owner}.{flowId}.{nodeId}`: both the queue name and its routing key.
pub fn queue_name(owner: &str, flow_id: &str, node_id: &str) -> String {
    format!("{owner}.{flow_id}.{node_id}")
}

/// Identifiers end up as routing-key tokens, so they must be plain.
pub fn check_identifier(what: &str, id: &str) -> Result<(), EngineError> {
    if id.is_empty() {
        return Err(EngineError::validation(format!("{what} must not be empty")));
    }
    if id.chars().any(|c| c == '.' || c == '*' || c == '>' || c.is_whitespace()) {
        return Err(EngineError::validation(format!(
            "{what} `{id}` may not contain '.', '*', '>' or whitespace"
        )));
    }
    Ok(())
}

/// One route per distinct edge, in edge order.
pub fn derive_routes(edges: &[Edge]) -> Vec<Route> {
    let mut seen = HashSet::new();
    edges
        .iter()
        .map(|e| Route {
            source_node_id: e.source.clone(),
            target_node_id: e.target.clone(),
            branch_label: e.branch.clone(),
        })
        .filter(|r| seen.insert(r.clone()))
        .collect()
}

impl FlowDefinition {
    pub fn validate(&self) -> Result<(), EngineError> {
        check_identifier("owner", &self.owner)?;
        if self.name.trim().is_empty() {
            return Err(EngineError::validation("flow name must not be empty"));
        }
        if self.nodes.is_empty() {
            return Err(EngineError::validation(format!("flow `{}` has no nodes", self.name)));
        }

        // 1) node ids: unique and routing-key safe
        let mut graph = DiGraph::<&str, ()>::new();
        let mut index_of = HashMap::new();
        for node in &self.nodes {
            check_identifier("node id", &node.id)?;
            if index_of.contains_key(node.id.as_str()) {
                return Err(EngineError::validation(format!("duplicate node id `{}`", node.id)));
            }
            index_of.insert(node.id.as_str(), (graph.add_node(node.id.as_str()), node.kind));
        }

        // 2) edges: known endpoints, legal branch labels, no self-loops
        for edge in &self.edges {
            let (from, kind) = *index_of.get(edge.source.as_str()).ok_or_else(|| {
                EngineError::validation(format!("edge source `{}` is not a node", edge.source))
            })?;
            let (to, _) = *index_of.get(edge.target.as_str()).ok_or_else(|| {
                EngineError::validation(format!("edge target `{}` is not a node", edge.target))
            })?;
            if edge.source == edge.target {
                return Err(EngineError::validation(format!("node `{}` routes to itself", edge.source)));
            }
            if let Some(label) = &edge.branch {
                if !kind.branch_labels().contains(&label.as_str()) {
                    return Err(EngineError::validation(format!(
                        "`{label}` is not a branch of {kind} node `{}`",
                        edge.source
                    )));
                }
            }
            graph.add_edge(from, to, ());
        }

        // 3) a cycle would bounce a lead around forever
        if petgraph::algo::is_cyclic_directed(&graph) {
            return Err(EngineError::validation(format!("flow `{}` contains a cycle", self.name)));
        }
        Ok(())
    }
}

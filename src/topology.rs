// src/topology.rs

use std::sync::Arc;

use futures::future::try_join_all;
use tracing::{debug, info};

use crate::broker::{Broker, BrokerError, ExchangeKind};
use crate::flow::Flow;

/// Materializes flows as broker topology: one shared direct exchange per
/// node kind, one private queue per (owner, flow, node).
#[derive(Clone, Debug)]
pub struct TopologyManager {
    broker: Arc<dyn Broker>,
}

impl TopologyManager {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Idempotent; overlapping calls for flows sharing node kinds are fine.
    pub async fn create_topology(&self, flow: &Flow) -> Result<(), BrokerError> {
        // 1) shared exchanges, one per kind
        try_join_all(
            flow.kinds()
                .into_iter()
                .map(|kind| self.broker.assert_exchange(kind.exchange_name(), ExchangeKind::Direct)),
        )
        .await?;

        // 2) a queue per node, bound with its own name as routing key
        try_join_all(flow.nodes.iter().map(|node| async move {
            let queue = flow.queue_name(&node.id);
            self.broker.assert_queue(&queue).await?;
            self.broker
                .bind_queue(&queue, node.kind.exchange_name(), &queue)
                .await?;
            debug!("queue {} bound to {}", queue, node.kind);
            Ok::<_, BrokerError>(())
        }))
        .await?;

        info!(
            "topology ready for flow {} ({} queue(s))",
            flow.id,
            flow.nodes.len()
        );
        Ok(())
    }

    /// Removes the flow's queues. Exchanges stay: other flows may use them.
    pub async fn teardown_topology(&self, flow: &Flow) -> Result<(), BrokerError> {
        try_join_all(flow.nodes.iter().map(|node| async move {
            let queue = flow.queue_name(&node.id);
            self.broker
                .unbind_queue(&queue, node.kind.exchange_name(), &queue)
                .await?;
            self.broker.delete_queue(&queue).await
        }))
        .await?;
        info!("topology removed for flow {}", flow.id);
        Ok(())
    }

    /// The fixed dead-letter destination, shared by every flow.
    pub async fn ensure_dead_letter(&self, exchange: &str, queue: &str) -> Result<(), BrokerError> {
        self.broker.assert_exchange(exchange, ExchangeKind::Direct).await?;
        self.broker.assert_queue(queue).await?;
        self.broker.bind_queue(queue, exchange, queue).await
    }
}

//! Outbound contract towards the message broker.
//!
//! The engine only ever needs direct exchanges, durable queues, bindings
//! and fire-and-confirm publishing; everything else about the broker is
//! the adapter's business.

pub mod handle;
pub mod memory;
pub mod nats;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use handle::BrokerHandle;
pub use memory::InMemoryBroker;
pub use nats::NatsBroker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Delivers to queues bound with exactly the message's routing key.
    Direct,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKind::Direct => f.write_str("direct"),
        }
    }
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unreachable: {0}")]
    Unavailable(String),
    #[error("exchange `{0}` does not exist")]
    UnknownExchange(String),
    #[error("queue `{0}` does not exist")]
    UnknownQueue(String),
    #[error("publish to `{exchange}` with key `{routing_key}` failed: {reason}")]
    Publish {
        exchange: String,
        routing_key: String,
        reason: String,
    },
    #[error("broker connection is closed")]
    Closed,
    #[error("could not encode payload: {0}")]
    Encode(String),
}

/// Durable, at-least-once broker operations. Every assert/delete is
/// idempotent and safe to race with an identical call.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn assert_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError>;

    async fn assert_queue(&self, name: &str) -> Result<(), BrokerError>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError>;

    async fn unbind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError>;

    /// Deleting a queue that does not exist is not an error.
    async fn delete_queue(&self, name: &str) -> Result<(), BrokerError>;

    async fn publish(&self, exchange: &str, routing_key: &str, payload: Vec<u8>) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    fn name(&self) -> &'static str;
}

impl fmt::Debug for dyn Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker").field("impl", &self.name()).finish()
    }
}

//! NATS JetStream adapter.
//!
//! JetStream has no exchanges, so the mapping is:
//! - an exchange is a subject prefix (`{exchange}.`),
//! - a queue is a durable file-backed stream (`.` replaced by `_` in its name),
//! - a binding adds the subject `{exchange}.{routing_key}` to the queue's stream,
//! - publish goes to `{exchange}.{routing_key}` and waits for the stream ack.

use std::time::Duration;

use async_nats::jetstream::{self, stream};
use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use super::{Broker, BrokerError, ExchangeKind};

pub struct NatsBroker {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    exchanges: DashMap<String, ExchangeKind>,
}

impl std::fmt::Debug for NatsBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsBroker")
            .field("exchanges", &self.exchanges.len())
            .finish()
    }
}

impl NatsBroker {
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, BrokerError> {
        info!("connecting to NATS at {}", url);
        let client = async_nats::ConnectOptions::new()
            .name("leadflow")
            .connection_timeout(timeout)
            .connect(url)
            .await
            .map_err(|e| BrokerError::Unavailable(format!("failed to connect to {url}: {e}")))?;
        let jetstream = jetstream::new(client.clone());
        Ok(Self {
            client,
            jetstream,
            exchanges: DashMap::new(),
        })
    }

    fn binding_subject(exchange: &str, routing_key: &str) -> String {
        format!("{exchange}.{routing_key}")
    }

    async fn queue_stream(&self, queue: &str) -> Result<stream::Stream, BrokerError> {
        self.jetstream
            .get_stream(stream_name(queue))
            .await
            .map_err(|e| match e.kind() {
                jetstream::context::GetStreamErrorKind::JetStream(_) => BrokerError::UnknownQueue(queue.to_string()),
                _ => BrokerError::Unavailable(e.to_string()),
            })
    }

    async fn update_subjects(
        &self,
        queue: &str,
        edit: impl FnOnce(&mut Vec<String>) -> bool,
    ) -> Result<(), BrokerError> {
        let stream = self.queue_stream(queue).await?;
        let mut config = stream.cached_info().config.clone();
        if !edit(&mut config.subjects) {
            return Ok(());
        }
        self.jetstream
            .update_stream(&config)
            .await
            .map_err(|e| BrokerError::Unavailable(format!("failed to update stream for {queue}: {e}")))?;
        Ok(())
    }
}

/// JetStream stream names may not contain `.`.
pub fn stream_name(queue: &str) -> String {
    queue.replace('.', "_")
}

#[async_trait]
impl Broker for NatsBroker {
    async fn assert_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        self.exchanges.entry(name.to_string()).or_insert(kind);
        Ok(())
    }

    async fn assert_queue(&self, name: &str) -> Result<(), BrokerError> {
        self.jetstream
            .get_or_create_stream(stream::Config {
                name: stream_name(name),
                storage: stream::StorageType::File,
                retention: stream::RetentionPolicy::WorkQueue,
                ..Default::default()
            })
            .await
            .map_err(|e| BrokerError::Unavailable(format!("failed to assert queue {name}: {e}")))?;
        debug!("asserted stream for queue {}", name);
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError> {
        if !self.exchanges.contains_key(exchange) {
            return Err(BrokerError::UnknownExchange(exchange.to_string()));
        }
        let subject = Self::binding_subject(exchange, routing_key);
        self.update_subjects(queue, |subjects| {
            if subjects.contains(&subject) {
                false
            } else {
                subjects.push(subject.clone());
                true
            }
        })
        .await
    }

    async fn unbind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError> {
        let subject = Self::binding_subject(exchange, routing_key);
        match self
            .update_subjects(queue, |subjects| {
                let before = subjects.len();
                subjects.retain(|s| s != &subject);
                subjects.len() != before
            })
            .await
        {
            Err(BrokerError::UnknownQueue(_)) => Ok(()),
            other => other,
        }
    }

    async fn delete_queue(&self, name: &str) -> Result<(), BrokerError> {
        let stream = stream_name(name);
        if self.jetstream.get_stream(&stream).await.is_err() {
            return Ok(());
        }
        self.jetstream
            .delete_stream(&stream)
            .await
            .map_err(|e| BrokerError::Unavailable(format!("failed to delete queue {name}: {e}")))?;
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let subject = format!("{exchange}.{routing_key}");
        let publish_error = |reason: String| BrokerError::Publish {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            reason,
        };
        self.jetstream
            .publish(subject, payload.into())
            .await
            .map_err(|e| publish_error(e.to_string()))?
            .await
            .map_err(|e| publish_error(format!("not acknowledged: {e}")))?;
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if let Err(e) = self.client.flush().await {
            warn!("flush on close failed: {}", e);
            return Err(BrokerError::Unavailable(e.to_string()));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "nats"
    }
}

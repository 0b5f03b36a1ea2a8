// src/broker/handle.rs

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::OnceCell;
use tracing::info;

use super::{Broker, BrokerError, ExchangeKind, InMemoryBroker, NatsBroker};

type Connector = Arc<dyn Fn() -> BoxFuture<'static, Result<Arc<dyn Broker>, BrokerError>> + Send + Sync>;

/// The process-wide broker connection. Constructed once at start-up and
/// injected wherever broker access is needed; the connection itself is
/// opened on first use and only ever once, even when many tasks race for it.
#[derive(Clone)]
pub struct BrokerHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    cell: OnceCell<Arc<dyn Broker>>,
    connector: Connector,
}

impl fmt::Debug for BrokerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerHandle")
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl BrokerHandle {
    /// `connector` runs at most once successfully; a failed attempt leaves
    /// the handle unconnected so the next call tries again.
    pub fn lazy<F, Fut>(connector: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Arc<dyn Broker>, BrokerError>> + Send + 'static,
    {
        let connector: Connector = Arc::new(move || Box::pin(connector()));
        Self {
            inner: Arc::new(HandleInner {
                cell: OnceCell::new(),
                connector,
            }),
        }
    }

    pub fn nats(url: impl Into<String>, timeout: Duration) -> Self {
        let url = url.into();
        Self::lazy(move || {
            let url = url.clone();
            async move {
                let broker = NatsBroker::connect(&url, timeout).await?;
                Ok(Arc::new(broker) as Arc<dyn Broker>)
            }
        })
    }

    /// A handle that is connected from the start.
    pub fn ready(broker: Arc<InMemoryBroker>) -> Self {
        let broker: Arc<dyn Broker> = broker;
        Self {
            inner: Arc::new(HandleInner {
                cell: OnceCell::new_with(Some(broker.clone())),
                connector: Arc::new(move || {
                    let broker = broker.clone();
                    Box::pin(async move { Ok(broker) })
                }),
            }),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.cell.initialized()
    }

    pub async fn get(&self) -> Result<Arc<dyn Broker>, BrokerError> {
        let broker = self
            .inner
            .cell
            .get_or_try_init(|| async {
                let broker = (self.inner.connector)().await?;
                info!("broker connection established ({})", broker.name());
                Ok::<_, BrokerError>(broker)
            })
            .await?;
        Ok(broker.clone())
    }
}

#[async_trait]
impl Broker for BrokerHandle {
    async fn assert_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        self.get().await?.assert_exchange(name, kind).await
    }

    async fn assert_queue(&self, name: &str) -> Result<(), BrokerError> {
        self.get().await?.assert_queue(name).await
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError> {
        self.get().await?.bind_queue(queue, exchange, routing_key).await
    }

    async fn unbind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError> {
        self.get().await?.unbind_queue(queue, exchange, routing_key).await
    }

    async fn delete_queue(&self, name: &str) -> Result<(), BrokerError> {
        self.get().await?.delete_queue(name).await
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.get().await?.publish(exchange, routing_key, payload).await
    }

    /// Closing a handle that never connected does nothing.
    async fn close(&self) -> Result<(), BrokerError> {
        match self.inner.cell.get() {
            Some(broker) => {
                info!("closing broker connection");
                broker.close().await
            }
            None => Ok(()),
        }
    }

    fn name(&self) -> &'static str {
        self.inner.cell.get().map(|b| b.name()).unwrap_or("unconnected")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn concurrent_first_use_connects_once() {
        let connects = Arc::new(AtomicUsize::new(0));
        let counter = connects.clone();
        let handle = BrokerHandle::lazy(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(Arc::new(InMemoryBroker::new()) as Arc<dyn Broker>)
            }
        });

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let handle = handle.clone();
                tokio::spawn(async move { handle.assert_queue(&format!("q{i}")).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert!(handle.is_connected());
    }

    #[tokio::test]
    async fn failed_connect_is_retried_on_next_use() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let handle = BrokerHandle::lazy(move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(BrokerError::Unavailable("refused".into()))
                } else {
                    Ok(Arc::new(InMemoryBroker::new()) as Arc<dyn Broker>)
                }
            }
        });

        assert!(matches!(handle.assert_queue("q").await, Err(BrokerError::Unavailable(_))));
        assert!(!handle.is_connected());
        handle.assert_queue("q").await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn ready_handle_shares_the_broker() {
        let memory = Arc::new(InMemoryBroker::new());
        let handle = BrokerHandle::ready(memory.clone());
        assert!(handle.is_connected());
        handle.assert_queue("shared").await.unwrap();
        assert!(memory.has_queue("shared"));
        handle.close().await.unwrap();
    }
}
